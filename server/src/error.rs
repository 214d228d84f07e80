use sketchroom_shared::room_format::RoomFileError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("room file error: {0}")]
    Format(#[from] RoomFileError),

    #[error("s3 error: {0}")]
    S3(String),

    #[error("storage backend unavailable")]
    Unavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room ID must be 6-8 alphanumeric characters")]
    InvalidLength,

    #[error("Room ID must contain only letters and numbers")]
    InvalidCharacters,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}
