use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use sketchroom_shared::room_format::{decode_room_file, encode_room_file, RoomFileData};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::StorageError;

/// A room known to the durable backend, as seen by the sweeper.
#[derive(Clone, Debug)]
pub struct StoredRoom {
    pub room_id: String,
    pub last_activity: DateTime<Utc>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// `Ok(None)` when the backend has never seen the room.
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomFileData>, StorageError>;
    async fn save_room(&self, data: &RoomFileData) -> Result<(), StorageError>;
    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError>;
    async fn list_rooms(&self) -> Result<Vec<StoredRoom>, StorageError>;
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub struct FileStorage {
    room_dir: PathBuf,
}

impl FileStorage {
    pub fn new(room_dir: PathBuf) -> Self {
        Self { room_dir }
    }

    fn room_path(&self, room_id: &str) -> PathBuf {
        self.room_dir.join(format!("{room_id}.bin"))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomFileData>, StorageError> {
        match tokio::fs::read(self.room_path(room_id)).await {
            Ok(payload) => Ok(Some(decode_room_file(&payload)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn save_room(&self, data: &RoomFileData) -> Result<(), StorageError> {
        let payload = encode_room_file(data)?;
        let path = self.room_path(&data.room_id);
        let partial = path.with_extension("bin.tmp");
        tokio::fs::write(&partial, payload).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.room_path(room_id)).await {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }

    async fn list_rooms(&self) -> Result<Vec<StoredRoom>, StorageError> {
        let mut rooms = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.room_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            let payload = tokio::fs::read(&path).await?;
            match decode_room_file(&payload) {
                Ok(data) => rooms.push(StoredRoom {
                    room_id: data.room_id,
                    last_activity: millis_to_datetime(data.last_activity_ms),
                }),
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable room file"),
            }
        }
        Ok(rooms)
    }
}

#[derive(Clone, Debug)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3StorageConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            region: None,
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

pub struct S3Storage {
    bucket: String,
    prefix: String,
    client: Client,
}

impl S3Storage {
    pub async fn new(config: S3StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let (Some(access_key_id), Some(secret_access_key)) = (
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
        ) {
            let creds = Credentials::new(access_key_id, secret_access_key, None, None, "static");
            loader = loader.credentials_provider(creds);
        }
        if let Some(region) = config.region.clone() {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint_url) = config.endpoint_url.as_ref() {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        let prefix = config
            .prefix
            .unwrap_or_default()
            .trim_matches('/')
            .to_string();
        Self {
            bucket: config.bucket,
            prefix,
            client,
        }
    }

    fn object_key(&self, room_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("{room_id}.bin")
        } else {
            format!("{}/{room_id}.bin", self.prefix)
        }
    }

    fn room_id_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let name = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };
        name.strip_suffix(".bin").filter(|id| !id.contains('/'))
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomFileData>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(room_id))
            .send()
            .await;
        let output = match response {
            Ok(output) => output,
            Err(error) => {
                if let Some(service_error) = error.as_service_error() {
                    if service_error.is_no_such_key() {
                        return Ok(None);
                    }
                }
                return Err(StorageError::S3(format!(
                    "failed to load room {room_id}: {error:?}"
                )));
            }
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(format!("failed to read room {room_id}: {e:?}")))?
            .into_bytes();
        Ok(Some(decode_room_file(&bytes)?))
    }

    async fn save_room(&self, data: &RoomFileData) -> Result<(), StorageError> {
        let payload = encode_room_file(data)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(&data.room_id))
            .body(ByteStream::from(payload))
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("failed to save room {}: {e:?}", data.room_id)))?;
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(room_id))
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("failed to delete room {room_id}: {e:?}")))?;
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<StoredRoom>, StorageError> {
        let mut rooms = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(format!("{}/", self.prefix));
            }
            let output = request
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3(format!("failed to list rooms: {e:?}")))?;
            for object in output.contents() {
                let Some(room_id) = object.key().and_then(|key| self.room_id_from_key(key)) else {
                    continue;
                };
                // Objects are rewritten on every flush, so the modification
                // time trails the last mutation by at most one flush interval.
                let last_activity = object
                    .last_modified()
                    .and_then(|modified| modified.to_millis().ok())
                    .map(millis_to_datetime)
                    .unwrap_or_default();
                rooms.push(StoredRoom {
                    room_id: room_id.to_string(),
                    last_activity,
                });
            }
            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(rooms)
    }
}

/// Keeps rooms in process memory. Used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStorage {
    rooms: RwLock<HashMap<String, RoomFileData>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with `StorageError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_room(&self, room_id: &str) -> Result<Option<RoomFileData>, StorageError> {
        self.check()?;
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn save_room(&self, data: &RoomFileData) -> Result<(), StorageError> {
        self.check()?;
        self.rooms
            .write()
            .await
            .insert(data.room_id.clone(), data.clone());
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError> {
        self.check()?;
        self.rooms.write().await.remove(room_id);
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<StoredRoom>, StorageError> {
        self.check()?;
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .map(|data| StoredRoom {
                room_id: data.room_id.clone(),
                last_activity: millis_to_datetime(data.last_activity_ms),
            })
            .collect())
    }
}
