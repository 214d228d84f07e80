use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sketchroom_shared::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RoomError;
use crate::logic::ConnectionSession;
use crate::rooms::{join_room, normalize_room_id};
use crate::state::AppState;

pub async fn root_handler() -> &'static str {
    "Sketchroom server - connect via WebSocket at /ws"
}

pub async fn health_handler() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    #[serde(default)]
    room_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomResponse {
    success: bool,
    room_id: String,
    created_at: DateTime<Utc>,
    is_new_room: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfoResponse {
    success: bool,
    room_id: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    drawing_command_count: usize,
}

#[derive(Serialize)]
struct FailureResponse {
    success: bool,
    message: String,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(FailureResponse {
            success: false,
            message: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            RoomError::InvalidLength | RoomError::InvalidCharacters => {
                failure(StatusCode::BAD_REQUEST, message)
            }
            RoomError::Storage(error) => {
                error!(%error, "room request failed");
                failure(StatusCode::INTERNAL_SERVER_ERROR, "Server error while joining room")
            }
        }
    }
}

pub async fn join_room_handler(
    State(state): State<AppState>,
    Json(request): Json<JoinRoomRequest>,
) -> Result<Response, RoomError> {
    let joined = join_room(&state, &request.room_id).await?;
    Ok(Json(JoinRoomResponse {
        success: true,
        room_id: joined.summary.room_id,
        created_at: joined.summary.created_at,
        is_new_room: joined.is_new_room,
    })
    .into_response())
}

pub async fn room_info_handler(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Ok(room_id) = normalize_room_id(&room_id) else {
        return failure(StatusCode::NOT_FOUND, "Room not found");
    };
    match state.store.find(&room_id).await {
        Ok(Some(summary)) => Json(RoomInfoResponse {
            success: true,
            room_id: summary.room_id,
            created_at: summary.created_at,
            last_activity: summary.last_activity,
            drawing_command_count: summary.command_count,
        })
        .into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Room not found"),
        Err(error) => {
            error!(room = %room_id, %error, "failed to read room info");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Server error while getting room info")
        }
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn decode_frame(message: &Message) -> Option<ClientMessage> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str::<ClientMessage>(text),
        Message::Binary(data) => serde_json::from_slice::<ClientMessage>(data),
        _ => return None,
    };
    match parsed {
        Ok(client_message) => Some(client_message),
        Err(error) => {
            debug!(%error, "dropping malformed frame");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut socket_sender, mut socket_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = Uuid::new_v4();
    state.broadcaster.connect(connection_id, tx);
    info!(conn = %connection_id, "WS connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(payload) => {
                    if socket_sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(conn = %connection_id, kind = message.kind(), %error, "failed to encode message"),
            }
        }
    });

    let mut session = ConnectionSession::new(connection_id);
    while let Some(frame) = socket_receiver.next().await {
        match frame {
            Ok(Message::Close(close_frame)) => {
                if let Some(frame) = &close_frame {
                    debug!(conn = %connection_id, code = frame.code, reason = %frame.reason, "WS close frame");
                }
                break;
            }
            Ok(message) => {
                if let Some(client_message) = decode_frame(&message) {
                    session.apply(&state, client_message).await;
                }
            }
            Err(error) => {
                warn!(conn = %connection_id, %error, "WS receive failed");
                break;
            }
        }
    }

    debug!(
        conn = %connection_id,
        room = ?session.room_id(),
        owner = ?session.owner_id(),
        drawing = session.is_drawing(),
        "WS closing"
    );
    session.disconnect(&state).await;
    send_task.abort();
    info!(conn = %connection_id, "WS disconnected");
}
