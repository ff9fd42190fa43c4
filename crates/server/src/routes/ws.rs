//! WebSocket transport: one socket is one project connection.
//!
//! Identity comes from the fronting auth proxy:
//!
//! | Header                 | Query fallback | Meaning                               |
//! |------------------------|----------------|---------------------------------------|
//! | `x-devcell-user`       | `user`         | user id (required)                    |
//! | `x-devcell-owner`      | `owner`        | `true`/`false`, owner of the project  |
//! | `x-devcell-repo-token` | none           | repository credential to store        |
//!
//! Frames are handled concurrently; each one gets exactly one ack.

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use devcell_core::Connection;
use devcell_session::{ServerEvent, ServerMessage, SessionDispatcher};

use crate::error::ApiErr;

pub const USER_HEADER: &str = "x-devcell-user";
pub const OWNER_HEADER: &str = "x-devcell-owner";
pub const REPO_TOKEN_HEADER: &str = "x-devcell-repo-token";

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub user: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_owner: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

impl Identity {
    /// Headers win over query parameters; a missing owner flag means
    /// collaborator.
    pub fn extract(headers: &HeaderMap, query: &WsQuery) -> Result<Self, ApiErr> {
        let user_id = header(headers, USER_HEADER)
            .or(query.user.as_deref().map(str::trim).filter(|u| !u.is_empty()))
            .ok_or_else(|| ApiErr::unauthorized("missing user identity"))?
            .to_string();
        let is_owner = match header(headers, OWNER_HEADER).or(query.owner.as_deref()) {
            Some(raw) => parse_flag(raw)
                .ok_or_else(|| ApiErr::bad_request(format!("invalid owner flag: {raw:?}")))?,
            None => false,
        };
        Ok(Self { user_id, is_owner })
    }
}

/// `GET /api/projects/{project_id}/ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(dispatcher): State<SessionDispatcher>,
    Path(project_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiErr> {
    let identity = Identity::extract(&headers, &query)?;
    if let Some(token) = header(&headers, REPO_TOKEN_HEADER) {
        dispatcher
            .sync()
            .set_user_token(&identity.user_id, token)
            .map_err(ApiErr::from_store("store repository token"))?;
    }
    let conn = Connection::new(identity.user_id, project_id, identity.is_owner);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, dispatcher, conn)))
}

fn text(message: &ServerMessage) -> Message {
    Message::Text(message.to_json().into())
}

/// Outgoing messages funnel through one channel so session tasks can push
/// events without holding the socket.
async fn handle_socket(socket: WebSocket, dispatcher: SessionDispatcher, conn: Connection) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    if let Err(e) = dispatcher.connect(&conn, tx.clone()).await {
        warn!(
            project_id = %conn.project_id,
            user_id = %conn.user_id,
            error = %e,
            "connection rejected"
        );
        let refusal = ServerMessage::Event(ServerEvent::Disconnect {
            reason: e.to_string(),
        });
        let _ = sink.send(text(&refusal)).await;
        let _ = sink.close().await;
        return;
    }

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, ServerMessage::Event(ServerEvent::Disconnect { .. }));
            if sink.send(text(&message)).await.is_err() {
                break;
            }
            if closing {
                let _ = sink.close().await;
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(frame) => {
                let dispatcher = dispatcher.clone();
                let conn = conn.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let reply = dispatcher.handle_text(&conn, frame.as_str()).await;
                    let _ = tx.send(reply);
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(connection_id = %conn.connection_id, "socket closed");
    dispatcher.disconnect(&conn);
    send_task.abort();
}
