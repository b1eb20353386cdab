//! HTTP and WebSocket handlers over [`ServerState`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::broadcast;

use crate::state::{DirError, ServerState};
use crate::types::{ApiError, BlockPut, DirEntry, SetTimeRequest, UserKeyRecord, WatchEvent};

impl IntoResponse for DirError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            "not-exist" => StatusCode::NOT_FOUND,
            "exist" | "not-empty" => StatusCode::CONFLICT,
            "permission" | "private" => StatusCode::FORBIDDEN,
            "not-supported" => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = Json(ApiError { kind: self.kind.to_string(), msg: self.msg });
        (status, body).into_response()
    }
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn lookup(State(st): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    match st.lookup(&path) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn put_entry(
    State(st): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Json(entry): Json<DirEntry>,
) -> Response {
    match st.put(&path, entry) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_entry(State(st): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    match st.delete(&path) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn list_dir(State(st): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    match st.list(&path) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn rename(
    State(st): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
    Json(entry): Json<DirEntry>,
) -> Response {
    let (Some(from), Some(to)) = (params.get("from"), params.get("to")) else {
        return DirError { kind: "invalid", msg: "missing from/to".into() }.into_response();
    };
    match st.rename(from, to, entry) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn set_time(
    State(st): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Json(req): Json<SetTimeRequest>,
) -> Response {
    match st.set_time(&path, req.mtime) {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn access(
    State(st): State<Arc<ServerState>>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user = params.get("user").cloned().unwrap_or_default();
    Json(st.access(&path, &user)).into_response()
}

pub async fn put_block(State(st): State<Arc<ServerState>>, body: Bytes) -> Response {
    let reference = st.put_block(body);
    Json(BlockPut { reference }).into_response()
}

pub async fn get_block(State(st): State<Arc<ServerState>>, Path(reference): Path<String>) -> Response {
    match st.get_block(&reference) {
        Some(data) => data.into_response(),
        None => DirError { kind: "not-exist", msg: reference }.into_response(),
    }
}

pub async fn get_key(State(st): State<Arc<ServerState>>, Path(user): Path<String>) -> Response {
    match st.get_key(&user) {
        Some(rec) => Json(rec).into_response(),
        None => DirError { kind: "not-exist", msg: user }.into_response(),
    }
}

pub async fn put_key(
    State(st): State<Arc<ServerState>>,
    Path(user): Path<String>,
    Json(mut rec): Json<UserKeyRecord>,
) -> Response {
    rec.user = user;
    st.put_key(rec);
    StatusCode::OK.into_response()
}

/// Watch upgrade. With watch disabled the endpoint answers not-supported;
/// a numeric sequence ahead of the root's counter is answered with an
/// "invalid" error event so the client restarts from "new".
pub async fn watch(
    State(st): State<Arc<ServerState>>,
    Path(root): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !st.config.watch_supported {
        return DirError { kind: "not-supported", msg: "watch disabled".into() }.into_response();
    }
    let sequence = params.get("sequence").cloned().unwrap_or_else(|| "new".to_string());
    ws.on_upgrade(move |socket| watch_stream(st, root, sequence, socket))
}

async fn watch_stream(st: Arc<ServerState>, root: String, sequence: String, mut socket: WebSocket) {
    if let Ok(n) = sequence.parse::<i64>() {
        if n > st.current_sequence(&root) {
            let ev = WatchEvent {
                entry: crate::state::direntry_for_root(&root),
                delete: false,
                error: Some("invalid".to_string()),
            };
            let _ = socket.send(Message::Text(serde_json::to_string(&ev).unwrap())).await;
            return;
        }
        // No event log is kept; an old numeric sequence degrades to "new".
    }

    let mut rx = st.subscribe(&root);
    tracing::debug!(root = %root, "watch stream open");
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            event = rx.recv() => match event {
                Ok(ev) => {
                    let text = serde_json::to_string(&ev).unwrap();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(root = %root, missed = n, "watch subscriber lagged");
                    let ev = WatchEvent {
                        entry: crate::state::direntry_for_root(&root),
                        delete: false,
                        error: Some("invalid".to_string()),
                    };
                    if socket.send(Message::Text(serde_json::to_string(&ev).unwrap())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    tracing::debug!(root = %root, "watch stream closed");
}
