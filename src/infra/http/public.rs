use std::{
    io::ErrorKind,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{
    Router,
    body::Body,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{
        HeaderValue, StatusCode, Uri,
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    application::{
        error::ErrorReport,
        session::{ConnId, SessionHandle},
    },
    domain::messages::{Envelope, STORAGE_URL_PREFIX},
    infra::storage::{StorageArea, StorageError},
};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub session: SessionHandle,
    /// Public directory served at the site root (index page, viewer assets).
    pub assets: Arc<StorageArea>,
    /// Storage directory holding rendered PDFs, served under /storage/.
    pub storage: Arc<StorageArea>,
    pub shutdown: CancellationToken,
    next_conn: Arc<AtomicU64>,
}

impl HttpState {
    pub fn new(
        session: SessionHandle,
        assets: Arc<StorageArea>,
        storage: Arc<StorageArea>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session,
            assets,
            storage,
            shutdown,
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        ConnId::new(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route(
            &format!("{STORAGE_URL_PREFIX}/{{*path}}"),
            get(serve_storage),
        )
        .route("/_health", get(health))
        .fallback(serve_asset)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn ws_upgrade(State(state): State<HttpState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection transport task: forwards decoded frames into the session
/// queue and drains the connection's outbox back onto the wire. All shared
/// state stays behind the session handle.
async fn handle_socket(state: HttpState, socket: WebSocket) {
    const TARGET: &str = "cartiera::http::ws";

    let conn = state.next_conn_id();
    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();

    // The writer ends when the registry drops the outbox sender during
    // unregistration.
    let writer = tokio::spawn(async move {
        while let Some(reply) = outbox_rx.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(err) => {
                    error!(target: TARGET, error = %err, "failed to encode reply");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    state.session.client_opened(conn, outbox_tx);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => state.session.inbound(conn, text.to_string()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: TARGET, %conn, error = %err, "read error");
                    break;
                }
            },
        }
    }

    state.session.client_closed(conn);
    let _ = writer.await;
}

async fn serve_storage(State(state): State<HttpState>, Path(path): Path<String>) -> Response {
    const SOURCE: &str = "infra::http::public::serve_storage";

    match state.storage.read(&path).await {
        // Output names are unique, so storage responses can be immutable.
        Ok(bytes) => build_file_response(&path, bytes, "public, max-age=31536000, immutable"),
        Err(err) => file_error_response(SOURCE, err),
    }
}

async fn serve_asset(State(state): State<HttpState>, uri: Uri) -> Response {
    const SOURCE: &str = "infra::http::public::serve_asset";

    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match state.assets.read(path).await {
        Ok(bytes) => build_file_response(path, bytes, "public, max-age=3600"),
        Err(err) => file_error_response(SOURCE, err),
    }
}

fn build_file_response(path: &str, bytes: Bytes, cache_control: &'static str) -> Response {
    let mut response = Response::new(Body::from(bytes.clone()));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&bytes.len().to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));

    response
}

fn file_error_response(source: &'static str, err: StorageError) -> Response {
    match err {
        StorageError::InvalidPath => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_message(
                source,
                StatusCode::NOT_FOUND,
                "Requested path escapes the served directory",
            )
            .attach(&mut response);
            response
        }
        StorageError::Io(err) if err.kind() == ErrorKind::NotFound => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_message(source, StatusCode::NOT_FOUND, "File not found")
                .attach(&mut response);
            response
        }
        StorageError::Io(err) => {
            let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
            ErrorReport::from_error(source, StatusCode::INTERNAL_SERVER_ERROR, &err)
                .attach(&mut response);
            response
        }
    }
}
