//! WebSocket upgrade and per-connection plumbing. The session manager owns the
//! timer; this module only moves frames between it and the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{SessionManager, SessionOptions};
use crate::state::AppState;
use crate::types::Frame;

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub interval: Option<String>,
    pub persist: Option<String>,
}

impl StreamParams {
    pub fn options(&self, manager: &SessionManager) -> SessionOptions {
        SessionOptions {
            interval: manager.bounds().resolve(self.interval.as_deref()),
            persist: persist_requested(self.persist.as_deref()),
        }
    }
}

fn persist_requested(v: Option<&str>) -> bool {
    !matches!(v.map(str::trim), Some("0") | Some("false") | Some("no"))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<StreamParams>,
) -> Response {
    if !state.sessions.is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let opts = q.options(&state.sessions);
    ws.on_upgrade(move |socket| handle_socket(socket, state.sessions, opts))
}

async fn handle_socket(socket: WebSocket, sessions: SessionManager, opts: SessionOptions) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(1);

    let Some(id) = sessions.open(opts, tx).await else {
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    let writer = async {
        while let Some(frame) = rx.recv().await {
            let js = match serde_json::to_string(&frame) {
                Ok(js) => js,
                Err(e) => {
                    warn!(session = id, "failed to encode frame: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(js)).await {
                debug!(session = id, "socket write failed: {e}");
                break;
            }
        }
        // timer stopped (closed or shutdown): say goodbye
        let _ = sink.send(Message::Close(None)).await;
    };

    // No client protocol beyond the handshake; just watch for close or error.
    let reader = async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session = id, "socket read failed: {e}");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    // may already be gone if the timer noticed first
    sessions.close(id).await;
}
