//! WebSocket upgrade and registration.
//!
//! A connection must present a valid `Register` envelope as its very first
//! frame; anything else closes the transport. Once registered, the
//! confirmation is queued, the session is handed to the hub, and the reader
//! and writer pumps take over until either side gives up.

use crate::config::Config;
use crate::http::AppState;
use crate::session::{self, Session, OUTBOUND_CAPACITY};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use semaphore_core::envelope::{Envelope, Kind, Registration, MAX_MESSAGE_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// `GET /ws`: check the origin policy and upgrade.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config, origin) {
        warn!(remote = %addr, origin = origin.unwrap_or_default(), "origin refused");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(MAX_MESSAGE_BYTES)
        .max_frame_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Exact-match whitelist. Requests without an `Origin` header are allowed:
/// only browser contexts send one, and native clients have no origin to
/// assert.
fn origin_allowed(config: &Config, origin: Option<&str>) -> bool {
    if config.disable_origin_check {
        return true;
    }
    match origin {
        None => true,
        Some(origin) => config.allowed_origins.iter().any(|allowed| allowed == origin),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (sink, mut stream) = socket.split();

    let registration_deadline = Duration::from_secs(state.config.connection_timeout);
    let device_id = match timeout(registration_deadline, read_registration(&mut stream)).await {
        Ok(Some(device_id)) => device_id,
        Ok(None) => return,
        Err(_) => {
            debug!(remote = %addr, "registration deadline expired");
            return;
        }
    };
    info!(remote = %addr, device = %device_id, "client connected");

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let session = Arc::new(Session::new(device_id, outbound_tx, state.hub.clone()));

    // The confirmation goes into the fresh queue before the hub learns about
    // the session, so it is the first envelope the writer ever emits.
    session.send(&Envelope::registered("registration successful"));
    state.hub.register(Arc::clone(&session)).await;

    let mut writer = tokio::spawn(session::write_pump(sink, outbound_rx));
    tokio::select! {
        _ = session.read_pump(&mut stream) => {}
        _ = &mut writer => {
            debug!(device = %session.id(), "writer stopped first");
        }
    }

    state.hub.unregister(Arc::clone(&session)).await;
    info!(remote = %addr, device = %session.id(), "client disconnected");
}

/// Read the mandatory first envelope. Returns the device ID, or `None` if
/// the client sent anything other than a well-formed registration.
async fn read_registration(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => {
                let envelope = match Envelope::from_text(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "unreadable registration envelope");
                        return None;
                    }
                };
                if envelope.kind != Kind::Register {
                    warn!(kind = envelope.kind.as_str(), "first envelope must be Register");
                    return None;
                }
                let registration: Registration = match envelope.decode() {
                    Ok(registration) => registration,
                    Err(e) => {
                        warn!(error = %e, "malformed registration payload");
                        return None;
                    }
                };
                if registration.device_id.is_empty() {
                    warn!("registration with empty device id");
                    return None;
                }
                return Some(registration.device_id);
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "transport error before registration");
                return None;
            }
        }
    }
}
