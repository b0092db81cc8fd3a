//! The hub: single-writer registry and router.
//!
//! One event loop owns every mutation of the client registry. Sessions talk
//! to it through three channels (register, unregister, route) and never touch
//! the map directly; observers read it under the lock. This gives
//! linearizable register/unregister/route ordering and FIFO delivery into
//! each destination queue without per-entry locking.

use crate::session::{EnqueueError, Session};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

/// A routing request: one serialized frame destined for one device.
#[derive(Debug)]
struct Route {
    to: String,
    frame: String,
}

/// Cheap cloneable handle to the hub.
///
/// The handle carries the command senders and a read-only view of the
/// registry; the event loop owns the receivers and is the registry's sole
/// writer. When every handle is gone the loop drains its channels and stops.
#[derive(Clone)]
pub struct Hub {
    clients: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::Sender<Arc<Session>>,
    route_tx: mpsc::Sender<Route>,
}

impl Hub {
    /// Create the hub and start its event loop.
    pub fn new() -> Hub {
        let (register_tx, register_rx) = mpsc::channel(COMMAND_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(COMMAND_BUFFER);
        let (route_tx, route_rx) = mpsc::channel(COMMAND_BUFFER);
        let clients = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(event_loop(
            Arc::clone(&clients),
            register_rx,
            unregister_rx,
            route_rx,
        ));
        Hub {
            clients,
            register_tx,
            unregister_tx,
            route_tx,
        }
    }

    /// Submit a session for registration under its device ID.
    pub async fn register(&self, session: Arc<Session>) {
        let _ = self.register_tx.send(session).await;
    }

    /// Submit a session for removal. Only removes the registry entry if it
    /// still refers to this exact session; a newer registration under the
    /// same device ID is left alone.
    pub async fn unregister(&self, session: Arc<Session>) {
        let _ = self.unregister_tx.send(session).await;
    }

    /// Submit a serialized frame for delivery to `to`.
    pub async fn route(&self, to: &str, frame: String) {
        let route = Route {
            to: to.to_owned(),
            frame,
        };
        let _ = self.route_tx.send(route).await;
    }

    /// Whether a device is currently registered.
    pub async fn contains(&self, device_id: &str) -> bool {
        self.clients.read().await.contains_key(device_id)
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Snapshot of registered device IDs. Ordering is unspecified.
    pub async fn client_ids(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

async fn event_loop(
    registry: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    mut register_rx: mpsc::Receiver<Arc<Session>>,
    mut unregister_rx: mpsc::Receiver<Arc<Session>>,
    mut route_rx: mpsc::Receiver<Route>,
) {
    loop {
        tokio::select! {
            Some(session) = register_rx.recv() => {
                let mut clients = registry.write().await;
                let device = session.id().to_owned();
                if let Some(previous) = clients.insert(device.clone(), Arc::clone(&session)) {
                    if !Arc::ptr_eq(&previous, &session) {
                        previous.close_outbound();
                        warn!(device = %device, "device re-registered, evicting previous session");
                    }
                }
                info!(device = %device, total = clients.len(), "client registered");
            }

            Some(session) = unregister_rx.recv() => {
                let mut clients = registry.write().await;
                let device = session.id();
                if clients
                    .get(device)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    clients.remove(device);
                    info!(device = %device, total = clients.len(), "client unregistered");
                }
                session.close_outbound();
            }

            Some(Route { to, frame }) = route_rx.recv() => {
                let target = registry.read().await.get(&to).cloned();
                let Some(session) = target else {
                    debug!(device = %to, "route target not registered, dropping frame");
                    continue;
                };
                match session.enqueue(frame) {
                    Ok(()) => {}
                    Err(EnqueueError::Full) => {
                        // The writer is not keeping up with its transport.
                        // Drop the whole session rather than stall routing.
                        let mut clients = registry.write().await;
                        if clients
                            .get(&to)
                            .is_some_and(|current| Arc::ptr_eq(current, &session))
                        {
                            clients.remove(&to);
                        }
                        session.close_outbound();
                        warn!(device = %to, "outbound queue full, evicting slow consumer");
                    }
                    Err(EnqueueError::Closed) => {
                        debug!(device = %to, "route target already closing, dropping frame");
                    }
                }
            }

            else => break,
        }
    }
}
