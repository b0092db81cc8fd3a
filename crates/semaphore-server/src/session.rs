//! Per-connection session: outbound queue, reader/writer pumps, dispatch.
//!
//! Each accepted connection gets one `Session` shared between three parties:
//! the reader pump (validates and dispatches inbound envelopes), the writer
//! pump (drains the outbound queue to the transport), and the hub (routes
//! frames from other sessions into the queue and is the only closer of it).

use crate::hub::Hub;
use crate::limiter::{MessageBudget, RATE_MAX};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use semaphore_core::envelope::{
    AckStatus, ConnectRequest, ConnectionAccepted, ConnectionRejected, Envelope, IceCandidate,
    Kind, PeerRef, SessionDescription, MAX_DESCRIPTION_BYTES,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, warn};

/// Outbound queue capacity per session.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Reader gives up if the transport stays silent this long. Any inbound
/// frame, including the pong elicited by the heartbeat, refreshes it.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a single transport write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between heartbeat pings, comfortably inside the idle timeout.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(54);

/// Why a non-blocking enqueue did not accept a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue is at capacity: the consumer is too slow.
    Full,
    /// The hub already closed the queue.
    Closed,
}

/// State for one registered connection.
pub struct Session {
    id: String,
    /// Sender half of the outbound queue. Taken (dropped) exactly once by
    /// [`close_outbound`]; the writer pump then drains the remainder and
    /// observes end of stream.
    ///
    /// [`close_outbound`]: Session::close_outbound
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    closed: AtomicBool,
    budget: Mutex<MessageBudget>,
    hub: Hub,
}

impl Session {
    pub fn new(id: String, outbound: mpsc::Sender<String>, hub: Hub) -> Session {
        Session {
            id,
            outbound: Mutex::new(Some(outbound)),
            closed: AtomicBool::new(false),
            budget: Mutex::new(MessageBudget::new(RATE_MAX)),
            hub,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking enqueue of a serialized frame.
    pub fn enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock().unwrap();
        match guard.as_ref() {
            None => Err(EnqueueError::Closed),
            Some(tx) => tx.try_send(frame).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }),
        }
    }

    /// Latch the session closed and drop the queue sender. Idempotent.
    /// Called by the hub event loop only; reader and writer never close the
    /// queue themselves, which is what makes eviction race-free.
    pub(crate) fn close_outbound(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.outbound.lock().unwrap().take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read envelopes until the transport closes, errors, or goes idle.
    pub async fn read_pump(&self, stream: &mut SplitStream<WebSocket>) {
        loop {
            let message = match timeout(IDLE_TIMEOUT, stream.next()).await {
                Err(_) => {
                    debug!(device = %self.id, "idle deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(device = %self.id, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Text(text) => self.handle_frame(&text).await,
                Message::Close(_) => break,
                // Pings are answered by the transport layer; pongs and other
                // control frames only refresh the idle deadline.
                _ => {}
            }
        }
    }

    /// Validate and dispatch one inbound text frame.
    pub async fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(device = %self.id, error = %e, "undecodable envelope, ignoring");
                return;
            }
        };

        if !self.budget.lock().unwrap().allow() {
            warn!(device = %self.id, "rate limit exceeded, dropping envelope");
            return;
        }

        match envelope.kind {
            Kind::Offer | Kind::Answer => self.relay_description(&envelope, text).await,
            Kind::IceCandidate => self.relay_candidate(&envelope, text).await,
            Kind::ConnectRequest => self.handle_connect_request(&envelope).await,
            Kind::ConnectionAccepted | Kind::ConnectionRejected => {
                self.relay_connection_outcome(&envelope, text).await;
            }
            Kind::PasswordChallenge | Kind::PasswordResponse => {
                self.relay_password(&envelope, text).await;
            }
            Kind::Ping => self.send(&Envelope::pong()),
            Kind::Register => debug!(device = %self.id, "duplicate register ignored"),
            other => {
                debug!(device = %self.id, kind = other.as_str(), "unroutable message kind, dropping");
            }
        }
    }

    /// `Offer` / `Answer`: size cap, required fields, then verbatim relay.
    async fn relay_description(&self, envelope: &Envelope, raw: &str) {
        let kind = envelope.kind;
        if envelope.data_size() > MAX_DESCRIPTION_BYTES {
            warn!(device = %self.id, kind = kind.as_str(), size = envelope.data_size(), "description too large");
            self.send_ack(kind, AckStatus::Error, Some("payload too large"));
            return;
        }
        let description: SessionDescription = match envelope.decode() {
            Ok(description) => description,
            Err(e) => {
                debug!(device = %self.id, kind = kind.as_str(), error = %e, "malformed description");
                self.send_ack(kind, AckStatus::Error, Some("malformed payload"));
                return;
            }
        };
        if description.to.is_empty() || description.sdp.is_empty() {
            self.send_ack(kind, AckStatus::Error, Some("missing required fields"));
            return;
        }
        self.hub.route(&description.to, raw.to_owned()).await;
        self.send_ack(kind, AckStatus::Success, None);
    }

    /// `IceCandidate`: needs a destination, otherwise opaque.
    async fn relay_candidate(&self, envelope: &Envelope, raw: &str) {
        let candidate: IceCandidate = match envelope.decode() {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(device = %self.id, error = %e, "malformed ice candidate");
                self.send_ack(Kind::IceCandidate, AckStatus::Error, Some("malformed payload"));
                return;
            }
        };
        if candidate.to.is_empty() {
            self.send_ack(Kind::IceCandidate, AckStatus::Error, Some("missing destination"));
            return;
        }
        self.hub.route(&candidate.to, raw.to_owned()).await;
        self.send_ack(Kind::IceCandidate, AckStatus::Success, None);
    }

    /// `ConnectRequest`: the one envelope the relay rewrites. The target
    /// learns who is asking and whether a password accompanies the request;
    /// the password itself never leaves this function.
    async fn handle_connect_request(&self, envelope: &Envelope) {
        let request: ConnectRequest = match envelope.decode() {
            Ok(request) => request,
            Err(e) => {
                debug!(device = %self.id, error = %e, "malformed connect request");
                self.send_ack(Kind::ConnectRequest, AckStatus::Error, Some("malformed payload"));
                return;
            }
        };
        let has_password = request.password.as_deref().is_some_and(|p| !p.is_empty());
        debug!(device = %self.id, target = %request.target_id, has_password, "connect request");

        if !self.hub.contains(&request.target_id).await {
            self.send(&Envelope::error(404, "target not found"));
            self.send_ack(Kind::ConnectRequest, AckStatus::Error, Some("target not found"));
            return;
        }

        let forward = Envelope::connect_request(&self.id, has_password);
        match forward.to_text() {
            Ok(frame) => {
                self.hub.route(&request.target_id, frame).await;
                self.send_ack(Kind::ConnectRequest, AckStatus::Success, None);
            }
            Err(e) => {
                warn!(device = %self.id, error = %e, "could not serialize connect request");
                self.send_ack(Kind::ConnectRequest, AckStatus::Error, Some("internal error"));
            }
        }
    }

    /// `ConnectionAccepted` / `ConnectionRejected`: relayed verbatim to the
    /// peer. These are themselves responses, so no acknowledgement.
    async fn relay_connection_outcome(&self, envelope: &Envelope, raw: &str) {
        let peer_id = match envelope.kind {
            Kind::ConnectionAccepted => envelope
                .decode::<ConnectionAccepted>()
                .map(|outcome| outcome.peer_id),
            _ => envelope
                .decode::<ConnectionRejected>()
                .map(|outcome| outcome.peer_id),
        };
        match peer_id {
            Err(e) => {
                debug!(device = %self.id, kind = envelope.kind.as_str(), error = %e, "malformed connection outcome");
            }
            Ok(peer_id) if peer_id.is_empty() => {
                debug!(device = %self.id, kind = envelope.kind.as_str(), "connection outcome without peer");
            }
            Ok(peer_id) => self.hub.route(&peer_id, raw.to_owned()).await,
        }
    }

    /// `PasswordChallenge` / `PasswordResponse`: the relay only reads the
    /// destination and forwards the rest untouched.
    async fn relay_password(&self, envelope: &Envelope, raw: &str) {
        let peer: PeerRef = match envelope.decode() {
            Ok(peer) => peer,
            Err(e) => {
                debug!(device = %self.id, kind = envelope.kind.as_str(), error = %e, "malformed password message");
                return;
            }
        };
        if peer.peer_id.is_empty() {
            debug!(device = %self.id, kind = envelope.kind.as_str(), "password message without peer");
            return;
        }
        self.hub.route(&peer.peer_id, raw.to_owned()).await;
    }

    /// Serialize and enqueue a reply to this session. Replies are best
    /// effort: a saturated queue drops them rather than blocking dispatch.
    pub(crate) fn send(&self, envelope: &Envelope) {
        let frame = match envelope.to_text() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device = %self.id, error = %e, "could not serialize reply");
                return;
            }
        };
        if self.enqueue(frame).is_err() {
            debug!(device = %self.id, kind = envelope.kind.as_str(), "outbound saturated, reply dropped");
        }
    }

    fn send_ack(&self, acked: Kind, status: AckStatus, detail: Option<&str>) {
        self.send(&Envelope::ack(acked, status, detail));
    }
}

/// Drain the outbound queue to the transport.
///
/// Emits a heartbeat ping between frames and gives every write a deadline.
/// When the hub closes the queue this drains what is buffered, sends a close
/// frame, and returns; a write failure returns immediately and lets the
/// reader side tear the session down.
pub async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_PERIOD, HEARTBEAT_PERIOD);
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "write failed");
                        return;
                    }
                    Err(_) => {
                        debug!("write deadline expired");
                        return;
                    }
                },
                None => {
                    // Queue closed by the hub and fully drained.
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = heartbeat.tick() => {
                if !matches!(
                    timeout(WRITE_TIMEOUT, sink.send(Message::Ping(Vec::new()))).await,
                    Ok(Ok(()))
                ) {
                    debug!("heartbeat failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc::Receiver;

    fn make_session(hub: &Hub, id: &str) -> (Arc<Session>, Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Session::new(id.to_owned(), tx, hub.clone())), rx)
    }

    async fn register(hub: &Hub, session: &Arc<Session>) {
        hub.register(Arc::clone(session)).await;
        for _ in 0..200 {
            if hub.contains(session.id()).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session did not register in time");
    }

    async fn expect_frame(rx: &mut Receiver<String>) -> String {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    async fn expect_json(rx: &mut Receiver<String>) -> Value {
        serde_json::from_str(&expect_frame(rx).await).unwrap()
    }

    fn expect_silence(rx: &mut Receiver<String>) {
        assert!(rx.try_recv().is_err(), "expected no frame");
    }

    #[tokio::test]
    async fn offer_is_relayed_verbatim_and_acked() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        let raw = json!({
            "type": "Offer",
            "data": { "from": "alice", "to": "bob", "sdp": "v=0" }
        })
        .to_string();
        alice.handle_frame(&raw).await;

        assert_eq!(expect_frame(&mut bob_rx).await, raw);
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["type"], "Ack");
        assert_eq!(ack["data"]["message_type"], "Offer");
        assert_eq!(ack["data"]["status"], "success");
    }

    #[tokio::test]
    async fn offer_missing_fields_is_nacked() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        alice
            .handle_frame(r#"{"type":"Offer","data":{"from":"alice","to":"","sdp":"v=0"}}"#)
            .await;
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["status"], "error");
    }

    #[tokio::test]
    async fn description_size_boundary() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        // Pad the sdp so the serialized payload lands exactly on the cap.
        let overhead = json!({ "from": "alice", "to": "bob", "sdp": "" })
            .to_string()
            .len();
        let sdp = "a".repeat(MAX_DESCRIPTION_BYTES - overhead);
        let at_cap = json!({
            "type": "Answer",
            "data": { "from": "alice", "to": "bob", "sdp": sdp }
        });
        alice.handle_frame(&at_cap.to_string()).await;
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["status"], "success");
        expect_frame(&mut bob_rx).await;

        let mut over_cap = at_cap;
        over_cap["data"]["sdp"] = json!("a".repeat(MAX_DESCRIPTION_BYTES - overhead + 1));
        alice.handle_frame(&over_cap.to_string()).await;
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["status"], "error");
        assert_eq!(ack["data"]["message"], "payload too large");
        expect_silence(&mut bob_rx);
    }

    #[tokio::test]
    async fn ice_candidate_requires_destination() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        let raw = json!({
            "type": "IceCandidate",
            "data": {
                "from": "alice", "to": "", "candidate": "candidate:0",
                "sdp_mid": "0", "sdp_mline_index": 0
            }
        })
        .to_string();
        alice.handle_frame(&raw).await;
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["message_type"], "IceCandidate");
        assert_eq!(ack["data"]["status"], "error");
    }

    #[tokio::test]
    async fn connect_request_to_unknown_target() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        alice
            .handle_frame(r#"{"type":"ConnectRequest","data":{"target_id":"zeta","password":"p"}}"#)
            .await;
        let error = expect_json(&mut alice_rx).await;
        assert_eq!(error["type"], "Error");
        assert_eq!(error["data"]["code"], 404);
        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["message_type"], "ConnectRequest");
        assert_eq!(ack["data"]["status"], "error");
    }

    #[tokio::test]
    async fn connect_request_password_never_forwarded() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        alice
            .handle_frame(
                r#"{"type":"ConnectRequest","data":{"target_id":"bob","password":"hunter2"}}"#,
            )
            .await;

        let frame = expect_frame(&mut bob_rx).await;
        assert!(!frame.contains("hunter2"));
        let forwarded: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(forwarded["type"], "ConnectRequest");
        assert_eq!(forwarded["data"]["from"], "alice");
        assert_eq!(forwarded["data"]["has_password"], true);

        let ack = expect_json(&mut alice_rx).await;
        assert_eq!(ack["data"]["status"], "success");
    }

    #[tokio::test]
    async fn empty_password_counts_as_absent() {
        let hub = Hub::new();
        let (alice, _alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        alice
            .handle_frame(r#"{"type":"ConnectRequest","data":{"target_id":"bob","password":""}}"#)
            .await;
        let forwarded = expect_json(&mut bob_rx).await;
        assert_eq!(forwarded["data"]["has_password"], false);
    }

    #[tokio::test]
    async fn connection_outcomes_are_relayed_without_ack() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        let raw = r#"{"type":"ConnectionRejected","data":{"peer_id":"bob","reason":"busy"}}"#;
        alice.handle_frame(raw).await;
        assert_eq!(expect_frame(&mut bob_rx).await, raw);
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn password_challenge_is_opaque_to_the_relay() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        let (bob, mut bob_rx) = make_session(&hub, "bob");
        register(&hub, &alice).await;
        register(&hub, &bob).await;

        let raw =
            r#"{"type":"PasswordChallenge","data":{"peer_id":"bob","challenge":"c","salt":"s"}}"#;
        alice.handle_frame(raw).await;
        assert_eq!(expect_frame(&mut bob_rx).await, raw);
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn ping_yields_one_pong_each() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        alice.handle_frame(r#"{"type":"Ping"}"#).await;
        alice.handle_frame(r#"{"type":"Ping"}"#).await;
        assert_eq!(expect_json(&mut alice_rx).await["type"], "Pong");
        assert_eq!(expect_json(&mut alice_rx).await["type"], "Pong");
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn garbage_and_unknown_kinds_are_dropped() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        alice.handle_frame("not json").await;
        alice.handle_frame(r#"{"type":"Telemetry","data":{}}"#).await;
        alice.handle_frame(r#"{"type":"Register","data":{"device_id":"alice"}}"#).await;
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn rate_limited_envelopes_are_dropped_silently() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        // The warm-up budget admits ten envelopes at the top of the window.
        for _ in 0..12 {
            alice.handle_frame(r#"{"type":"Ping"}"#).await;
        }
        for _ in 0..10 {
            assert_eq!(expect_json(&mut alice_rx).await["type"], "Pong");
        }
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn rate_limited_connect_request_gets_no_ack() {
        let hub = Hub::new();
        let (alice, mut alice_rx) = make_session(&hub, "alice");
        register(&hub, &alice).await;

        for _ in 0..10 {
            alice.handle_frame(r#"{"type":"Ping"}"#).await;
        }
        alice
            .handle_frame(r#"{"type":"ConnectRequest","data":{"target_id":"zeta"}}"#)
            .await;
        for _ in 0..10 {
            assert_eq!(expect_json(&mut alice_rx).await["type"], "Pong");
        }
        expect_silence(&mut alice_rx);
    }

    #[tokio::test]
    async fn enqueue_reports_overflow_and_closure() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::channel(1);
        let session = Session::new("alice".into(), tx, hub);
        assert!(session.enqueue("one".into()).is_ok());
        assert_eq!(session.enqueue("two".into()), Err(EnqueueError::Full));

        session.close_outbound();
        session.close_outbound();
        assert_eq!(session.enqueue("three".into()), Err(EnqueueError::Closed));
        assert!(session.is_closed());
    }
}
