//! semaphore-core: Shared protocol library for the semaphore signaling relay.
//!
//! Provides the JSON envelope model exchanged over the WebSocket transport,
//! the typed payload schemas for each message kind, the size caps enforced
//! by the relay, and the error taxonomy.

pub mod envelope;
pub mod error;

// Re-export commonly used items at crate root.
pub use envelope::{
    Ack, AckStatus, ConnectRequest, ConnectionAccepted, ConnectionRejected, Envelope,
    IceCandidate, Kind, PasswordChallenge, PasswordResponse, PeerRef, Registration,
    SessionDescription, MAX_DESCRIPTION_BYTES, MAX_MESSAGE_BYTES,
};
pub use error::{RelayError, RelayResult};
