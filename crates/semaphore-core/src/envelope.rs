//! The signaling envelope and its per-kind payload schemas.
//!
//! Every frame on the wire is a UTF-8 JSON object `{"type": ..., "data": ...}`.
//! The relay inspects `type` and, for the kinds it must validate or rewrite,
//! decodes `data` into one of the typed payloads below. Routable envelopes are
//! forwarded verbatim; the relay never interprets SDP, ICE candidate strings,
//! or password challenge material.
//!
//! `data` stays a raw [`serde_json::Value`] on the envelope itself because
//! `ConnectRequest` carries two directional schemas under the same tag: the
//! sender-side `{target_id, password?}` form, which is relay-private, and the
//! `{from, has_password}` form delivered to the target. Unknown fields in
//! incoming payloads are ignored; missing required fields fail decoding.

use crate::error::{RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Hard cap on a single inbound transport frame. Breaching it is fatal to the
/// connection, not just to the envelope.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Cap on the serialized `data` of an `Offer` or `Answer`. Breaching it is
/// answered with a negative acknowledgement.
pub const MAX_DESCRIPTION_BYTES: usize = 100 * 1024;

/// Message kinds, tagged on the wire by their exact name.
///
/// Kinds the relay does not recognize decode to [`Kind::Unknown`] so a single
/// malformed client cannot poison the session; such envelopes are logged and
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Kind {
    Register,
    Offer,
    Answer,
    IceCandidate,
    ConnectRequest,
    ConnectionAccepted,
    ConnectionRejected,
    PasswordChallenge,
    PasswordResponse,
    Ping,
    Pong,
    Error,
    Ack,
    Unknown,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "Register",
            Self::Offer => "Offer",
            Self::Answer => "Answer",
            Self::IceCandidate => "IceCandidate",
            Self::ConnectRequest => "ConnectRequest",
            Self::ConnectionAccepted => "ConnectionAccepted",
            Self::ConnectionRejected => "ConnectionRejected",
            Self::PasswordChallenge => "PasswordChallenge",
            Self::PasswordResponse => "PasswordResponse",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Error => "Error",
            Self::Ack => "Ack",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> String {
        kind.as_str().to_owned()
    }
}

impl From<String> for Kind {
    fn from(s: String) -> Kind {
        match s.as_str() {
            "Register" => Self::Register,
            "Offer" => Self::Offer,
            "Answer" => Self::Answer,
            "IceCandidate" => Self::IceCandidate,
            "ConnectRequest" => Self::ConnectRequest,
            "ConnectionAccepted" => Self::ConnectionAccepted,
            "ConnectionRejected" => Self::ConnectionRejected,
            "PasswordChallenge" => Self::PasswordChallenge,
            "PasswordResponse" => Self::PasswordResponse,
            "Ping" => Self::Ping,
            "Pong" => Self::Pong,
            "Error" => Self::Error,
            "Ack" => Self::Ack,
            _ => Self::Unknown,
        }
    }
}

/// The top-level wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Parse an envelope from a text frame.
    pub fn from_text(text: &str) -> RelayResult<Envelope> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Serialize the envelope back to a text frame.
    pub fn to_text(&self) -> RelayResult<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Decode `data` into a typed payload. Missing `data` or missing required
    /// fields are decode failures; unknown fields are ignored.
    pub fn decode<T: DeserializeOwned>(&self) -> RelayResult<T> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Serialized byte length of `data`, used for the description size cap.
    pub fn data_size(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.to_string().len())
    }

    /// Registration confirmation sent back on a successful `Register`.
    pub fn registered(message: &str) -> Envelope {
        Envelope {
            kind: Kind::Register,
            data: Some(json!({ "success": true, "message": message })),
        }
    }

    /// Positive or negative acknowledgement of a routable envelope.
    pub fn ack(acked: Kind, status: AckStatus, detail: Option<&str>) -> Envelope {
        let mut body = json!({
            "message_type": acked.as_str(),
            "status": status.as_str(),
        });
        if let Some(detail) = detail {
            body["message"] = json!(detail);
        }
        Envelope {
            kind: Kind::Ack,
            data: Some(body),
        }
    }

    /// Relay-originated error delivered to the offending sender.
    pub fn error(code: i32, message: &str) -> Envelope {
        Envelope {
            kind: Kind::Error,
            data: Some(json!({ "code": code, "message": message })),
        }
    }

    /// Heartbeat reply. Carries no data.
    pub fn pong() -> Envelope {
        Envelope {
            kind: Kind::Pong,
            data: None,
        }
    }

    /// The forwarded form of a connect request. The sender's password, if
    /// any, is reduced to a boolean before the envelope leaves the relay.
    pub fn connect_request(from: &str, has_password: bool) -> Envelope {
        Envelope {
            kind: Kind::ConnectRequest,
            data: Some(json!({ "from": from, "has_password": has_password })),
        }
    }
}

/// `Ack` status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// `Register`: a device announcing itself. The ID is self-asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub device_id: String,
}

/// `Offer` and `Answer`: a session description relayed between two devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub from: String,
    pub to: String,
    pub sdp: String,
}

/// `IceCandidate`: one ICE candidate relayed between two devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub from: String,
    pub to: String,
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

/// `ConnectRequest` as received from the requesting device. The password is
/// relay-private and must never be forwarded; see
/// [`Envelope::connect_request`] for the outbound form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// `ConnectionAccepted`: the target granted a pending connect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionAccepted {
    pub peer_id: String,
}

/// `ConnectionRejected`: the target declined a pending connect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRejected {
    pub peer_id: String,
    pub reason: String,
}

/// `PasswordChallenge`: opaque challenge material relayed to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordChallenge {
    pub peer_id: String,
    pub challenge: String,
    pub salt: String,
}

/// `PasswordResponse`: the opaque answer to a password challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordResponse {
    pub peer_id: String,
    pub response: String,
}

/// Minimal routing view of any peer-addressed payload. Used where the relay
/// only needs the destination and treats the rest of the payload as opaque.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerRef {
    pub peer_id: String,
}

/// `Ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_type: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
