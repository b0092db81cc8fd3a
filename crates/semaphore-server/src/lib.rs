//! semaphore-server: WebRTC signaling relay.
//!
//! A single-process message router: clients connect over WebSocket, register
//! under a self-asserted device ID, and exchange signaling envelopes (SDP
//! offers/answers, ICE candidates, connect requests, password challenges)
//! with named peers. Once two peers have traded descriptions and candidates
//! they talk directly; the relay holds no WebRTC state and carries no media.

pub mod config;
pub mod http;
pub mod hub;
pub mod limiter;
pub mod session;
pub mod tls;
pub mod ws;
