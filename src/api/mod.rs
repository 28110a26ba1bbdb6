//! Control socket API for the transport callback.
//!
//! Framed request/response over a local stream socket: 2-byte type,
//! 4-byte big-endian payload length, payload. The only request the
//! daemon honors is a VPN config update authenticated by the run token.

pub mod message;
pub mod server;

pub use message::{Message, MAX_PAYLOAD_SIZE, TYPE_CONFIG_UPDATE, TYPE_ERROR, TYPE_OK};
pub use server::{ApiError, Request, Server};
