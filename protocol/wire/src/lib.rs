//! RPC wire protocol: connection handshake, request/response framing, and
//! the pluggable body encodings.
//!
//! A connection starts with a single handshake frame carrying a
//! [`Handshake`] record as JSON. The handshake fixes the content type for
//! the rest of the connection; from then on the stream is a repeated
//! sequence of `(header frame, body frame)` pairs in that content type.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by the
//! payload:
//!
//! ```text
//! +----------------+----------------------+
//! | len: u32 (BE)  | payload: len bytes   |
//! +----------------+----------------------+
//! ```
//!
//! Body frames carry values already encoded by the caller; a zero-length
//! body is the sentinel used when a response reports an error in its header.

mod frame;
mod handshake;

pub use frame::{WireReader, WireWriter};
pub use handshake::Handshake;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Magic number every handshake must carry.
pub const MAGIC: u32 = 0x3bef5c;

/// Frames larger than this are rejected as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default connect timeout carried in a fresh [`Handshake`].
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Path clients CONNECT to when tunneling the protocol through HTTP.
pub const DEFAULT_RPC_PATH: &str = "/_ember_rpc_";

/// Path serving the server's plain-text introspection page.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/rpc";

/// Status line (without the HTTP version) answering a successful CONNECT.
pub const CONNECTED_STATUS: &str = "200 Connected to Ember RPC";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),
    #[error("invalid magic number {0:#x}")]
    BadMagic(u32),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Body encoding negotiated by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/bincode")]
    Bincode,
    #[serde(rename = "application/json")]
    Json,
}

impl ContentType {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        match self {
            ContentType::Bincode => {
                bincode::serialize(value).map_err(|e| WireError::Encode(e.to_string()))
            }
            ContentType::Json => {
                serde_json::to_vec(value).map_err(|e| WireError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, WireError> {
        match self {
            ContentType::Bincode => {
                bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
            }
            ContentType::Json => {
                serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
            }
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentType::Bincode => f.write_str("application/bincode"),
            ContentType::Json => f.write_str("application/json"),
        }
    }
}

/// Per-call frame header.
///
/// A request carries an empty `error`; a response carries the error message
/// for the call, if any. `seq` ties a response back to the client-side call
/// that issued it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service_method: String,
    pub seq: u64,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    #[test]
    fn header_round_trips_in_both_content_types() {
        let header = Header {
            service_method: "Arith.Sum".to_string(),
            seq: 7,
            error: String::new(),
        };
        for ct in [ContentType::Bincode, ContentType::Json] {
            let encoded = ct.encode(&header).unwrap();
            let decoded: Header = ct.decode(&encoded).unwrap();
            assert_eq!(decoded, header, "{ct}");
        }
    }

    #[test]
    fn body_round_trips_in_both_content_types() {
        let args = Args { num1: 3, num2: 4 };
        for ct in [ContentType::Bincode, ContentType::Json] {
            let encoded = ct.encode(&args).unwrap();
            let decoded: Args = ct.decode(&encoded).unwrap();
            assert_eq!(decoded, args, "{ct}");
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = ContentType::Json.decode::<Header>(b"not json").unwrap_err();
        assert!(matches!(err, WireError::Decode(_)));
    }
}
