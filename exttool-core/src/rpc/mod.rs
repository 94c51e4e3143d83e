// MIT License
// Copyright 2023--present exttool developers

//! Calculation server protocol.
//!
//! This module is only compiled when the `rpc` Cargo feature is enabled.
//!
//! ## Wire Format
//!
//! A connection carries a sequence of frames in each direction. A frame is a
//! 4-byte big-endian length followed by that many bytes of UTF-8 JSON. Each
//! [`Request`] is answered by exactly one [`Response`], in order.
//!
//! ```json
//! {"type":"calculate","geometry":{"atoms":[{"symbol":"H","position":[0,0,0]}]},
//!  "charge":0,"multiplicity":2,"ncores":1,"gradient":true}
//! {"type":"result","energy":-0.4998,"gradient":[0.0,0.0,0.0]}
//! {"type":"error","kind":"backend","message":"element U is not supported ..."}
//! ```
//!
//! ## Client
//!
//! [`client::RpcClient`] owns a tokio runtime and offers synchronous
//! `calculate` and `status` calls.
//!
//! ## Server
//!
//! [`server::ServerSession`] loads a backend once, binds the endpoint and
//! serves connections until shut down.

pub mod client;
pub mod server;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::status::{BackendError, BridgeError, ErrorKind};
use crate::types::{CalculationInput, CalculationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Calculate(CalculationInput),
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Result(CalculationResult),
    Status(ServerStatus),
    Error(ErrorPayload),
}

/// A failed request as seen by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BridgeError> for ErrorPayload {
    fn from(error: &BridgeError) -> Self {
        Self {
            kind: ErrorKind::of(error),
            message: error.to_string(),
        }
    }
}

impl ErrorPayload {
    /// Rebuild a local error carrying the server's message.
    pub fn into_error(self) -> BridgeError {
        match self.kind {
            ErrorKind::MalformedRequest => BridgeError::MalformedRequest(
                self.message
                    .strip_prefix("malformed request: ")
                    .map(str::to_string)
                    .unwrap_or(self.message),
            ),
            ErrorKind::Backend => BridgeError::Backend(BackendError::Remote(self.message)),
            ErrorKind::Internal => BridgeError::Internal(format!("server: {}", self.message)),
        }
    }
}

/// Lifecycle of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Listening,
    Idle,
    Serving,
    Draining,
    Stopped,
}

/// Health report returned for a [`Request::Status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub backend: String,
    /// Times the model was loaded during this session.
    pub model_loads: u64,
    /// Worker budget (cores) shared by all requests.
    pub workers: usize,
    pub served: u64,
    pub failed: u64,
    pub in_flight: u64,
}

/// Frame codec shared by both ends.
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, BridgeError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| BridgeError::Internal(format!("cannot encode message: {e}")))
}

pub fn decode<'a, T: Deserialize<'a>>(frame: &'a [u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(frame)
        .map_err(|e| BridgeError::Protocol(format!("invalid message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Atom, Geometry};

    #[test]
    fn request_wire_shape() {
        let request = Request::Calculate(CalculationInput {
            geometry: Geometry::new(vec![Atom::new("H", 0.0, 0.0, 0.0)]),
            charge: 0,
            multiplicity: 2,
            ncores: 1,
            gradient: true,
            point_charges: None,
        });
        let value: serde_json::Value = serde_json::from_slice(&encode(&request).unwrap()).unwrap();
        assert_eq!(value["type"], "calculate");
        assert_eq!(value["multiplicity"], 2);
        assert_eq!(value["geometry"]["atoms"][0]["symbol"], "H");
        assert!(value.get("point_charges").is_none());

        let status: Request = decode(br#"{"type":"status"}"#).unwrap();
        assert_eq!(status, Request::Status);
    }

    #[test]
    fn garbage_is_protocol_error() {
        let err = decode::<Request>(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        let err = decode::<Request>(br#"{"type":"explode"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn error_payload_round_trip_keeps_category() {
        let malformed = BridgeError::malformed("atom count mismatch");
        let payload = ErrorPayload::from(&malformed);
        assert_eq!(payload.kind, ErrorKind::MalformedRequest);
        let back = payload.into_error();
        assert_eq!(back.to_string(), "malformed request: atom count mismatch");

        let backend: BridgeError = BackendError::Unsupported("no point charges".into()).into();
        let back = ErrorPayload::from(&backend).into_error();
        assert_eq!(back.status(), crate::status::Status::BackendError);
        assert_eq!(back.to_string(), "no point charges");
    }

    #[test]
    fn error_response_shape() {
        let response = Response::Error(ErrorPayload {
            kind: ErrorKind::Backend,
            message: "boom".into(),
        });
        let text = String::from_utf8(encode(&response).unwrap().to_vec()).unwrap();
        assert_eq!(text, r#"{"type":"error","kind":"backend","message":"boom"}"#);
    }
}
