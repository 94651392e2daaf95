//! Typed payload records keyed by [`MessageKind`].
//!
//! The canonical on-the-wire encoding is UTF-8 JSON. Raw byte fields
//! (`data`) are base64 strings in JSON, matching what the server expects.

use crate::error::ProtocolError;
use crate::frame::{Frame, MessageKind};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tunnel registration data. Must be the first frame the agent sends on a
/// freshly established link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRegistration {
    pub protocol: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    pub max_connections: u32,
}

/// A request (or raw TCP chunk) forwarded from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataForward {
    pub connection_id: String,
    pub request_id: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Bytes,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
}

/// The agent's answer to a [`DataForward`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataResponse {
    pub connection_id: String,
    pub request_id: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Bytes,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Close notification for one server-side connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionClose {
    pub connection_id: String,
    pub reason: String,
}

/// Periodic liveness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Unix seconds.
    pub timestamp: i64,
    pub active_conns: u64,
    pub total_requests: u64,
}

/// Error report carried on the wire (distinct from the agent's error type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Request this error refers to, when the server attributes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Acknowledgment of an earlier message. Diagnostic only for now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub message_id: String,
    pub status: String,
}

/// A decoded payload, tagged by the frame kind that carried it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    TunnelRegistration(TunnelRegistration),
    DataForward(Box<DataForward>),
    DataResponse(Box<DataResponse>),
    ConnectionClose(ConnectionClose),
    Heartbeat(Heartbeat),
    Error(WireError),
    Acknowledge(Acknowledge),
}

macro_rules! impl_payload_record {
    ($ty:ident, $kind:expr) => {
        impl $ty {
            /// The [`MessageKind`] this record travels under.
            pub const KIND: MessageKind = $kind;

            /// Wrap this record in a [`Frame`] for the given tunnel.
            pub fn into_frame(self, tunnel_id: impl Into<String>) -> Result<Frame, ProtocolError> {
                let payload = serde_json::to_vec(&self).map_err(|e| {
                    ProtocolError::PayloadEncode {
                        kind: Self::KIND,
                        reason: e.to_string(),
                    }
                })?;
                Ok(Frame::new(Self::KIND, tunnel_id, Bytes::from(payload)))
            }
        }
    };
}

impl_payload_record!(TunnelRegistration, MessageKind::TunnelRegistration);
impl_payload_record!(DataForward, MessageKind::DataForward);
impl_payload_record!(DataResponse, MessageKind::DataResponse);
impl_payload_record!(ConnectionClose, MessageKind::ConnectionClose);
impl_payload_record!(Heartbeat, MessageKind::Heartbeat);
impl_payload_record!(WireError, MessageKind::Error);
impl_payload_record!(Acknowledge, MessageKind::Acknowledge);

impl Frame {
    /// Decode the payload as the record type for this frame's kind.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::PayloadDecode {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    /// Decode into the tagged [`Payload`] enum.
    pub fn parse_payload(&self) -> Result<Payload, ProtocolError> {
        Ok(match self.kind {
            MessageKind::TunnelRegistration => Payload::TunnelRegistration(self.decode_payload()?),
            MessageKind::DataForward => Payload::DataForward(Box::new(self.decode_payload()?)),
            MessageKind::DataResponse => Payload::DataResponse(Box::new(self.decode_payload()?)),
            MessageKind::ConnectionClose => Payload::ConnectionClose(self.decode_payload()?),
            MessageKind::Heartbeat => Payload::Heartbeat(self.decode_payload()?),
            MessageKind::Error => Payload::Error(self.decode_payload()?),
            MessageKind::Acknowledge => Payload::Acknowledge(self.decode_payload()?),
        })
    }
}

/// base64 encoding for `Bytes` fields in JSON payloads.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_forward_round_trip() {
        let record = DataForward {
            connection_id: "conn-123".into(),
            request_id: "req-456".into(),
            data: Bytes::from_static(b"hello body"),
            headers: HashMap::from([("Host".to_string(), "t.example".to_string())]),
            method: "GET".into(),
            path: "/api/test".into(),
        };
        let frame = record.clone().into_frame("tun_1").unwrap();
        assert_eq!(frame.kind, MessageKind::DataForward);
        let decoded: DataForward = frame.decode_payload().unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_data_field_is_base64_in_json() {
        let record = DataResponse {
            connection_id: "c".into(),
            request_id: "r".into(),
            data: Bytes::from_static(b"PONG"),
            status_code: 200,
            headers: HashMap::new(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"UE9ORw==\""), "json was: {json}");
    }

    #[test]
    fn test_registration_omits_absent_options() {
        let record = TunnelRegistration {
            protocol: "http".into(),
            local_port: 3000,
            subdomain: None,
            public_port: None,
            max_connections: 10,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("subdomain"));
        assert!(!json.contains("public_port"));
    }

    #[test]
    fn test_parse_payload_tags_by_kind() {
        let frame = Heartbeat {
            timestamp: 1_700_000_000,
            active_conns: 3,
            total_requests: 42,
        }
        .into_frame("hb")
        .unwrap();

        match frame.parse_payload().unwrap() {
            Payload::Heartbeat(hb) => {
                assert_eq!(hb.active_conns, 3);
                assert_eq!(hb.total_requests, 42);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_payload_decode_error_carries_kind() {
        let frame = Frame::new(
            MessageKind::DataForward,
            "t",
            Bytes::from_static(b"not json"),
        );
        let err = frame.parse_payload().unwrap_err();
        match err {
            ProtocolError::PayloadDecode { kind, .. } => {
                assert_eq!(kind, MessageKind::DataForward);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_forward_defaults_for_tcp_frames() {
        // Raw TCP forwards omit method/path/headers.
        let json = r#"{"connection_id":"c1","request_id":"r1","data":"UElORw=="}"#;
        let record: DataForward = serde_json::from_str(json).unwrap();
        assert_eq!(record.data, Bytes::from_static(b"PING"));
        assert!(record.method.is_empty());
        assert!(record.headers.is_empty());
    }
}
