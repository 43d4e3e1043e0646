//! Signaling envelope vocabulary and its JSON wire codec.
//!
//! Every message on the relay is a single JSON object. The `type` field
//! selects the variant:
//!
//! | `type`     | variant        | fields                    |
//! |------------|----------------|---------------------------|
//! | `register` | `Register`     | `userId`                  |
//! | `call`     | `CallRequest`  | `from`, `to`              |
//! | `offer`    | `Offer`        | `from`, `to`, `sdp`       |
//! | `answer`   | `Answer`       | `from`, `to`, `sdp`       |
//! | `ice`      | `IceCandidate` | `from`, `to`, `candidate` |
//! | `end`      | `EndCall`      | `from`, `to`              |
//!
//! `sdp` and `candidate` are opaque blobs; they are relayed verbatim and
//! never parsed here. Validation is structural only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Opaque, stable identifier of a local or remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ParticipantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Discriminants accepted on the wire.
pub const KNOWN_TYPES: [&str; 6] = ["register", "call", "offer", "answer", "ice", "end"];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a json object")]
    NotAnObject,

    #[error("message has no string `type` field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid `{kind}` message: {reason}")]
    InvalidFields { kind: String, reason: String },
}

/// One signaling message exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalEnvelope {
    /// Announces the local participant to the relay.
    Register {
        #[serde(rename = "userId")]
        user_id: ParticipantId,
    },
    /// Asks `to` to ring.
    #[serde(rename = "call")]
    CallRequest {
        from: ParticipantId,
        to: ParticipantId,
    },
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: String,
    },
    #[serde(rename = "ice")]
    IceCandidate {
        from: ParticipantId,
        to: ParticipantId,
        candidate: String,
    },
    /// Hangup, rejection or cancellation; valid in any call phase.
    #[serde(rename = "end")]
    EndCall {
        from: ParticipantId,
        to: ParticipantId,
    },
}

impl SignalEnvelope {
    /// The wire discriminant of this envelope.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::CallRequest { .. } => "call",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice",
            Self::EndCall { .. } => "end",
        }
    }

    /// Sender, for every variant except `Register`.
    pub fn sender(&self) -> Option<&ParticipantId> {
        match self {
            Self::Register { .. } => None,
            Self::CallRequest { from, .. }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::EndCall { from, .. } => Some(from),
        }
    }

    /// Recipient, for every variant except `Register`.
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            Self::Register { .. } => None,
            Self::CallRequest { to, .. }
            | Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::EndCall { to, .. } => Some(to),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates one inbound frame.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(data)?;
        let kind = match value.as_object() {
            None => return Err(ProtocolError::NotAnObject),
            Some(obj) => match obj.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                _ => return Err(ProtocolError::MissingType),
            },
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
            kind,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> ParticipantId {
        "alice".into()
    }

    fn bob() -> ParticipantId {
        "bob".into()
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        let envelopes = vec![
            SignalEnvelope::Register { user_id: alice() },
            SignalEnvelope::CallRequest {
                from: alice(),
                to: bob(),
            },
            SignalEnvelope::Offer {
                from: alice(),
                to: bob(),
                sdp: r#"{"type":"offer","sdp":"v=0\r\n"}"#.to_string(),
            },
            SignalEnvelope::Answer {
                from: bob(),
                to: alice(),
                sdp: "v=0".to_string(),
            },
            SignalEnvelope::IceCandidate {
                from: bob(),
                to: alice(),
                candidate: r#"{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host"}"#
                    .to_string(),
            },
            SignalEnvelope::EndCall {
                from: alice(),
                to: bob(),
            },
        ];

        for envelope in envelopes {
            let json = envelope.encode().unwrap();
            let decoded = SignalEnvelope::decode(json.as_bytes()).unwrap();
            assert_eq!(decoded, envelope, "mismatch for {}", envelope.kind());
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = SignalEnvelope::Register { user_id: alice() }
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["userId"], "alice");

        let json = SignalEnvelope::IceCandidate {
            from: alice(),
            to: bob(),
            candidate: "c".into(),
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ice");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["candidate"], "c");
    }

    #[test]
    fn test_decode_call_request_from_relay() {
        let decoded = SignalEnvelope::decode(br#"{"type":"call","from":"carol","to":"alice"}"#)
            .unwrap();
        assert_eq!(
            decoded,
            SignalEnvelope::CallRequest {
                from: "carol".into(),
                to: "alice".into(),
            }
        );
        assert_eq!(decoded.sender(), Some(&"carol".into()));
        assert_eq!(decoded.recipient(), Some(&alice()));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = SignalEnvelope::decode(br#"{"type":"busy","from":"a","to":"b"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "busy"));
    }

    #[test]
    fn test_missing_or_non_string_type_is_rejected() {
        assert!(matches!(
            SignalEnvelope::decode(br#"{"from":"a","to":"b"}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            SignalEnvelope::decode(br#"{"type":7}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let err = SignalEnvelope::decode(br#"{"type":"offer","from":"a","to":"b"}"#).unwrap_err();
        match err {
            ProtocolError::InvalidFields { kind, .. } => assert_eq!(kind, "offer"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_object_and_garbage_are_rejected() {
        assert!(matches!(
            SignalEnvelope::decode(b"[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            SignalEnvelope::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let decoded =
            SignalEnvelope::decode(br#"{"type":"end","from":"a","to":"b","reason":"busy"}"#)
                .unwrap();
        assert_eq!(decoded.kind(), "end");
    }
}
