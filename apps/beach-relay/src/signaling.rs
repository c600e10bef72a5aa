use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SignalingError;

/// Signaling message types understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound wire shape. The tag stays a string so unknown types can be
/// reported by name instead of failing as a generic parse error.
#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
}

/// One frame of the signaling protocol: `{"type": ..., "data": ...}`.
///
/// `data` is an opaque session-description or candidate blob. It is carried
/// and stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: String,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    #[cfg(test)]
    pub fn offer(data: impl Into<String>) -> Self {
        Self::new(SignalKind::Offer, data)
    }

    pub fn answer(data: impl Into<String>) -> Self {
        Self::new(SignalKind::Answer, data)
    }

    #[cfg(test)]
    pub fn candidate(data: impl Into<String>) -> Self {
        Self::new(SignalKind::Candidate, data)
    }

    /// Decode a single text frame into a fresh message.
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let raw: RawSignal = serde_json::from_str(text)?;
        let kind = SignalKind::from_tag(&raw.kind).ok_or(SignalingError::UnknownType(raw.kind))?;
        Ok(Self {
            kind,
            data: raw.data,
        })
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_known_type() {
        let offer = SignalMessage::decode(r#"{"type":"offer","data":"v=0"}"#).unwrap();
        assert_eq!(offer, SignalMessage::offer("v=0"));

        let answer = SignalMessage::decode(r#"{"type":"answer","data":"v=0 a"}"#).unwrap();
        assert_eq!(answer.kind, SignalKind::Answer);

        let candidate =
            SignalMessage::decode(r#"{"type":"candidate","data":"candidate:1 1 udp"}"#).unwrap();
        assert_eq!(candidate.kind, SignalKind::Candidate);
        assert_eq!(candidate.data, "candidate:1 1 udp");
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        match SignalMessage::decode(r#"{"type":"bogus","data":"x"}"#) {
            Err(SignalingError::UnknownType(tag)) => assert_eq!(tag, "bogus"),
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            SignalMessage::decode("{not json"),
            Err(SignalingError::Decode(_))
        ));
        // data must be a string blob
        assert!(matches!(
            SignalMessage::decode(r#"{"type":"offer","data":{"sdp":"v=0"}}"#),
            Err(SignalingError::Decode(_))
        ));
    }

    #[test]
    fn missing_data_decodes_as_empty_payload() {
        let msg = SignalMessage::decode(r#"{"type":"candidate"}"#).unwrap();
        assert_eq!(msg.data, "");
    }

    #[test]
    fn encodes_wire_shape() {
        let json = SignalMessage::answer("SDP-B").encode().unwrap();
        assert_eq!(json, r#"{"type":"answer","data":"SDP-B"}"#);
    }

    #[test]
    fn payload_is_carried_verbatim() {
        let sdp = "v=0\r\no=- 46117317 2 IN IP4 127.0.0.1\r\ns=-\r\n";
        let encoded = SignalMessage::offer(sdp).encode().unwrap();
        let decoded = SignalMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.data, sdp);
    }
}
