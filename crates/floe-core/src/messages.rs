//! Rendezvous wire codec.
//!
//! The broker speaks JSON over HTTP POST. A proxy polls with its session
//! id, client type, and current NAT type; the broker replies with either an
//! empty offer or a serialized session description. Answers travel the
//! other way with a protocol version tag.

use serde::{Deserialize, Serialize};

use crate::nat::NatType;

/// Protocol version tag carried in answer requests.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Client type reported by a standalone volunteer proxy.
pub const CLIENT_TYPE_STANDALONE: &str = "standalone";

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A session description as it crosses the rendezvous wire: the SDP kind
/// plus the SDP text itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    /// Parse the serialized form embedded in a poll response offer field.
    pub fn deserialize(s: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn serialize(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyPollRequest<'a> {
    #[serde(rename = "Sid")]
    pub sid: &'a str,
    #[serde(rename = "Type")]
    pub client_type: &'a str,
    #[serde(rename = "NAT")]
    pub nat_type: NatType,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxyPollResponse {
    /// Empty when no client was matched this round.
    #[serde(rename = "Offer", default)]
    pub offer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnswerRequest<'a> {
    #[serde(rename = "Version")]
    pub version: &'a str,
    #[serde(rename = "Sid")]
    pub sid: &'a str,
    #[serde(rename = "Answer")]
    pub answer: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnswerResponse {
    #[serde(rename = "Success")]
    pub success: bool,
}

/// Encode a poll request body.
pub fn encode_poll_request(
    sid: &str,
    client_type: &str,
    nat_type: NatType,
) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(&ProxyPollRequest {
        sid,
        client_type,
        nat_type,
    })?)
}

/// Decode a poll response body into the offer string it carries.
/// An empty offer means the broker had no client for us this round.
pub fn decode_poll_response(body: &[u8]) -> Result<String, MessageError> {
    let resp: ProxyPollResponse = serde_json::from_slice(body)?;
    Ok(resp.offer)
}

/// Encode an answer request body.
pub fn encode_answer_request(answer: &str, sid: &str) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(&AnswerRequest {
        version: PROTOCOL_VERSION,
        sid,
        answer,
    })?)
}

/// Decode an answer response body. `false` means the client timed out
/// waiting for this answer.
pub fn decode_answer_response(body: &[u8]) -> Result<bool, MessageError> {
    let resp: AnswerResponse = serde_json::from_slice(body)?;
    Ok(resp.success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_request_round_trip() {
        let body = encode_poll_request("abc123", CLIENT_TYPE_STANDALONE, NatType::Restricted)
            .expect("encode");
        let decoded: ProxyPollRequest = serde_json::from_slice(&body).expect("decode");
        assert_eq!(decoded.sid, "abc123");
        assert_eq!(decoded.client_type, "standalone");
        assert_eq!(decoded.nat_type, NatType::Restricted);
    }

    #[test]
    fn poll_request_uses_wire_field_names() {
        let body =
            encode_poll_request("s", CLIENT_TYPE_STANDALONE, NatType::Unknown).expect("encode");
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["Sid"], "s");
        assert_eq!(v["Type"], "standalone");
        assert_eq!(v["NAT"], "unknown");
    }

    #[test]
    fn poll_response_with_offer() {
        let offer = decode_poll_response(br#"{"Offer":"fake offer"}"#).expect("decode");
        assert_eq!(offer, "fake offer");
    }

    #[test]
    fn poll_response_without_offer_is_empty() {
        let offer = decode_poll_response(b"{}").expect("decode");
        assert!(offer.is_empty());
    }

    #[test]
    fn poll_response_garbage_fails() {
        assert!(decode_poll_response(b"not json").is_err());
    }

    #[test]
    fn answer_round_trip() {
        let body = encode_answer_request("v=0\r\n", "sid").expect("encode");
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["Version"], PROTOCOL_VERSION);
        assert_eq!(v["Sid"], "sid");
        assert_eq!(v["Answer"], "v=0\r\n");

        assert!(decode_answer_response(br#"{"Success":true}"#).unwrap());
        assert!(!decode_answer_response(br#"{"Success":false}"#).unwrap());
    }

    #[test]
    fn session_description_round_trip() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".into(),
        };
        let s = desc.serialize().expect("serialize");
        let back = SessionDescription::deserialize(&s).expect("deserialize");
        assert_eq!(desc, back);

        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["type"], "offer");
    }
}
