use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{ClientFrame, ClientMessage, Keepalive, ServerFrame, ServerMessage};

/// A frame that could not be understood. Always recoverable: the frame is
/// dropped and the connection carries on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
    #[error("unknown keepalive literal {0:?}")]
    UnknownKeepalive(String),
    #[error("frame is neither a keepalive string nor a message object")]
    UnexpectedShape,
}

enum Decoded<M> {
    Keepalive(Keepalive),
    Message(M),
}

fn decode_frame<M: DeserializeOwned>(text: &str) -> Result<Decoded<M>, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::String(literal) => match literal.as_str() {
            "ping" => Ok(Decoded::Keepalive(Keepalive::Ping)),
            "pong" => Ok(Decoded::Keepalive(Keepalive::Pong)),
            _ => Err(ProtocolError::UnknownKeepalive(literal)),
        },
        Value::Object(_) => Ok(Decoded::Message(serde_json::from_value(value)?)),
        _ => Err(ProtocolError::UnexpectedShape),
    }
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

fn utf8(bytes: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(match decode_frame::<ClientMessage>(text)? {
            Decoded::Keepalive(keepalive) => ClientFrame::Keepalive(keepalive),
            Decoded::Message(message) => ClientFrame::Message(message),
        })
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(utf8(bytes)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(match decode_frame::<ServerMessage>(text)? {
            Decoded::Keepalive(keepalive) => ServerFrame::Keepalive(keepalive),
            Decoded::Message(message) => ServerFrame::Message(message),
        })
    }

    pub fn decode_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(utf8(bytes)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerId;
    use serde_json::json;

    #[test_timeout::timeout]
    fn keepalives_are_bare_strings() {
        assert_eq!(
            ClientFrame::Keepalive(Keepalive::Ping).encode().unwrap(),
            "\"ping\""
        );
        assert_eq!(
            ServerFrame::decode("\"pong\"").unwrap(),
            ServerFrame::Keepalive(Keepalive::Pong)
        );
        assert!(matches!(
            ClientFrame::decode("\"hello\""),
            Err(ProtocolError::UnknownKeepalive(literal)) if literal == "hello"
        ));
    }

    #[test_timeout::timeout]
    fn join_and_leave_carry_only_the_tag() {
        let join = ClientFrame::from(ClientMessage::Join).encode().unwrap();
        assert_eq!(join, r#"{"msgType":"join"}"#);
        assert_eq!(
            ClientFrame::decode(r#"{"msgType":"leave"}"#).unwrap(),
            ClientFrame::Message(ClientMessage::Leave)
        );
    }

    #[test_timeout::timeout]
    fn greet_uses_camel_case_fields() {
        let frame = ServerFrame::from(ServerMessage::Greet {
            remote_peer_id: PeerId::new(4),
            polite: true,
        });
        let text = frame.encode().unwrap();
        assert_eq!(text, r#"{"msgType":"greet","remotePeerId":4,"polite":true}"#);
        assert_eq!(ServerFrame::decode(&text).unwrap(), frame);
    }

    #[test_timeout::timeout]
    fn null_candidate_is_end_of_candidates() {
        let frame =
            ClientFrame::decode(r#"{"msgType":"iceCandidate","remotePeerId":1,"data":null}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Message(ClientMessage::IceCandidate {
                remote_peer_id: PeerId::new(1),
                data: None,
            })
        );
        let echoed = ServerFrame::from(ServerMessage::IceCandidate {
            remote_peer_id: PeerId::new(1),
            data: None,
        })
        .encode()
        .unwrap();
        assert!(echoed.contains(r#""data":null"#));
    }

    #[test_timeout::timeout]
    fn opaque_payload_keeps_key_order() {
        let text = r#"{"msgType":"sessionDescription","remotePeerId":2,"data":{"type":"offer","sdp":"v=0","zeta":1,"alpha":2}}"#;
        let ClientFrame::Message(message) = ClientFrame::decode(text).unwrap() else {
            panic!("expected message frame");
        };
        let (_, target, data) = message.into_relay().unwrap();
        assert_eq!(target, PeerId::new(2));
        let data = data.unwrap();
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"type":"offer","sdp":"v=0","zeta":1,"alpha":2}"#
        );
        assert_eq!(data, json!({"type": "offer", "sdp": "v=0", "zeta": 1, "alpha": 2}));
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ClientFrame::decode("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ClientFrame::decode(r#"{"msgType":"teleport"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ClientFrame::decode(r#"{"msgType":"sessionDescription","data":{}}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ClientFrame::decode("42"),
            Err(ProtocolError::UnexpectedShape)
        ));
        assert!(matches!(
            ClientFrame::decode_binary(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }
}
