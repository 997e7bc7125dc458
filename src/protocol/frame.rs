//! Frame classification and the tagged control framing.
//!
//! The engine speaks two frame shapes over one socket:
//! - **DirectJSON**: raw UTF-8 JSON text beginning with `{"`.
//! - **TaggedControl**: 4 ASCII bytes `CONI`, then UTF-8 text that must
//!   start with the literal prefix `json:`; the remainder is the JSON
//!   payload.
//!
//! Outbound commands are always TaggedControl:
//! `CONI` + `json:` + JSON text, sent as one write. The tag and prefix
//! are a hard wire-format contract: the remote endpoint accepts this
//! exact framing and nothing else, so the byte layout here must never
//! drift.

use crate::error::{MonitorError, Result};
use crate::protocol::message::WireMessage;

/// 4-byte ASCII tag marking a control frame.
pub const CONTROL_TAG: &str = "CONI";

/// Literal prefix of a control frame's payload text.
pub const JSON_PREFIX: &str = "json:";

/// Classification of a raw inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Raw JSON text (`{"` prefix).
    DirectJson,
    /// `CONI`-tagged control frame.
    TaggedControl,
    /// Neither shape. A `{`-leading payload still gets a best-effort
    /// JSON parse; everything else is discarded.
    Unrecognized,
}

impl FrameKind {
    /// Classify a raw frame buffer by its prefix.
    pub fn classify(buf: &[u8]) -> FrameKind {
        if buf.starts_with(b"{\"") {
            FrameKind::DirectJson
        } else if buf.starts_with(CONTROL_TAG.as_bytes()) {
            FrameKind::TaggedControl
        } else {
            FrameKind::Unrecognized
        }
    }
}

/// Encode a command as an outbound TaggedControl frame.
///
/// Produces `CONI` + `json:` + JSON text, the exact byte sequence the
/// engine expects, ready to send as a single text frame.
pub fn encode_command(message: &WireMessage) -> Result<String> {
    let json = serde_json::to_string(message)?;
    let mut frame = String::with_capacity(CONTROL_TAG.len() + JSON_PREFIX.len() + json.len());
    frame.push_str(CONTROL_TAG);
    frame.push_str(JSON_PREFIX);
    frame.push_str(&json);
    Ok(frame)
}

/// Decode one inbound frame into a typed message.
///
/// Returns `Ok(None)` for frames that are discarded by design
/// (unrecognized payloads, failed best-effort parses). Returns
/// `Err(MonitorError::Frame)` for malformed tagged frames (bad UTF-8,
/// missing `json:` prefix) and `Err(MonitorError::Json)` for payloads
/// that fail to parse or validate as a protocol message. Either error
/// drops the single frame; the session continues.
pub fn decode_frame(buf: &[u8]) -> Result<Option<WireMessage>> {
    match FrameKind::classify(buf) {
        FrameKind::DirectJson => {
            let message = serde_json::from_slice(buf)?;
            Ok(Some(message))
        }
        FrameKind::TaggedControl => {
            let text = std::str::from_utf8(&buf[CONTROL_TAG.len()..])
                .map_err(|_| MonitorError::Frame("control payload is not UTF-8".into()))?;
            let json = text.strip_prefix(JSON_PREFIX).ok_or_else(|| {
                MonitorError::Frame(format!(
                    "control payload missing `{}` prefix",
                    JSON_PREFIX
                ))
            })?;
            let message = serde_json::from_str(json)?;
            Ok(Some(message))
        }
        FrameKind::Unrecognized => {
            if buf.first() == Some(&b'{') {
                // Best-effort: some engines send JSON with leading
                // whitespace inside the object or non-standard spacing.
                Ok(serde_json::from_slice(buf).ok())
            } else {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_direct_json() {
        assert_eq!(
            FrameKind::classify(br#"{"message":"filters","filters":[]}"#),
            FrameKind::DirectJson
        );
    }

    #[test]
    fn test_classify_tagged_control() {
        assert_eq!(
            FrameKind::classify(b"CONIjson:{\"message\":\"details\"}"),
            FrameKind::TaggedControl
        );
    }

    #[test]
    fn test_classify_unrecognized() {
        assert_eq!(FrameKind::classify(b"hello"), FrameKind::Unrecognized);
        assert_eq!(FrameKind::classify(b"{x"), FrameKind::Unrecognized);
        assert_eq!(FrameKind::classify(b""), FrameKind::Unrecognized);
        // CONI must be the first 4 bytes exactly.
        assert_eq!(FrameKind::classify(b"CONjson:{}"), FrameKind::Unrecognized);
    }

    #[test]
    fn test_encode_get_details_exact_bytes() {
        let frame = encode_command(&WireMessage::GetDetails { idx: 4 }).unwrap();
        assert_eq!(frame, r#"CONIjson:{"message":"get_details","idx":4}"#);
    }

    #[test]
    fn test_encode_get_all_filters_exact_bytes() {
        let frame = encode_command(&WireMessage::GetAllFilters).unwrap();
        assert_eq!(frame, r#"CONIjson:{"message":"get_all_filters"}"#);
    }

    #[test]
    fn test_encode_stop_details_exact_bytes() {
        let frame = encode_command(&WireMessage::StopDetails { idx: 12 }).unwrap();
        assert_eq!(frame, r#"CONIjson:{"message":"stop_details","idx":12}"#);
    }

    #[test]
    fn test_encoded_frames_carry_the_control_tag() {
        // The encoder and the classifier must agree on the one tag
        // constant; an encoded command always classifies as tagged.
        let frame = encode_command(&WireMessage::GetAllFilters).unwrap();
        assert!(frame.starts_with(CONTROL_TAG));
        assert_eq!(
            FrameKind::classify(frame.as_bytes()),
            FrameKind::TaggedControl
        );
    }

    #[test]
    fn test_decode_direct_json() {
        let msg = decode_frame(br#"{"message":"filters","filters":[]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "filters");
    }

    #[test]
    fn test_decode_tagged_control() {
        let msg = decode_frame(b"CONIjson:{\"message\":\"update\",\"filters\":[]}")
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "update");
    }

    #[test]
    fn test_decode_own_encoding_round_trip() {
        let command = WireMessage::GetDetails { idx: 7 };
        let frame = encode_command(&command).unwrap();
        let decoded = decode_frame(frame.as_bytes()).unwrap().unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_tagged_control_without_json_prefix_is_malformed() {
        let result = decode_frame(b"CONItext:hello");
        assert!(matches!(result, Err(MonitorError::Frame(_))));
    }

    #[test]
    fn test_tagged_control_with_invalid_utf8_is_malformed() {
        let mut buf = b"CONIjson:".to_vec();
        buf.extend_from_slice(&[0xff, 0xfe]);
        let result = decode_frame(&buf);
        assert!(matches!(result, Err(MonitorError::Frame(_))));
    }

    #[test]
    fn test_tagged_control_with_unknown_kind_is_json_error() {
        let result = decode_frame(b"CONIjson:{\"message\":\"explode\"}");
        assert!(matches!(result, Err(MonitorError::Json(_))));
    }

    #[test]
    fn test_direct_json_with_bad_schema_is_json_error() {
        let result = decode_frame(br#"{"message":"details","filter":{"idx":"one"}}"#);
        assert!(matches!(result, Err(MonitorError::Json(_))));
    }

    #[test]
    fn test_unrecognized_non_json_is_discarded() {
        assert_eq!(decode_frame(b"PING 1234").unwrap(), None);
    }

    #[test]
    fn test_unrecognized_brace_payload_best_effort_parses() {
        // `{` followed by whitespace misses the `{"` fast path but is
        // still a valid protocol message.
        let msg = decode_frame(b"{ \"message\": \"filters\", \"filters\": [] }")
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "filters");
    }

    #[test]
    fn test_unrecognized_brace_garbage_is_discarded() {
        assert_eq!(decode_frame(b"{not json at all").unwrap(), None);
    }
}
