use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encodes one websocket text frame. Frames are bare JSON, one value each.
pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(|c| c == '\n' || c == '\r');
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes a binary frame that carries UTF-8 JSON.
pub fn decode_binary_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|err| FrameError::Decode(err.to_string()))?;
    decode_frame(text, max_frame_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentBlock, Fragment, Message, Role};
    use serde_json::Map;

    fn outbound() -> Message {
        Message {
            id: "m1".to_string(),
            role: Role::User,
            content: vec![ContentBlock::text("hi")],
            status: None,
            conversation_id: "c1".to_string(),
            created_at: None,
            meta_data: Map::new(),
        }
    }

    #[test]
    fn outbound_frame_omits_absent_optionals() {
        let frame = encode_frame(&outbound(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["role"], "user");
        assert_eq!(value["conversation_id"], "c1");
        assert!(value.get("status").is_none());
        assert!(value.get("created_at").is_none());
        assert_eq!(value["meta_data"], serde_json::json!({}));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let mut message = outbound();
        message.content = vec![ContentBlock::text("x".repeat(128))];
        let result = encode_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn decoder_tolerates_trailing_newline() {
        let fragment: Fragment =
            decode_frame("{\"status\":\"complete\"}\r\n", DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert!(fragment.is_complete());
    }

    #[test]
    fn decoder_reports_malformed_json() {
        let result = decode_frame::<Fragment>("{\"id\": ", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        let result = decode_binary_frame::<Fragment>(&[0xff, 0xfe], DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));

        let ok: Fragment =
            decode_binary_frame(br#"{"id":"m2","content":[]}"#, DEFAULT_MAX_FRAME_BYTES)
                .expect("decode binary");
        assert_eq!(ok.id.as_deref(), Some("m2"));
    }
}
