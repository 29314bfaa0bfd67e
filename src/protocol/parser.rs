//! Message Parser

use thiserror::Error;
use super::{MessageKind, ParsedMessage};
use crate::protocol::constants::MIN_MESSAGE_LEN;

/// Reasons a framed line is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("line is not valid UTF-8: {preview:?}")]
    InvalidUtf8 { preview: String },

    #[error("message too short ({len} chars): {line:?}")]
    TooShort { line: String, len: usize },
}

/// Decode a framed line into tag, kind and content.
///
/// Kind and content are not validated here; unknown kinds are passed through.
pub fn parse_line(line: &[u8]) -> Result<ParsedMessage, ProtocolError> {
    let decoded = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8 {
        preview: String::from_utf8_lossy(line).into_owned(),
    })?;

    let len = decoded.chars().count();
    if len < MIN_MESSAGE_LEN {
        return Err(ProtocolError::TooShort { line: decoded.to_string(), len });
    }

    let mut chars = decoded.chars();
    let (Some(tag), Some(kind)) = (chars.next(), chars.next()) else {
        return Err(ProtocolError::TooShort { line: decoded.to_string(), len });
    };

    Ok(ParsedMessage {
        tag,
        kind: MessageKind::from_char(kind),
        content: chars.as_str().to_string(),
        line: decoded.to_string(),
    })
}
