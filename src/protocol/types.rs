//! Device Protocol Types

use std::fmt;
use crate::protocol::constants::*;

/// Message kinds carried in the second character of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Event,
    Command,
    Response,
    Error,
    Other(char),
}

impl MessageKind {
    /// Create from the wire character
    pub fn from_char(c: char) -> Self {
        match c {
            MSG_EVENT => MessageKind::Event,
            MSG_COMMAND => MessageKind::Command,
            MSG_RESPONSE => MessageKind::Response,
            MSG_ERROR => MessageKind::Error,
            other => MessageKind::Other(other),
        }
    }

    /// Get the wire character for this kind
    pub fn as_char(&self) -> char {
        match self {
            MessageKind::Event => MSG_EVENT,
            MessageKind::Command => MSG_COMMAND,
            MessageKind::Response => MSG_RESPONSE,
            MessageKind::Error => MSG_ERROR,
            MessageKind::Other(c) => *c,
        }
    }

    /// Legacy registration name for this kind, if it has one
    pub fn legacy_alias(&self) -> Option<&'static str> {
        match self {
            MessageKind::Event => Some(LEGACY_EVENT),
            MessageKind::Response => Some(LEGACY_RESPONSE),
            MessageKind::Error => Some(LEGACY_ERROR),
            MessageKind::Command | MessageKind::Other(_) => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A single decoded line: `<tag><kind><content>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub tag: char,
    pub kind: MessageKind,
    pub content: String,
    /// The decoded line as it arrived, without the terminator
    pub line: String,
}

/// Build an outbound line for a device, terminator included
pub fn compose_message(tag: char, kind: MessageKind, payload: &str) -> String {
    format!("{}{}{}\n", tag, kind.as_char(), payload)
}
