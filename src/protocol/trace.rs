//! Wire trace logging for received chunks

use tracing::{trace, Level};

const HEX_PREVIEW_BYTES: usize = 50;
const TEXT_PREVIEW_CHARS: usize = 100;
const MIN_PRINTABLE_RATIO: f64 = 0.7;

/// How a received chunk is rendered in the trace log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPreview {
    Binary { len: usize },
    Text { len: usize, hex: String, text: String },
}

impl ChunkPreview {
    /// Classify a chunk and build its previews
    pub fn of(data: &[u8]) -> Self {
        let len = data.len();
        if data.first().is_some_and(|b| b & 0x80 != 0) {
            return ChunkPreview::Binary { len };
        }

        let text = String::from_utf8_lossy(data);
        let total = text.chars().count();
        let printable = text
            .chars()
            .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
            .count();
        if total == 0 || (printable as f64) / (total as f64) < MIN_PRINTABLE_RATIO {
            return ChunkPreview::Binary { len };
        }

        let mut hex = data
            .iter()
            .take(HEX_PREVIEW_BYTES)
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        if len > HEX_PREVIEW_BYTES {
            hex.push_str("...");
        }

        let mut preview: String = text.chars().take(TEXT_PREVIEW_CHARS).collect();
        if total > TEXT_PREVIEW_CHARS {
            preview.push_str("...");
        }

        ChunkPreview::Text { len, hex, text: preview }
    }
}

/// Log a received chunk at trace level
pub fn log_chunk(connection_id: &str, data: &[u8]) {
    if !tracing::enabled!(Level::TRACE) {
        return;
    }

    match ChunkPreview::of(data) {
        ChunkPreview::Binary { len } => {
            trace!(connection_id = %connection_id, "Received binary data: {} bytes", len);
        }
        ChunkPreview::Text { len, hex, text } => {
            trace!(connection_id = %connection_id, "Received {} bytes", len);
            trace!(connection_id = %connection_id, "HEX: {}", hex);
            trace!(connection_id = %connection_id, "STR: {:?}", text);
        }
    }
}
