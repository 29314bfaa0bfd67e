//! Handler Registration Table

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;
use crate::protocol::MessageKind;

/// Record handed to a device handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// Raw tag the message arrived with
    pub device_tag: char,
    pub kind: MessageKind,
    pub content: String,
    /// Full original line, set only for canonical-id matches
    pub raw: Option<String>,
}

/// Callback invoked for a routed message
pub type DeviceHandler = Arc<dyn Fn(DeviceMessage) -> anyhow::Result<()> + Send + Sync>;

/// (device id, kind) -> handler. Device id is either a canonical id or a raw
/// tag; kind is a single character or a legacy alias such as `evt`.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, HashMap<String, DeviceHandler>>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("keys", &self.keys())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite the handler for (device id, kind)
    pub fn register(&self, device_id: &str, kind: &str, handler: DeviceHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(device_id.to_string())
            .or_default()
            .insert(kind.to_string(), handler);
        debug!("Registered device handler: {}, {}", device_id, kind);
    }

    /// Look up a handler; the returned clone is invoked outside the lock
    pub fn get(&self, device_id: &str, kind: &str) -> Option<DeviceHandler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(device_id).and_then(|by_kind| by_kind.get(kind)).cloned()
    }

    /// Registered (device id, kind) pairs, sorted
    pub fn keys(&self) -> Vec<(String, String)> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = handlers
            .iter()
            .flat_map(|(device, by_kind)| {
                by_kind.keys().map(move |kind| (device.clone(), kind.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.values().all(HashMap::is_empty)
    }
}
