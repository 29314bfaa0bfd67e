//! Device Registry
//!
//! Static mapping between single-character device tags and canonical device
//! identifiers. Read-only once built.

use std::collections::HashMap;
use tracing::warn;
use crate::config::DevicesConfig;
use crate::protocol::constants::*;

/// Bidirectional tag <-> canonical id lookup
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    by_tag: HashMap<char, String>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        let by_tag = [
            (DEVICE_SORTER, SORT_CONTROLLER),
            (DEVICE_WAREHOUSE, ENV_CONTROLLER),
            (DEVICE_GATE, ACCESS_CONTROLLER),
        ]
        .into_iter()
        .map(|(tag, id)| (tag, id.to_string()))
        .collect();

        Self { by_tag }
    }
}

impl DeviceRegistry {
    /// Create a registry with the built-in sorter, environment and gate tags
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in tags extended or overridden by `devices.tag_mapping`
    pub fn from_config(config: &DevicesConfig) -> Self {
        let mut registry = Self::default();
        for (tag, device_id) in &config.tag_mapping {
            let mut chars = tag.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    registry.by_tag.insert(c, device_id.clone());
                }
                _ => warn!("Ignoring tag mapping {:?} -> {}: tag must be one character", tag, device_id),
            }
        }
        registry
    }

    /// Canonical id for a raw tag; unmapped tags map to themselves
    pub fn canonical_id(&self, tag: char) -> String {
        self.by_tag
            .get(&tag)
            .cloned()
            .unwrap_or_else(|| tag.to_string())
    }

    /// Raw tag that maps to a canonical id
    pub fn raw_tag(&self, canonical_id: &str) -> Option<char> {
        self.by_tag
            .iter()
            .find(|(_, id)| id.as_str() == canonical_id)
            .map(|(tag, _)| *tag)
    }

    /// All mappings sorted by tag
    pub fn mappings(&self) -> Vec<(char, String)> {
        let mut mappings: Vec<_> = self
            .by_tag
            .iter()
            .map(|(tag, id)| (*tag, id.clone()))
            .collect();
        mappings.sort();
        mappings
    }
}
