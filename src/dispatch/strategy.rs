//! Handler resolution strategies, evaluated in [`RESOLUTION_ORDER`].

use crate::protocol::MessageKind;

/// One way of building a handler key from an incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// (canonical id, kind)
    CanonicalKind,
    /// (raw tag, kind)
    RawKind,
    /// (canonical id, legacy alias of kind)
    CanonicalLegacy,
    /// (raw tag, legacy alias of kind)
    RawLegacy,
}

pub const RESOLUTION_ORDER: [ResolutionStrategy; 4] = [
    ResolutionStrategy::CanonicalKind,
    ResolutionStrategy::RawKind,
    ResolutionStrategy::CanonicalLegacy,
    ResolutionStrategy::RawLegacy,
];

/// Identifiers a message can be routed by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget<'a> {
    pub canonical_id: &'a str,
    pub raw_tag: char,
    pub kind: MessageKind,
}

impl ResolutionStrategy {
    /// Handler key for this strategy, or `None` when it does not apply
    pub fn key(&self, target: &DispatchTarget<'_>) -> Option<(String, String)> {
        let kind = target.kind.as_char().to_string();
        match self {
            ResolutionStrategy::CanonicalKind => Some((target.canonical_id.to_string(), kind)),
            ResolutionStrategy::RawKind => Some((target.raw_tag.to_string(), kind)),
            ResolutionStrategy::CanonicalLegacy => target
                .kind
                .legacy_alias()
                .map(|alias| (target.canonical_id.to_string(), alias.to_string())),
            ResolutionStrategy::RawLegacy => target
                .kind
                .legacy_alias()
                .map(|alias| (target.raw_tag.to_string(), alias.to_string())),
        }
    }

    /// Whether the handler receives the full original line
    pub fn forwards_raw_line(&self) -> bool {
        matches!(self, ResolutionStrategy::CanonicalKind)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResolutionStrategy::CanonicalKind => "canonical id",
            ResolutionStrategy::RawKind => "raw id",
            ResolutionStrategy::CanonicalLegacy => "legacy mapping",
            ResolutionStrategy::RawLegacy => "raw id + legacy mapping",
        }
    }
}
