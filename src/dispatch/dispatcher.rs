//! Message Dispatcher

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn, Level};

use super::handlers::{DeviceHandler, DeviceMessage, HandlerTable};
use super::strategy::{DispatchTarget, ResolutionStrategy, RESOLUTION_ORDER};
use crate::protocol::ParsedMessage;

/// Failure inside a handler invocation
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Result of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(ResolutionStrategy),
    HandlerFailed(ResolutionStrategy),
    Unhandled,
}

/// Routes parsed messages to registered handlers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    handlers: Arc<HandlerTable>,
    verbose: bool,
}

impl Dispatcher {
    /// Create a dispatcher; `verbose` dumps registered handlers on a miss
    pub fn new(handlers: Arc<HandlerTable>, verbose: bool) -> Self {
        Self { handlers, verbose }
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    /// Invoke the first handler that matches, in resolution order
    pub fn dispatch(&self, canonical_id: &str, message: &ParsedMessage) -> DispatchOutcome {
        let target = DispatchTarget {
            canonical_id,
            raw_tag: message.tag,
            kind: message.kind,
        };

        for strategy in RESOLUTION_ORDER {
            let Some((device, kind)) = strategy.key(&target) else {
                continue;
            };
            let Some(handler) = self.handlers.get(&device, &kind) else {
                continue;
            };

            debug!(
                "Message received ({}{}): {} (via {})",
                message.tag, message.kind, message.content, strategy.label()
            );

            let record = DeviceMessage {
                device_tag: message.tag,
                kind: message.kind,
                content: message.content.clone(),
                raw: strategy.forwards_raw_line().then(|| message.line.clone()),
            };

            return match Self::invoke(&handler, record) {
                Ok(()) => DispatchOutcome::Handled(strategy),
                Err(e) => {
                    error!(
                        "Error in handler {}:{} for message {:?}: {}",
                        device, kind, message.line, e
                    );
                    DispatchOutcome::HandlerFailed(strategy)
                }
            };
        }

        warn!(
            "No handler: device={}, kind={}, raw_id={}",
            canonical_id, message.kind, message.tag
        );
        self.dump_registered();
        DispatchOutcome::Unhandled
    }

    fn invoke(handler: &DeviceHandler, record: DeviceMessage) -> Result<(), DispatchError> {
        match catch_unwind(AssertUnwindSafe(|| handler(record))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::Failed(e)),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(DispatchError::Panicked(reason))
            }
        }
    }

    /// Registered `device:kind` keys to report on a miss, or `None` unless
    /// verbose mode or DEBUG logging is on
    pub fn miss_report(&self) -> Option<Vec<String>> {
        if !self.verbose && !tracing::enabled!(Level::DEBUG) {
            return None;
        }

        Some(
            self.handlers
                .keys()
                .iter()
                .map(|(device, kind)| format!("{}:{}", device, kind))
                .collect(),
        )
    }

    fn dump_registered(&self) {
        let Some(listing) = self.miss_report() else {
            return;
        };

        if listing.is_empty() {
            warn!("No handlers registered");
        } else {
            warn!("Registered handlers: {}", listing.join(", "));
        }
    }
}
