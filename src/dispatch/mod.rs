//! Message Dispatch
//!
//! Handler registration and priority-ordered routing of parsed messages.

pub mod dispatcher;
pub mod handlers;
pub mod strategy;

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use handlers::{DeviceHandler, DeviceMessage, HandlerTable};
pub use strategy::{DispatchTarget, ResolutionStrategy, RESOLUTION_ORDER};
