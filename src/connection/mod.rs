//! Connection Management Module
//!
//! Handles TCP connection acceptance, per-connection framing and dispatch,
//! outbound sends and liveness-based eviction.

pub mod manager;
pub mod sweeper;
pub mod table;

pub use manager::ConnectionManager;
pub use sweeper::LivenessSweeper;
pub use table::{ConnectionInfo, ConnectionTable, IdentityUpdate, SendTarget};
