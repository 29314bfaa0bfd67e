//! DeviceLink Library
//!
//! TCP connection broker for warehouse hardware controllers (sorter,
//! environment controller, access gate). Frames the line protocol off each
//! controller's byte stream, resolves which device a connection represents,
//! routes messages to registered handlers and sends commands back by device id.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionInfo, ConnectionManager};
pub use dispatch::DeviceMessage;
pub use registry::DeviceRegistry;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the broker
pub type Result<T> = anyhow::Result<T>;
