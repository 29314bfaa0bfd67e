//! Device Protocol Constants

// Device tags (first character of every line)
pub const DEVICE_SORTER: char = 'S';
pub const DEVICE_WAREHOUSE: char = 'H';
pub const DEVICE_GATE: char = 'G';

// Canonical device identifiers
pub const SORT_CONTROLLER: &str = "sort_controller";
pub const ENV_CONTROLLER: &str = "env_controller";
pub const ACCESS_CONTROLLER: &str = "access_controller";

// Message kinds (second character of every line)
pub const MSG_EVENT: char = 'E';
pub const MSG_COMMAND: char = 'C';
pub const MSG_RESPONSE: char = 'R';
pub const MSG_ERROR: char = 'X';

// Legacy kind names, accepted only as handler registration aliases
pub const LEGACY_EVENT: &str = "evt";
pub const LEGACY_RESPONSE: &str = "res";
pub const LEGACY_ERROR: &str = "err";

// Common payloads
pub const RESPONSE_OK: &str = "ok";
pub const ERROR_COMM: &str = "e1";
pub const ERROR_SENSOR: &str = "e2";

// Framing
pub const LINE_TERMINATOR: u8 = b'\n';
pub const MIN_MESSAGE_LEN: usize = 2;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;
