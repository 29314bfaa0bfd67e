//! Device Line Protocol
//!
//! Each message is `<tag:1 char><kind:1 char><content>` terminated by `\n`.

pub mod constants;
pub mod framer;
pub mod parser;
pub mod trace;
pub mod types;

pub use constants::*;
pub use framer::LineFramer;
pub use parser::{parse_line, ProtocolError};
pub use types::*;
