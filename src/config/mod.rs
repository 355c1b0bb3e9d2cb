//! Configuration parsing and types.
//!
//! - `types` - root [`ManagerConfig`] plus pool, idle, port and timeout sections
//! - `sandbox` - container image, network and resource envelope
//! - `duration` - human-readable duration strings
//! - `parser` - YAML loading and environment overrides
//! - `validation` - config validation

mod duration;
mod parser;
mod sandbox;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use sandbox::*;
pub use types::*;
