//! Configuration
//!
//! Defaults, optionally overlaid by a TOML file, then by command line flags.

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
