//! Configuration management
//!
//! Loads and validates config.toml: the router identity, logging, and
//! the port roster with seed network and zone assignments.

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: Config = toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config)
}
