//! Engine configuration.
//!
//! ```
//! use json_observe::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str("grace_window_ms = 250").unwrap();
//! assert_eq!(config.grace_window().as_millis(), 250);
//! assert_eq!(config.batch_delay().as_millis(), 10);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_GRACE_WINDOW_MS: u64 = 10_000;
const DEFAULT_BATCH_DELAY_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an overwritten container stays tracked before its entries
    /// are reclaimed.
    pub grace_window_ms: u64,
    /// Delay used by batched delivery when no explicit delay is given.
    pub batch_delay_ms: u64,
    /// Wrap every nested container eagerly when a context is created.
    pub previsit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            previsit: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path)?;
        Self::from_toml_str(&src)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}
