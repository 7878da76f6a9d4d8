use serde::Deserialize;

use crate::error::ConfigError;

/// Coordinator settings.
///
/// Usually embedded in the host application's TOML configuration:
///
/// ```toml
/// enabled = true
/// fallback = "#ERR"
/// workers = 4
/// max_age = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Whether results are memoized. When disabled, every trigger computes
    /// afresh and nothing is stored.
    pub enabled: bool,
    /// Written to the sink when a transformation fails.
    pub fallback: Option<String>,
    /// Size of the worker pool. `None` computes on the triggering thread.
    pub workers: Option<usize>,
    /// Maximum age of settled entries kept by [`Coordinator::evict`].
    ///
    /// [`Coordinator::evict`]: crate::Coordinator::evict
    pub max_age: usize,
}

impl Config {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("`workers` must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { enabled: true, fallback: None, workers: None, max_age: 8 }
    }
}
