//! Configuration for the update pipeline.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OtaError, OtaResult};

/// Upper bound for the post-close restart delay.
pub const MAX_RESTART_DELAY_MS: u64 = 600_000;

/// Update pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtaConfig {
    /// Re-read the written region and compare digests before committing.
    ///
    /// Default: true.
    pub verify: bool,

    /// Whether the platform build supports boot-slot switching and rollback
    /// bookkeeping.
    ///
    /// Default: true.
    pub rollback_supported: bool,

    /// Schedule a restart after a successful close.
    ///
    /// Default: false.
    pub restart_on_close: bool,

    /// Delay before the scheduled restart fires, in milliseconds.
    ///
    /// Default: 10 000 ms.
    pub restart_delay_ms: u64,
}

impl OtaConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> OtaConfigBuilder {
        OtaConfigBuilder::default()
    }

    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`OtaConfig::validate`].
    pub fn load(path: &Path) -> OtaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> OtaResult<()> {
        if self.restart_delay_ms > MAX_RESTART_DELAY_MS {
            return Err(OtaError::InvalidConfiguration(format!(
                "restart_delay_ms must not exceed {MAX_RESTART_DELAY_MS}"
            )));
        }
        if self.restart_on_close && !self.rollback_supported {
            return Err(OtaError::InvalidConfiguration(
                "restart_on_close requires rollback_supported".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the restart delay as a Duration.
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            verify: true,
            rollback_supported: true,
            restart_on_close: false,
            restart_delay_ms: 10_000,
        }
    }
}

/// Builder for `OtaConfig`.
#[derive(Debug, Default)]
pub struct OtaConfigBuilder {
    config: OtaConfig,
}

impl OtaConfigBuilder {
    /// Enable or disable read-back verification.
    #[must_use]
    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify = verify;
        self
    }

    /// Declare whether the platform supports rollback bookkeeping.
    #[must_use]
    pub fn rollback_supported(mut self, supported: bool) -> Self {
        self.config.rollback_supported = supported;
        self
    }

    /// Enable or disable the post-close restart.
    #[must_use]
    pub fn restart_on_close(mut self, restart: bool) -> Self {
        self.config.restart_on_close = restart;
        self
    }

    /// Set the restart delay in milliseconds.
    #[must_use]
    pub fn restart_delay_ms(mut self, ms: u64) -> Self {
        self.config.restart_delay_ms = ms;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> OtaResult<OtaConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
