//! Tunables for link creation and migration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlumbError, PlumbResult};

/// Environment variable overriding [`NetConfig::link_wait_timeout`] (milliseconds).
pub const LINK_WAIT_TIMEOUT_ENV: &str = "PLUMB_LINK_WAIT_TIMEOUT_MS";

/// Networking configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetConfig {
    /// Upper bound for each wait on a link notification.
    ///
    /// Written as `link_wait_timeout_ms` in TOML.
    #[serde(rename = "link_wait_timeout_ms", with = "millis")]
    pub link_wait_timeout: Duration,
    /// Wait for the kernel to report `IFF_UP` after bringing a migrated link up.
    pub confirm_up: bool,
    /// Delete a freshly created veth pair when a later creation step fails.
    pub cleanup_failed_pairs: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            link_wait_timeout: Duration::from_secs(60),
            confirm_up: true,
            cleanup_failed_pairs: true,
        }
    }
}

impl NetConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::Config`] on malformed input or unknown keys.
    pub fn from_toml_str(input: &str) -> PlumbResult<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> PlumbResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| PlumbError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "Loading network config");
        Self::from_toml_str(&input)?.with_env_overrides()
    }

    /// Apply `PLUMB_LINK_WAIT_TIMEOUT_MS` if set.
    ///
    /// # Errors
    ///
    /// Returns [`PlumbError::Config`] if the variable is not a positive integer.
    pub fn with_env_overrides(self) -> PlumbResult<Self> {
        match std::env::var(LINK_WAIT_TIMEOUT_ENV) {
            Ok(value) => self.with_timeout_override(&value),
            Err(_) => Ok(self),
        }
    }

    fn with_timeout_override(mut self, value: &str) -> PlumbResult<Self> {
        let millis: u64 = value.trim().parse().map_err(|_| PlumbError::Config {
            message: format!(
                "{LINK_WAIT_TIMEOUT_ENV} must be a number of milliseconds, got '{value}'"
            ),
        })?;
        self.link_wait_timeout = Duration::from_millis(millis);
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> PlumbResult<()> {
        if self.link_wait_timeout.is_zero() {
            return Err(PlumbError::Config {
                message: "link_wait_timeout_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Wait bound as a [`Duration`].
    #[must_use]
    pub fn link_wait_timeout(&self) -> Duration {
        self.link_wait_timeout
    }

    /// Set the wait bound. A zero bound fails every wait at once.
    #[must_use]
    pub fn with_link_wait_timeout(mut self, timeout: Duration) -> Self {
        self.link_wait_timeout = timeout;
        self
    }

    /// Skip the post-up confirmation wait.
    #[must_use]
    pub fn without_up_confirmation(mut self) -> Self {
        self.confirm_up = false;
        self
    }
}

/// `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
