//! Container ID and interface name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PlumbError, PlumbResult};

/// Maximum interface name length, including the NUL terminator.
pub const IFNAMSIZ: usize = 16;

/// A validated container ID.
///
/// Container IDs must:
/// - Be 1-128 characters long
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> PlumbResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> PlumbResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(PlumbError::InvalidContainerId { id: id.to_string() });
        }

        if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(PlumbError::InvalidContainerId { id: id.to_string() });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(PlumbError::InvalidContainerId { id: id.to_string() });
        }

        Ok(())
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = PlumbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = PlumbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a network interface name before it reaches the kernel.
///
/// # Errors
///
/// Returns [`PlumbError::InvalidArgument`] when the name is empty, longer than
/// `IFNAMSIZ - 1` bytes, `.`/`..`, or contains `/`, NUL or whitespace.
pub fn validate_ifname(name: &str) -> PlumbResult<()> {
    if name.is_empty() {
        return Err(PlumbError::invalid_argument("interface name cannot be empty"));
    }

    if name.len() >= IFNAMSIZ {
        return Err(PlumbError::invalid_argument(format!(
            "interface name '{name}' is too long (max {} bytes)",
            IFNAMSIZ - 1
        )));
    }

    if name == "." || name == ".." {
        return Err(PlumbError::invalid_argument(format!(
            "interface name '{name}' is reserved"
        )));
    }

    if name
        .chars()
        .any(|c| c == '/' || c == '\0' || c.is_whitespace())
    {
        return Err(PlumbError::invalid_argument(format!(
            "interface name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}
