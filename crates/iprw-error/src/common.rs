//! Common error types shared across `iprw` crates.

use thiserror::Error;

/// Common errors that occur across multiple `iprw` crates.
///
/// Crate-specific errors should wrap this type using the `#[from]`
/// attribute.
#[derive(Debug, Error)]
pub enum CommonError {
    /// Configuration error.
    ///
    /// Raised by configuration validation: zero capacities, zero timeouts,
    /// out-of-range values.
    #[error("configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
