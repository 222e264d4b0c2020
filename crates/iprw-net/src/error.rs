//! Error types for the flow rewriter.

use iprw_error::CommonError;
use thiserror::Error;

use crate::rewriter::FlowId;

/// Result type alias for rewriter operations.
pub type Result<T> = std::result::Result<T, RewriteError>;

/// Errors that can occur while managing rewritten flows.
///
/// Only recoverable conditions live here. Calling [`Flow::apply`] on a
/// packet without a network header, or finding a heap slot that does not
/// hold the flow it should, are programming errors and panic instead.
///
/// [`Flow::apply`]: crate::rewriter::Flow::apply
#[derive(Debug, Error)]
pub enum RewriteError {
    /// Common errors shared across `iprw` crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The table is at capacity and no best-effort flow could be reclaimed.
    #[error("flow table full ({capacity} flows)")]
    TableFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// One of the new flow's identifiers is already mapped.
    #[error("flow {0} is already mapped")]
    DuplicateFlow(FlowId),

    /// The input slot does not exist.
    #[error("unknown input slot {0}")]
    UnknownInput(usize),

    /// The packet cannot be rewritten by this table.
    #[error("packet error: {0}")]
    Packet(String),
}

impl RewriteError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::config(msg))
    }

    /// Creates a packet error.
    #[must_use]
    pub fn packet(msg: impl Into<String>) -> Self {
        Self::Packet(msg.into())
    }

    /// Returns true if the error reports a full table.
    #[must_use]
    pub const fn is_table_full(&self) -> bool {
        matches!(self, Self::TableFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_table_full_message() {
        let err = RewriteError::TableFull { capacity: 8 };
        assert!(err.is_table_full());
        assert_eq!(err.to_string(), "flow table full (8 flows)");
    }

    #[test]
    fn test_duplicate_flow_message() {
        let id = FlowId::new(
            Ipv4Addr::new(10, 0, 0, 1),
            1000,
            Ipv4Addr::new(10, 0, 0, 2),
            80,
            6,
        );
        let err = RewriteError::DuplicateFlow(id);
        assert_eq!(
            err.to_string(),
            "flow (10.0.0.1, 1000, 10.0.0.2, 80) is already mapped"
        );
    }

    #[test]
    fn test_config_wraps_common() {
        let err = RewriteError::config("capacity must be non-zero");
        assert!(matches!(err, RewriteError::Common(ref c) if c.is_config()));
        assert_eq!(
            err.to_string(),
            "configuration error: capacity must be non-zero"
        );
    }
}
