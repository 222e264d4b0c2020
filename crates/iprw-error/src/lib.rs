//! Common error types for `iprw`.
//!
//! This crate provides the error variants that every `iprw` crate can run
//! into (bad configuration, missing resources), so that crate-specific
//! errors only need to add what is genuinely their own.
//!
//! # Usage
//!
//! ```rust
//! use iprw_error::CommonError;
//!
//! fn lookup(slot: usize) -> Result<(), CommonError> {
//!     Err(CommonError::not_found(format!("input slot {slot}")))
//! }
//! ```
//!
//! # Crate-Specific Errors
//!
//! Each crate wraps `CommonError` with `#[from]`:
//!
//! ```rust,ignore
//! use iprw_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MyError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("my specific error: {0}")]
//!     Specific(String),
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
