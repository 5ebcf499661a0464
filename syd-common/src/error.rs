//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `switchyard`.
pub type SydResult<T> = Result<T, SydError>;

/// High-level error categories of the worker runtime.
///
/// The variants remain intentionally broad. The protocol layer carries its own error channel
/// through the handler callbacks and never funnels wire-level failures through this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SydError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A syscall or socket operation failed.
    #[error("io error: {0}")]
    Io(String),
}
