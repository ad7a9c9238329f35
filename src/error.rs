//! Unified error handling for matmulforge
//!
//! Every fallible step of primitive creation, resource staging and
//! execution returns a [`ForgeError`]. Errors are categorized so callers can
//! decide whether to pick another configuration, retry later or report a bug:
//! - User errors (unsupported configuration, bad arguments)
//! - Recoverable errors (out of device memory)
//! - Backend errors (compiler, map/unmap, kernel launch)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

/// Unified error type for matmulforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Validation Errors ==========
    /// The requested data types / attributes are not supported by this primitive
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Inconsistent shapes or malformed attribute values
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Invalid engine or logging configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Backend Errors ==========
    /// The kernel compiler produced no binary
    #[error("Kernel compilation failed: {0}")]
    CompilationFailed(String),

    /// Device memory allocation failed
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Buffer map/unmap or other runtime failure
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Kernel launch failed
    #[error("Kernel launch failed: {0}")]
    KernelLaunchFailed(String),

    /// Execution was requested before the resource was created for the engine
    #[error("Resource not created: {0}")]
    ResourceNotCreated(String),

    // ========== Internal Errors ==========
    /// Kernel binary could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a bug or a panic while holding a lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    ///
    /// # Examples
    /// ```ignore
    /// match error.category() {
    ///     ErrorCategory::User => println!("choose a different configuration"),
    ///     ErrorCategory::Recoverable => println!("free memory and retry"),
    ///     ErrorCategory::Backend => println!("device failure"),
    ///     ErrorCategory::Internal => println!("report this bug"),
    /// }
    /// ```
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::UnsupportedConfiguration(_)
            | ForgeError::InvalidArguments(_)
            | ForgeError::InvalidConfiguration(_)
            | ForgeError::ResourceNotCreated(_) => ErrorCategory::User,

            ForgeError::OutOfMemory(_) => ErrorCategory::Recoverable,

            ForgeError::CompilationFailed(_)
            | ForgeError::RuntimeError(_)
            | ForgeError::KernelLaunchFailed(_) => ErrorCategory::Backend,

            ForgeError::Serialization(_)
            | ForgeError::InternalError(_)
            | ForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if the caller may retry the same operation later
    ///
    /// Out-of-memory during staging and transient launch failures qualify;
    /// validation rejections and compilation failures never do.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ForgeError::OutOfMemory(_) | ForgeError::KernelLaunchFailed(_)
        )
    }

    /// Check if this is a user-facing error (actionable by the caller)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or unsupported request
    User,
    /// Temporary condition, caller may retry
    Recoverable,
    /// Device compiler or runtime failure
    Backend,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create an unsupported-configuration error
///
/// # Examples
/// ```ignore
/// return Err(unsupported!("post-op list of length {}", len));
/// ```
#[macro_export]
macro_rules! unsupported {
    ($msg:expr) => {
        $crate::error::ForgeError::UnsupportedConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::UnsupportedConfiguration(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-arguments error
#[macro_export]
macro_rules! invalid_args {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidArguments($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidArguments(format!($fmt, $($arg)*))
    };
}

/// Create an internal error
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InternalError(format!($fmt, $($arg)*))
    };
}
