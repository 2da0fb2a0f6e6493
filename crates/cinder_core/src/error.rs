//! Error Types
//!
//! Failures in the runtime core fall into three classes:
//!
//! - **Programmer errors**: API protocol misuse (ending a frame twice,
//!   cancelling a frame after it acquired GPU resources, signalling a promise
//!   that was never issued, ...).
//! - **Backend errors**: object creation or submission failed inside the GPU
//!   backend (resource exhaustion, device loss).
//! - **Validation errors**: pre-flight contract checks (buffer bounds,
//!   push-constant size mismatch, descriptor-count overflow, ...).
//!
//! None of them are retried. Partially built GPU object graphs cannot be rolled
//! back mid-frame, so the public operations route every one of them through
//! [`fatal`], which logs the diagnostic and aborts the calling thread with a
//! panic. Helpers that only *check* return [`Result`] so that callers and tests
//! can inspect the failure before deciding.
//!
//! Invalid [`RuntimeSettings`](crate::RuntimeSettings) are the one recoverable
//! case: runtime construction returns them as an `Err`.

use thiserror::Error;

/// Errors reported by the GPU backend collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("device lost")]
    DeviceLost,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// The runtime error taxonomy.
#[derive(Error, Debug)]
pub enum CinderError {
    // ========================================================================
    // Protocol misuse
    // ========================================================================
    /// API protocol misuse by the caller.
    #[error("Programmer error: {0}")]
    Programmer(String),

    // ========================================================================
    // Contract checks
    // ========================================================================
    /// A pre-flight contract check failed.
    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // Backend failures
    // ========================================================================
    /// The backend failed to create or submit something.
    #[error("Backend error while {context}: {source}")]
    Backend {
        /// What the runtime was doing, including the cache key or sizes involved.
        context: String,
        #[source]
        source: BackendError,
    },

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Runtime settings are out of range.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Runtime settings could not be parsed.
    #[error("Settings parse error: {0}")]
    SettingsParse(#[from] serde_json::Error),
}

impl CinderError {
    pub fn programmer(msg: impl Into<String>) -> Self {
        Self::Programmer(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn backend(context: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }
}

/// Alias for `Result<T, CinderError>`.
pub type Result<T> = std::result::Result<T, CinderError>;

/// Logs `err` and aborts the calling thread.
///
/// This is the single exit for every fatal condition of the runtime core.
#[cold]
#[track_caller]
pub fn fatal(err: CinderError) -> ! {
    log::error!("{err}");
    panic!("{err}");
}

/// Routes a `Result` into [`fatal`] on error.
pub trait OrAbort<T> {
    #[track_caller]
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    #[inline]
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => fatal(e),
        }
    }
}

/// Attaches backend-failure context to a backend result.
pub trait BackendContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> BackendContext<T> for std::result::Result<T, BackendError> {
    #[inline]
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| CinderError::backend(context(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_carries_context() {
        let r: std::result::Result<(), BackendError> = Err(BackendError::OutOfDeviceMemory);
        let err = r
            .context(|| "creating descriptor pool bank_3 (maxSets 64)".to_string())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Backend error while creating descriptor pool bank_3 (maxSets 64): out of device memory"
        );
    }

    #[test]
    #[should_panic(expected = "Programmer error: frame already ended")]
    fn or_abort_panics_with_diagnostic() {
        let r: Result<()> = Err(CinderError::programmer("frame already ended"));
        r.or_abort();
    }
}
