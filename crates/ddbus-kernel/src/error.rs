//! Kernel-specific error types.

use ddbus_types::DdError;
use thiserror::Error;

/// Kernel error type wrapping [`DdError`] with boot and config context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped DdError.
    #[error(transparent)]
    Dd(#[from] DdError),

    /// The connection failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
