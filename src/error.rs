//! Error types for the anonymous memory subsystem

use thiserror::Error;

// POSIX errno values reported to the system call layer
pub const EBADF: i32 = 9; // Bad file number
pub const ENOMEM: i32 = 12; // Out of memory
pub const EFAULT: i32 = 14; // Bad address
pub const EINVAL: i32 = 22; // Invalid argument

/// Failure of a descriptor, mapping or fault operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Physical page allocation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Bad length, offset or range
    #[error("invalid argument")]
    InvalidArgument,

    /// Operation not supported by this file type
    #[error("operation not supported on anonymous file")]
    Unsupported,

    /// Access to an unmapped address or forbidden by protection
    #[error("bad address {0:#x}")]
    BadAddress(u64),

    /// Unknown anonymous descriptor
    #[error("bad descriptor {0}")]
    BadDescriptor(i32),
}

impl VmError {
    /// Convert to the POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            VmError::OutOfMemory => ENOMEM,
            VmError::InvalidArgument => EINVAL,
            VmError::Unsupported => EBADF,
            VmError::BadAddress(_) => EFAULT,
            VmError::BadDescriptor(_) => EBADF,
        }
    }
}

/// Result alias used throughout the crate
pub type VmResult<T> = Result<T, VmError>;
