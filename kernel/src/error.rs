//! Kernel error types.
//!
//! One error enum covers the failure classes the kernel can hit: memory
//! exhaustion, bad arguments, privilege mismatches, missing resources, full
//! fixed-capacity tables, device failures, and detected corruption. System
//! calls collapse any of these to `-1` at the user boundary; kernel-internal
//! paths propagate them with `?`.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Frame allocator or intermediate-table allocation failed.
    OutOfMemory,
    /// Null pointer, bad flags, fd out of range, unknown syscall.
    InvalidArgument,
    /// Ring-3 caller without a user thread context, or the reverse.
    PermissionDenied,
    /// No matching child, no such path, no such open file.
    NotFound,
    /// A fixed-capacity table (threads, spaces, fds) is full.
    ResourceExhausted {
        resource: &'static str,
    },
    /// Mapping a page that already has a present leaf entry.
    AlreadyMapped,
    /// Device reported failure or is in an unusable state.
    HardwareError {
        device: &'static str,
    },
    /// Kernel-stack canary mismatch or an impossible page-table shape.
    Corruption {
        what: &'static str,
    },
    /// Subsystem used before its `init()` ran.
    NotInitialized {
        subsystem: &'static str,
    },
    /// Operation delegated to a collaborator that is not present.
    NotSupported,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::PermissionDenied => write!(f, "permission denied"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {resource}")
            }
            KernelError::AlreadyMapped => write!(f, "virtual address already mapped"),
            KernelError::HardwareError { device } => write!(f, "hardware error: {device}"),
            KernelError::Corruption { what } => write!(f, "corruption detected: {what}"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{subsystem} not initialized")
            }
            KernelError::NotSupported => write!(f, "operation not supported"),
        }
    }
}

/// Result type used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;
