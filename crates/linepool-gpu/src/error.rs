//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The device refused an allocation for lack of memory.
    #[error("Out of GPU memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// Access outside a buffer's allocation.
    #[error("Buffer access out of bounds: {offset}+{len} exceeds {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    /// Buffer handle not known to the backend.
    #[error("Unknown buffer: {0}")]
    UnknownBuffer(u64),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Check `offset + len <= size` without overflowing.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::OutOfBounds { offset, len, size }),
    }
}
