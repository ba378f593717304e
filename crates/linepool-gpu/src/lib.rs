//! GPU buffer backends for the linepool polyline arena.
//!
//! This crate provides:
//! - The [`LineBackend`] trait the arena talks to
//! - A Vulkan backend over gpu-allocator host-visible buffers
//! - Deferred release of orphaned buffers while frames are in flight
//! - A headless CPU backend for tests and tooling

pub mod backend;
pub mod deferred;
pub mod error;
pub mod headless;
pub mod memory;
pub mod vulkan;

pub use backend::{BufferKind, DrawCommand, LineBackend};
pub use deferred::DeferredDeletionQueue;
pub use error::{GpuError, Result};
pub use headless::{HeadlessBackend, HeadlessBuffer, HeadlessPass, HeadlessStats, RecordedDraw};
pub use memory::{GpuAllocator, GpuBuffer};
pub use vulkan::{VulkanBackend, VulkanPass};
