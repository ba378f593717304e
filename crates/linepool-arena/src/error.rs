//! Arena error types.
//!
//! Rejected input (too few vertices, duplicate or unknown ids) is not an
//! error; those operations return `Ok(false)`. Everything here means the
//! device failed or an invariant would otherwise have been broken.

use linepool_core::PrimitiveId;
use linepool_gpu::GpuError;
use thiserror::Error;

use crate::block::BlockKey;

/// Arena errors.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// The GPU backend failed (allocation, upload, readback).
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// A live primitive had neither a CPU copy nor readable GPU storage.
    #[error("Geometry for primitive {id} lost: no cached copy and its block storage was orphaned")]
    GeometryLost { id: PrimitiveId },

    /// A block key outlived its block (the registry was cleared).
    #[error("Block {0:?} no longer exists")]
    StaleBlock(BlockKey),

    /// Configuration was rejected.
    #[error("Config error: {0}")]
    Config(#[from] linepool_core::Error),

    /// `start_background_defrag` called twice.
    #[error("Background defrag worker is already running")]
    WorkerAlreadyRunning,

    /// The OS refused to start the worker thread.
    #[error("Failed to spawn defrag worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The worker thread panicked.
    #[error("Background defrag worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, ArenaError>;
