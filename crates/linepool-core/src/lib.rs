//! Core types and configuration for the linepool polyline arena.
//!
//! This crate provides the foundational types shared by the GPU and arena crates:
//! - Primitive identifiers and the wrapping id generator
//! - Render colors and the vertex layout uploaded to the GPU
//! - Arena configuration and its TOML loader
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::{ArenaConfig, DefragDispatch, DrawMode, GrowthRebuild};
pub use error::{Error, Result};
pub use types::{Color, IdGenerator, PrimitiveId, Vertex};

/// Arena-wide constants.
pub mod constants {
    /// Minimum number of vertices a polyline must have.
    pub const MIN_POLYLINE_VERTICES: usize = 2;
    /// Components per vertex position (x, y, z).
    pub const POSITION_COMPONENTS: usize = 3;
    /// Initial vertex/index capacity of a freshly created block.
    pub const INITIAL_CAPACITY: usize = 16 * 1024;
    /// Minimum amount a block grows by when it runs out of room.
    pub const GROW_STEP: usize = 16 * 1024;
    /// Soft cap on vertices per block before a sibling block is opened.
    pub const MAX_VERTICES_PER_BLOCK: usize = 4 * 1024 * 1024;
    /// Headroom kept free when choosing an existing block for new geometry.
    pub const SLACK_MARGIN: usize = 1000;
    /// Utilization below which a flagged block is worth compacting.
    pub const COMPACTION_THRESHOLD: f32 = 0.70;
}
