//! Color-batched GPU arena for mutable polylines.
//!
//! Polylines are grouped into one vertex/index buffer pair per render color.
//! Each polyline occupies a contiguous range in both buffers; its index range
//! always holds the relative sequence `0..count` and the absolute position is
//! supplied as the draw's base vertex, so repacking a block never changes what
//! any index means.
//!
//! - [`PolylineManager`] - public add/update/remove/visibility/render API
//! - Color blocks grow by buffer orphaning and are rebuilt from a CPU vertex
//!   cache, falling back to GPU readback
//! - Removal tombstones a slot; compaction reclaims the space later, either on
//!   request or from a background thread

pub mod batch;
pub mod block;
pub mod compactor;
pub mod draw;
pub mod error;
pub mod growth;
pub mod location;
pub mod manager;
pub mod registry;
pub mod stats;
pub mod vertex_cache;

mod state;
mod worker;

pub use batch::PolylineBatch;
pub use block::{BlockKey, PrimitiveSlot};
pub use compactor::CompactionReport;
pub use error::{ArenaError, Result};
pub use manager::PolylineManager;
pub use stats::{ArenaStats, BlockLayout, RenderStats, SlotLayout};

pub use linepool_core::{ArenaConfig, Color, DefragDispatch, DrawMode, GrowthRebuild, PrimitiveId, Vertex};
