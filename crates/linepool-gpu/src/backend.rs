//! The GPU seam used by the arena.
//!
//! The arena never touches a graphics API directly. Everything it needs from
//! the device is on [`LineBackend`]: allocate and release buffers, write and
//! read byte ranges, and record colored indexed line-strip draws into a pass
//! the caller has already set up (pipeline bound, color slot known).

use std::fmt;

use linepool_core::Color;

use crate::error::Result;

/// What a buffer is bound as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex positions.
    Vertex,
    /// `u32` line-strip indices.
    Index,
}

impl BufferKind {
    /// Bytes per element stored in a buffer of this kind.
    pub const fn element_size(self) -> usize {
        match self {
            Self::Vertex => linepool_core::Vertex::SIZE,
            Self::Index => std::mem::size_of::<u32>(),
        }
    }
}

/// One indexed draw of a line strip.
///
/// Indices in `[first_index, first_index + index_count)` are relative to the
/// primitive; `base_vertex` is added to each of them at draw time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DrawCommand {
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

/// Device operations the arena depends on.
///
/// Implementations must be usable from the background defrag worker, hence
/// `Send + Sync`. Buffer writes are always serialized by the arena's lock.
pub trait LineBackend: Send + Sync + 'static {
    /// Owned GPU buffer.
    type Buffer: Send + Sync + fmt::Debug;
    /// Recording target for draws (command buffer, render pass, ...).
    type Pass;

    /// Allocate uninitialized storage of `size` bytes.
    fn create_buffer(&self, kind: BufferKind, size: u64, label: &str) -> Result<Self::Buffer>;

    /// Release a buffer. Backends may defer the actual free.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// Allocated size in bytes.
    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    /// Upload `data` at byte `offset`.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Synchronously read `len` bytes starting at `offset`.
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Whether a range that earlier draws read may be overwritten right away.
    ///
    /// Backends whose storage can still be read by frames in flight return
    /// `false`; the arena then never rewrites a live range and moves the
    /// primitive to unused space instead.
    fn in_place_writes(&self) -> bool {
        true
    }

    /// Set the color used by subsequent draws.
    fn set_line_color(&self, pass: &mut Self::Pass, color: Color);

    /// Bind a block's vertex and index storage.
    fn bind_geometry(&self, pass: &mut Self::Pass, vertices: &Self::Buffer, indices: &Self::Buffer);

    /// Record one draw.
    fn draw_indexed(&self, pass: &mut Self::Pass, command: DrawCommand);

    /// Record a batch of draws against the bound geometry.
    fn multi_draw_indexed(&self, pass: &mut Self::Pass, commands: &[DrawCommand]) {
        for &command in commands {
            self.draw_indexed(pass, command);
        }
    }
}
