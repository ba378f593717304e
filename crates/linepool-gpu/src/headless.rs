//! CPU-memory backend for tests and tooling.
//!
//! Buffers are byte vectors. Fresh storage is filled with [`POISON_BYTE`] so a
//! block whose contents were lost to orphaning renders as NaN positions and
//! out-of-range indices rather than silently looking correct. Draws are
//! resolved through the index buffer and base vertex into concrete vertex
//! lists, which is what the arena's tests assert against.

use hashbrown::HashMap;
use linepool_core::{Color, Vertex};
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::{BufferKind, DrawCommand, LineBackend};
use crate::error::{check_range, GpuError, Result};

/// Fill pattern for uninitialized storage.
pub const POISON_BYTE: u8 = 0xFF;

/// Handle to a headless buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct HeadlessBuffer {
    id: u64,
    size: u64,
    kind: BufferKind,
}

impl HeadlessBuffer {
    /// Backend-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Counters for backend activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub allocations: usize,
    pub frees: usize,
    pub writes: usize,
    pub reads: usize,
    pub bytes_written: u64,
    pub live_buffers: usize,
    pub live_bytes: u64,
}

#[derive(Default)]
struct State {
    buffers: HashMap<u64, Vec<u8>>,
    next_id: u64,
    memory_limit: Option<u64>,
    fail_next_allocation: bool,
    fail_next_write: bool,
    stats: HeadlessStats,
}

/// A draw as the GPU would have seen it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDraw {
    pub color: Option<Color>,
    pub command: DrawCommand,
    /// Positions fetched through the bound index buffer.
    pub vertices: Vec<Vertex>,
}

/// Recording target for [`HeadlessBackend`].
#[derive(Debug, Default)]
pub struct HeadlessPass {
    color: Option<Color>,
    bound: Option<(u64, u64)>,
    /// Every draw in submission order.
    pub draws: Vec<RecordedDraw>,
    /// Individual draw submissions.
    pub draw_calls: usize,
    /// Batched submissions.
    pub multi_draw_calls: usize,
    /// Color changes.
    pub color_changes: usize,
    /// Geometry binds.
    pub binds: usize,
}

impl HeadlessPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws recorded with `color`.
    pub fn draws_with_color(&self, color: Color) -> impl Iterator<Item = &RecordedDraw> {
        self.draws.iter().filter(move |d| d.color == Some(color))
    }
}

/// Backend that keeps all buffers in host memory.
pub struct HeadlessBackend {
    state: Mutex<State>,
    in_place_writes: bool,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            in_place_writes: true,
        }
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a device with frames in flight: live ranges must not be
    /// rewritten in place.
    pub fn without_in_place_writes(mut self) -> Self {
        self.in_place_writes = false;
        self
    }

    /// Cap the total bytes of live buffers; allocations beyond it fail.
    pub fn with_memory_limit(self, bytes: u64) -> Self {
        self.state.lock().memory_limit = Some(bytes);
        self
    }

    /// Change the memory cap at runtime.
    pub fn set_memory_limit(&self, bytes: Option<u64>) {
        self.state.lock().memory_limit = bytes;
    }

    /// Make the next allocation fail with [`GpuError::OutOfMemory`].
    pub fn fail_next_allocation(&self) {
        self.state.lock().fail_next_allocation = true;
    }

    /// Make the next buffer write fail with [`GpuError::InvalidState`].
    pub fn fail_next_write(&self) {
        self.state.lock().fail_next_write = true;
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    fn resolve(&self, pass: &HeadlessPass, command: DrawCommand) -> Vec<Vertex> {
        let poisoned = Vertex::new(f32::NAN, f32::NAN, f32::NAN);
        let state = self.state.lock();
        let Some((vertex_id, index_id)) = pass.bound else {
            return Vec::new();
        };
        let (Some(vertex_bytes), Some(index_bytes)) =
            (state.buffers.get(&vertex_id), state.buffers.get(&index_id))
        else {
            return Vec::new();
        };

        let index_count = index_bytes.len() / 4;
        let vertex_count = vertex_bytes.len() / Vertex::SIZE;

        (0..command.index_count as usize)
            .map(|i| {
                let slot = command.first_index as usize + i;
                if slot >= index_count {
                    return poisoned;
                }
                let index: u32 = bytemuck::pod_read_unaligned(&index_bytes[slot * 4..slot * 4 + 4]);
                let absolute = i64::from(index) + i64::from(command.base_vertex);
                if absolute < 0 || absolute as usize >= vertex_count {
                    return poisoned;
                }
                let start = absolute as usize * Vertex::SIZE;
                bytemuck::pod_read_unaligned(&vertex_bytes[start..start + Vertex::SIZE])
            })
            .collect()
    }
}

impl LineBackend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Pass = HeadlessPass;

    fn create_buffer(&self, kind: BufferKind, size: u64, label: &str) -> Result<HeadlessBuffer> {
        let mut state = self.state.lock();

        if std::mem::take(&mut state.fail_next_allocation) {
            return Err(GpuError::OutOfMemory {
                requested: size,
                available: 0,
            });
        }
        if let Some(limit) = state.memory_limit {
            let available = limit.saturating_sub(state.stats.live_bytes);
            if size > available {
                return Err(GpuError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.buffers.insert(id, vec![POISON_BYTE; size as usize]);
        state.stats.allocations += 1;
        state.stats.live_buffers += 1;
        state.stats.live_bytes += size;
        trace!(id, size, label, ?kind, "Headless buffer created");

        Ok(HeadlessBuffer { id, size, kind })
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.id).is_some() {
            state.stats.frees += 1;
            state.stats.live_buffers -= 1;
            state.stats.live_bytes -= buffer.size;
        }
    }

    fn buffer_size(&self, buffer: &HeadlessBuffer) -> u64 {
        buffer.size
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, buffer.size)?;
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_write) {
            return Err(GpuError::InvalidState("injected write failure".to_string()));
        }
        let storage = state
            .buffers
            .get_mut(&buffer.id)
            .ok_or(GpuError::UnknownBuffer(buffer.id))?;
        let start = offset as usize;
        storage[start..start + data.len()].copy_from_slice(data);
        state.stats.writes += 1;
        state.stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_range(offset, len, buffer.size)?;
        let mut state = self.state.lock();
        let storage = state
            .buffers
            .get(&buffer.id)
            .ok_or(GpuError::UnknownBuffer(buffer.id))?;
        let start = offset as usize;
        let out = storage[start..start + len as usize].to_vec();
        state.stats.reads += 1;
        Ok(out)
    }

    fn in_place_writes(&self) -> bool {
        self.in_place_writes
    }

    fn set_line_color(&self, pass: &mut HeadlessPass, color: Color) {
        pass.color = Some(color);
        pass.color_changes += 1;
    }

    fn bind_geometry(
        &self,
        pass: &mut HeadlessPass,
        vertices: &HeadlessBuffer,
        indices: &HeadlessBuffer,
    ) {
        debug_assert_eq!(vertices.kind, BufferKind::Vertex);
        debug_assert_eq!(indices.kind, BufferKind::Index);
        pass.bound = Some((vertices.id, indices.id));
        pass.binds += 1;
    }

    fn draw_indexed(&self, pass: &mut HeadlessPass, command: DrawCommand) {
        let vertices = self.resolve(pass, command);
        pass.draws.push(RecordedDraw {
            color: pass.color,
            command,
            vertices,
        });
        pass.draw_calls += 1;
    }

    fn multi_draw_indexed(&self, pass: &mut HeadlessPass, commands: &[DrawCommand]) {
        for &command in commands {
            let vertices = self.resolve(pass, command);
            pass.draws.push(RecordedDraw {
                color: pass.color,
                command,
                vertices,
            });
        }
        pass.multi_draw_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_buffers_are_poisoned() {
        let backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(BufferKind::Vertex, 8, "test").unwrap();
        assert_eq!(backend.read_buffer(&buffer, 0, 8).unwrap(), vec![POISON_BYTE; 8]);
    }

    #[test]
    fn write_then_read_range() {
        let backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(BufferKind::Index, 16, "test").unwrap();
        backend.write_buffer(&buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(&buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.stats().writes, 1);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(BufferKind::Index, 4, "test").unwrap();
        let err = backend.write_buffer(&buffer, 2, &[0; 4]).unwrap_err();
        assert!(matches!(err, GpuError::OutOfBounds { .. }));
    }

    #[test]
    fn memory_limit_and_injected_failure() {
        let backend = HeadlessBackend::new().with_memory_limit(64);
        let a = backend.create_buffer(BufferKind::Vertex, 48, "a").unwrap();
        assert!(matches!(
            backend.create_buffer(BufferKind::Vertex, 32, "b"),
            Err(GpuError::OutOfMemory { available: 16, .. })
        ));
        backend.destroy_buffer(a);
        backend.fail_next_allocation();
        assert!(backend.create_buffer(BufferKind::Vertex, 8, "c").is_err());
        assert!(backend.create_buffer(BufferKind::Vertex, 8, "d").is_ok());
        assert_eq!(backend.stats().live_buffers, 1);
    }

    #[test]
    fn draws_resolve_relative_indices_through_base_vertex() {
        let backend = HeadlessBackend::new();
        let vb = backend.create_buffer(BufferKind::Vertex, 4 * 12, "v").unwrap();
        let ib = backend.create_buffer(BufferKind::Index, 4 * 4, "i").unwrap();
        let verts = [
            Vertex::new(0.0, 0.0, 0.0),
            Vertex::new(1.0, 0.0, 0.0),
            Vertex::new(2.0, 0.0, 0.0),
            Vertex::new(3.0, 0.0, 0.0),
        ];
        backend.write_buffer(&vb, 0, bytemuck::cast_slice(&verts)).unwrap();
        backend
            .write_buffer(&ib, 0, bytemuck::cast_slice(&[0u32, 1, 0, 1]))
            .unwrap();

        let mut pass = HeadlessPass::new();
        backend.set_line_color(&mut pass, Color::RED);
        backend.bind_geometry(&mut pass, &vb, &ib);
        backend.multi_draw_indexed(
            &mut pass,
            &[
                DrawCommand { index_count: 2, first_index: 0, base_vertex: 0 },
                DrawCommand { index_count: 2, first_index: 2, base_vertex: 2 },
            ],
        );

        assert_eq!(pass.multi_draw_calls, 1);
        assert_eq!(pass.draws[1].vertices, verts[2..4].to_vec());
        assert_eq!(pass.draws_with_color(Color::RED).count(), 2);
    }

    #[test]
    fn injected_write_failure_is_one_shot() {
        let backend = HeadlessBackend::new();
        let buffer = backend.create_buffer(BufferKind::Vertex, 8, "w").unwrap();
        backend.fail_next_write();
        assert!(matches!(
            backend.write_buffer(&buffer, 0, &[1, 2]),
            Err(GpuError::InvalidState(_))
        ));
        backend.write_buffer(&buffer, 0, &[1, 2]).unwrap();
        assert_eq!(backend.stats().writes, 1);
    }
}
