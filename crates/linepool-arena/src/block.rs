//! Color blocks: one vertex/index buffer pair per render color.

use hashbrown::HashMap;
use linepool_core::{Color, PrimitiveId, Vertex};
use linepool_gpu::{BufferKind, LineBackend};
use tracing::trace;

use crate::draw::DrawList;
use crate::location::LocationHandle;

/// Identifies a block inside the registry.
///
/// `generation` is the registry epoch the block was created in; keys from
/// before a `clear_all` no longer resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub color_key: u32,
    pub index: u32,
    pub generation: u32,
}

/// One primitive's placement inside a block.
///
/// `span` is the reserved length; in-place updates may shrink `count`
/// below it, and only compaction gives the slack back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimitiveSlot {
    pub id: PrimitiveId,
    pub handle: LocationHandle,
    pub base_vertex: u32,
    pub count: u32,
    pub span: u32,
    pub valid: bool,
    pub visible: bool,
}

impl PrimitiveSlot {
    pub const fn new(id: PrimitiveId, handle: LocationHandle, base_vertex: u32, count: u32) -> Self {
        Self {
            id,
            handle,
            base_vertex,
            count,
            span: count,
            valid: true,
            visible: true,
        }
    }

    /// Reserved vertex range `[base, base + span)`.
    pub const fn range(&self) -> std::ops::Range<u32> {
        self.base_vertex..self.base_vertex + self.span
    }
}

/// GPU storage and bookkeeping for primitives sharing one color.
pub struct ColorBlock<B: LineBackend> {
    pub(crate) key: BlockKey,
    pub(crate) color: Color,
    pub(crate) vertex_buffer: B::Buffer,
    pub(crate) index_buffer: B::Buffer,
    pub(crate) vertex_capacity: usize,
    pub(crate) index_capacity: usize,
    pub(crate) used_vertices: usize,
    pub(crate) used_indices: usize,
    pub(crate) slots: Vec<PrimitiveSlot>,
    pub(crate) id_to_slot: HashMap<PrimitiveId, usize>,
    pub(crate) draw_list: DrawList,
    /// Draw list no longer matches the slots.
    pub(crate) draw_stale: bool,
    /// Tombstones or shrunken slots left holes behind.
    pub(crate) needs_compaction: bool,
    /// Storage was orphaned and not yet refilled.
    pub(crate) needs_rebuild: bool,
    /// Geometry read back from orphaned storage for primitives the cache no
    /// longer held. Consumed by the next compaction.
    pub(crate) rescued: HashMap<PrimitiveId, Vec<Vertex>>,
    pub(crate) growths: usize,
    pub(crate) compactions: usize,
}

impl<B: LineBackend> ColorBlock<B> {
    /// Allocate a block with room for `capacity` vertices and indices.
    pub(crate) fn create(
        backend: &B,
        key: BlockKey,
        color: Color,
        capacity: usize,
    ) -> linepool_gpu::Result<Self> {
        let (vertex_buffer, index_buffer) = allocate_storage(backend, key, capacity, capacity)?;
        trace!(?key, capacity, "Color block created");

        Ok(Self {
            key,
            color,
            vertex_buffer,
            index_buffer,
            vertex_capacity: capacity,
            index_capacity: capacity,
            used_vertices: 0,
            used_indices: 0,
            slots: Vec::new(),
            id_to_slot: HashMap::new(),
            draw_list: DrawList::default(),
            draw_stale: false,
            needs_compaction: false,
            needs_rebuild: false,
            rescued: HashMap::new(),
            growths: 0,
            compactions: 0,
        })
    }

    /// Release the GPU storage.
    pub(crate) fn destroy(self, backend: &B) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }

    /// Swap in a new buffer pair and retire the old one through the backend.
    pub(crate) fn replace_storage(&mut self, backend: &B, vertex_buffer: B::Buffer, index_buffer: B::Buffer) {
        let old_vertices = std::mem::replace(&mut self.vertex_buffer, vertex_buffer);
        let old_indices = std::mem::replace(&mut self.index_buffer, index_buffer);
        backend.destroy_buffer(old_vertices);
        backend.destroy_buffer(old_indices);
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn slots(&self) -> &[PrimitiveSlot] {
        &self.slots
    }

    /// `used_vertices / vertex_capacity`.
    pub fn utilization(&self) -> f32 {
        if self.vertex_capacity == 0 {
            return 1.0;
        }
        self.used_vertices as f32 / self.vertex_capacity as f32
    }

    /// Vertices actually drawn or drawable (excludes holes and slack).
    pub fn live_vertices(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.valid)
            .map(|s| s.count as usize)
            .sum()
    }

    pub fn live_primitives(&self) -> usize {
        self.id_to_slot.len()
    }

    /// Whether `needed` more vertices fit under the per-block cap with slack to spare.
    pub fn has_room_for(&self, needed: usize, max_vertices: usize, slack: usize) -> bool {
        self.used_vertices + needed + slack < max_vertices
    }

    /// Should the lazy policy compact this block?
    pub fn wants_compaction(&self, threshold: f32) -> bool {
        self.needs_rebuild || (self.needs_compaction && self.utilization() < threshold)
    }

    /// Upload vertices and their relative indices starting at `base`.
    pub(crate) fn write_geometry(
        &self,
        backend: &B,
        base: usize,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> linepool_gpu::Result<()> {
        write_ranges(
            backend,
            &self.vertex_buffer,
            &self.index_buffer,
            base,
            vertices,
            indices,
        )
    }

    /// Read a slot's current vertices back from GPU storage.
    pub(crate) fn read_slot(
        &self,
        backend: &B,
        slot: &PrimitiveSlot,
    ) -> linepool_gpu::Result<Vec<Vertex>> {
        let bytes = backend.read_buffer(
            &self.vertex_buffer,
            u64::from(slot.base_vertex) * Vertex::SIZE as u64,
            u64::from(slot.count) * Vertex::SIZE as u64,
        )?;
        Ok(bytes
            .chunks_exact(Vertex::SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Append a slot record. The caller has already uploaded its geometry.
    pub(crate) fn push_slot(&mut self, slot: PrimitiveSlot) -> usize {
        let index = self.slots.len();
        let end = slot.range().end as usize;
        self.id_to_slot.insert(slot.id, index);
        self.used_vertices = self.used_vertices.max(end);
        self.used_indices = self.used_indices.max(end);
        self.slots.push(slot);
        self.draw_stale = true;
        index
    }

    /// Mark a slot dead. Its range stays allocated until compaction.
    pub(crate) fn tombstone(&mut self, index: usize) -> Option<PrimitiveId> {
        let slot = self.slots.get_mut(index)?;
        if !slot.valid {
            return None;
        }
        slot.valid = false;
        slot.visible = false;
        slot.count = 0;
        let id = slot.id;
        self.id_to_slot.remove(&id);
        self.rescued.remove(&id);
        self.needs_compaction = true;
        self.draw_stale = true;
        Some(id)
    }

    /// Rebuild the draw list if any slot changed since the last build.
    pub(crate) fn refresh_draw_list(&mut self) {
        if self.draw_stale {
            self.draw_list.rebuild(&self.slots);
            self.draw_stale = false;
        }
    }
}

/// Allocate a vertex/index buffer pair, releasing the first if the second fails.
pub(crate) fn allocate_storage<B: LineBackend>(
    backend: &B,
    key: BlockKey,
    vertex_capacity: usize,
    index_capacity: usize,
) -> linepool_gpu::Result<(B::Buffer, B::Buffer)> {
    let label = format!("linepool-{:08x}-{}", key.color_key, key.index);
    let vertices = backend.create_buffer(
        BufferKind::Vertex,
        (vertex_capacity * BufferKind::Vertex.element_size()) as u64,
        &format!("{label}-vertices"),
    )?;
    match backend.create_buffer(
        BufferKind::Index,
        (index_capacity * BufferKind::Index.element_size()) as u64,
        &format!("{label}-indices"),
    ) {
        Ok(indices) => Ok((vertices, indices)),
        Err(e) => {
            backend.destroy_buffer(vertices);
            Err(e)
        }
    }
}

/// Write `vertices` and `indices` into a buffer pair starting at element `base`.
pub(crate) fn write_ranges<B: LineBackend>(
    backend: &B,
    vertex_buffer: &B::Buffer,
    index_buffer: &B::Buffer,
    base: usize,
    vertices: &[Vertex],
    indices: &[u32],
) -> linepool_gpu::Result<()> {
    if !vertices.is_empty() {
        backend.write_buffer(
            vertex_buffer,
            (base * Vertex::SIZE) as u64,
            bytemuck::cast_slice(vertices),
        )?;
    }
    if !indices.is_empty() {
        backend.write_buffer(
            index_buffer,
            (base * BufferKind::Index.element_size()) as u64,
            bytemuck::cast_slice(indices),
        )?;
    }
    Ok(())
}

/// `0..count` as `u32` indices.
pub(crate) fn relative_indices(count: usize) -> std::ops::Range<u32> {
    0..count as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{Location, LocationMap};
    use approx::assert_relative_eq;
    use linepool_gpu::HeadlessBackend;

    const KEY: BlockKey = BlockKey {
        color_key: 0xFF00_00FF,
        index: 0,
        generation: 0,
    };

    fn add(
        block: &mut ColorBlock<HeadlessBackend>,
        backend: &HeadlessBackend,
        map: &mut LocationMap,
        id: u64,
        n: usize,
    ) -> usize {
        let verts: Vec<Vertex> = (0..n).map(|i| Vertex::new(id as f32, i as f32, 0.0)).collect();
        let indices: Vec<u32> = relative_indices(n).collect();
        let base = block.used_vertices;
        block.write_geometry(backend, base, &verts, &indices).unwrap();
        let handle = map
            .insert(PrimitiveId(id), Location { block: KEY, slot: block.slots.len() })
            .unwrap();
        block.push_slot(PrimitiveSlot::new(PrimitiveId(id), handle, base as u32, n as u32))
    }

    #[test]
    fn appends_at_tail() {
        let backend = HeadlessBackend::new();
        let mut map = LocationMap::new();
        let mut block = ColorBlock::create(&backend, KEY, Color::RED, 32).unwrap();

        add(&mut block, &backend, &mut map, 1, 2);
        add(&mut block, &backend, &mut map, 2, 3);

        assert_eq!(block.used_vertices, 5);
        assert_eq!(block.slots[1].base_vertex, 2);
        assert_eq!(
            block.read_slot(&backend, &block.slots[1]).unwrap()[2],
            Vertex::new(2.0, 2.0, 0.0)
        );
    }

    #[test]
    fn tombstone_keeps_space_and_flags_block() {
        let backend = HeadlessBackend::new();
        let mut map = LocationMap::new();
        let mut block = ColorBlock::create(&backend, KEY, Color::RED, 32).unwrap();
        let idx = add(&mut block, &backend, &mut map, 1, 4);

        assert_eq!(block.tombstone(idx), Some(PrimitiveId(1)));
        assert_eq!(block.tombstone(idx), None);
        assert_eq!(block.used_vertices, 4);
        assert_eq!(block.live_vertices(), 0);
        assert!(block.needs_compaction);
        assert!(block.wants_compaction(0.7));
    }

    #[test]
    fn room_check_honours_slack() {
        let backend = HeadlessBackend::new();
        let mut map = LocationMap::new();
        let mut block = ColorBlock::create(&backend, KEY, Color::RED, 32).unwrap();
        add(&mut block, &backend, &mut map, 1, 10);

        assert!(block.has_room_for(5, 20, 4));
        assert!(!block.has_room_for(6, 20, 4));
    }

    #[test]
    fn utilization_counts_tombstoned_space() {
        let backend = HeadlessBackend::new();
        let mut map = LocationMap::new();
        let mut block = ColorBlock::create(&backend, KEY, Color::RED, 32).unwrap();
        let first = add(&mut block, &backend, &mut map, 1, 8);
        add(&mut block, &backend, &mut map, 2, 8);

        assert_relative_eq!(block.utilization(), 0.5);
        block.tombstone(first);
        assert_relative_eq!(block.utilization(), 0.5);
        assert_eq!(block.live_vertices(), 8);
    }

    #[test]
    fn failed_index_allocation_releases_vertex_buffer() {
        let backend = HeadlessBackend::new().with_memory_limit(32 * 12 + 8);
        assert!(ColorBlock::create(&backend, KEY, Color::RED, 32).is_err());
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
