//! Block compaction.
//!
//! Live slots are repacked front to back in their existing order. Each slot's
//! payload comes from the vertex cache, then from geometry rescued during a
//! deferred growth, then from the block's own GPU storage at the old offset.
//! Tombstones and slack behind shrunken slots are dropped by omission.
//!
//! Live ranges may still be read by frames in flight, so the repacked layout
//! goes into a fresh buffer pair and the old pair is retired through the
//! backend, the same way growth orphans storage.

use linepool_core::Vertex;
use linepool_gpu::LineBackend;
use tracing::debug;

use crate::block::{allocate_storage, relative_indices, write_ranges, ColorBlock, PrimitiveSlot};
use crate::error::{ArenaError, Result};
use crate::location::LocationMap;
use crate::vertex_cache::VertexCache;

/// Outcome of compacting one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Slots that survived.
    pub live_slots: usize,
    /// Tombstones dropped.
    pub dropped_slots: usize,
    pub used_before: usize,
    pub used_after: usize,
    /// Payloads that had to be read back from the GPU.
    pub read_back: usize,
}

impl CompactionReport {
    /// Vertices of space given back.
    pub fn reclaimed(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }
}

/// A block's live contents laid out contiguously from offset zero.
pub(crate) struct Staging {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    slots: Vec<PrimitiveSlot>,
    report: CompactionReport,
}

impl Staging {
    /// Write the staged geometry to the front of a buffer pair.
    pub(crate) fn upload<B: LineBackend>(
        &self,
        backend: &B,
        vertex_buffer: &B::Buffer,
        index_buffer: &B::Buffer,
    ) -> linepool_gpu::Result<()> {
        write_ranges(
            backend,
            vertex_buffer,
            index_buffer,
            0,
            &self.vertices,
            &self.indices,
        )
    }
}

/// Gather every live slot's payload into a dense staging layout.
pub(crate) fn stage_live_slots<B: LineBackend>(
    backend: &B,
    block: &ColorBlock<B>,
    cache: &VertexCache,
) -> Result<Staging> {
    let live = block.live_vertices();
    let mut staging = Staging {
        vertices: Vec::with_capacity(live),
        indices: Vec::with_capacity(live),
        slots: Vec::with_capacity(block.live_primitives()),
        report: CompactionReport {
            used_before: block.used_vertices,
            ..CompactionReport::default()
        },
    };

    for slot in &block.slots {
        if !slot.valid {
            staging.report.dropped_slots += 1;
            continue;
        }

        let base = staging.vertices.len();
        if let Some(cached) = cache.get(slot.id) {
            staging.vertices.extend_from_slice(cached);
        } else if let Some(rescued) = block.rescued.get(&slot.id) {
            staging.vertices.extend_from_slice(rescued);
        } else if block.needs_rebuild {
            return Err(ArenaError::GeometryLost { id: slot.id });
        } else {
            staging.vertices.extend(block.read_slot(backend, slot)?);
            staging.report.read_back += 1;
        }

        let count = staging.vertices.len() - base;
        debug_assert_eq!(count, slot.count as usize, "payload length drifted for {}", slot.id);
        staging.indices.extend(relative_indices(count));

        let mut moved = *slot;
        moved.base_vertex = base as u32;
        moved.count = count as u32;
        moved.span = count as u32;
        staging.slots.push(moved);
    }

    staging.report.live_slots = staging.slots.len();
    staging.report.used_after = staging.vertices.len();
    Ok(staging)
}

/// Adopt a staged layout whose geometry is already in the block's buffers.
pub(crate) fn commit<B: LineBackend>(
    block: &mut ColorBlock<B>,
    locations: &mut LocationMap,
    staging: Staging,
) -> CompactionReport {
    block.id_to_slot.clear();
    for (index, slot) in staging.slots.iter().enumerate() {
        block.id_to_slot.insert(slot.id, index);
        locations.set_slot(slot.handle, index);
    }

    block.slots = staging.slots;
    block.used_vertices = staging.report.used_after;
    block.used_indices = staging.report.used_after;
    block.rescued.clear();
    block.needs_compaction = false;
    block.needs_rebuild = false;
    block.draw_stale = true;
    block.compactions += 1;
    staging.report
}

/// Repack `block` into new storage.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub(crate) fn compact_block<B: LineBackend>(
    backend: &B,
    block: &mut ColorBlock<B>,
    locations: &mut LocationMap,
    cache: &VertexCache,
) -> Result<CompactionReport> {
    let staging = stage_live_slots(backend, block, cache)?;
    if block.needs_rebuild {
        // Orphaned by a deferred growth; nothing has drawn from it yet.
        staging.upload(backend, &block.vertex_buffer, &block.index_buffer)?;
    } else {
        let (vertex_buffer, index_buffer) =
            allocate_storage(backend, block.key, block.vertex_capacity, block.index_capacity)?;
        if let Err(e) = staging.upload(backend, &vertex_buffer, &index_buffer) {
            backend.destroy_buffer(vertex_buffer);
            backend.destroy_buffer(index_buffer);
            return Err(e.into());
        }
        block.replace_storage(backend, vertex_buffer, index_buffer);
    }
    let report = commit(block, locations, staging);

    debug!(
        block = ?block.key,
        live = report.live_slots,
        dropped = report.dropped_slots,
        reclaimed = report.reclaimed(),
        read_back = report.read_back,
        "Block compacted"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKey;
    use crate::location::Location;
    use linepool_core::{Color, PrimitiveId};
    use linepool_gpu::HeadlessBackend;

    const KEY: BlockKey = BlockKey {
        color_key: 1,
        index: 0,
        generation: 0,
    };

    struct Fixture {
        backend: HeadlessBackend,
        block: ColorBlock<HeadlessBackend>,
        locations: LocationMap,
        cache: VertexCache,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = HeadlessBackend::new();
            let block = ColorBlock::create(&backend, KEY, Color::GREEN, 64).unwrap();
            Self {
                backend,
                block,
                locations: LocationMap::new(),
                cache: VertexCache::new(),
            }
        }

        fn add(&mut self, id: u64, n: usize) {
            let verts: Vec<Vertex> = (0..n).map(|i| Vertex::new(id as f32, i as f32, 1.0)).collect();
            let indices: Vec<u32> = relative_indices(n).collect();
            let base = self.block.used_vertices;
            self.block
                .write_geometry(&self.backend, base, &verts, &indices)
                .unwrap();
            let handle = self
                .locations
                .insert(
                    PrimitiveId(id),
                    Location {
                        block: KEY,
                        slot: self.block.slots.len(),
                    },
                )
                .unwrap();
            self.block
                .push_slot(PrimitiveSlot::new(PrimitiveId(id), handle, base as u32, n as u32));
            self.cache.insert(PrimitiveId(id), verts);
        }

        fn remove(&mut self, id: u64) {
            let loc = self.locations.remove(PrimitiveId(id)).unwrap();
            self.block.tombstone(loc.slot);
            self.cache.remove(PrimitiveId(id));
        }

        fn compact(&mut self) -> CompactionReport {
            compact_block(&self.backend, &mut self.block, &mut self.locations, &self.cache).unwrap()
        }
    }

    #[test]
    fn repacks_survivors_in_order() {
        let mut f = Fixture::new();
        f.add(1, 2);
        f.add(2, 3);
        f.add(3, 4);
        f.remove(2);

        let report = f.compact();

        assert_eq!(report.live_slots, 2);
        assert_eq!(report.dropped_slots, 1);
        assert_eq!(report.reclaimed(), 3);
        let bases: Vec<u32> = f.block.slots.iter().map(|s| s.base_vertex).collect();
        assert_eq!(bases, vec![0, 2]);
        assert_eq!(f.block.used_vertices, 6);
        assert_eq!(f.locations.get(PrimitiveId(3)).unwrap().slot, 1);
        assert!(!f.block.needs_compaction);
    }

    #[test]
    fn falls_back_to_gpu_readback() {
        let mut f = Fixture::new();
        f.add(1, 3);
        f.add(2, 2);
        f.add(3, 2);
        f.remove(1);
        let expected = f.cache.remove(PrimitiveId(3)).unwrap();

        let report = f.compact();

        assert_eq!(report.read_back, 1);
        let slot = f.block.slots[1];
        assert_eq!(slot.base_vertex, 2);
        assert_eq!(f.block.read_slot(&f.backend, &slot).unwrap(), expected);
    }

    #[test]
    fn orphaned_block_without_cache_loses_geometry() {
        let mut f = Fixture::new();
        f.add(1, 2);
        f.cache.remove(PrimitiveId(1));
        f.block.needs_rebuild = true;

        let err = compact_block(&f.backend, &mut f.block, &mut f.locations, &f.cache).unwrap_err();
        assert!(matches!(err, ArenaError::GeometryLost { id } if id == PrimitiveId(1)));
        assert_eq!(f.block.slots.len(), 1);
    }

    #[test]
    fn dense_block_layout_is_stable() {
        let mut f = Fixture::new();
        f.add(1, 2);
        f.add(2, 5);
        let before = f.block.slots.clone();

        let report = f.compact();

        assert_eq!(report.reclaimed(), 0);
        assert_eq!(f.block.slots, before);
    }

    #[test]
    fn compaction_retires_the_drawn_storage() {
        let mut f = Fixture::new();
        f.add(1, 2);
        f.add(2, 3);
        f.remove(1);
        let old = (f.block.vertex_buffer.id(), f.block.index_buffer.id());
        let frees = f.backend.stats().frees;

        f.compact();

        assert_ne!(f.block.vertex_buffer.id(), old.0);
        assert_ne!(f.block.index_buffer.id(), old.1);
        assert_eq!(f.backend.stats().frees, frees + 2);
        assert_eq!(f.backend.stats().live_buffers, 2);
        assert_eq!(f.block.vertex_capacity, 64);
    }

    #[test]
    fn failed_compaction_keeps_the_old_layout() {
        let mut f = Fixture::new();
        f.add(1, 2);
        f.add(2, 3);
        f.remove(1);
        let slots = f.block.slots.clone();
        let vertex_buffer = f.block.vertex_buffer.id();

        f.backend.fail_next_allocation();
        let err = compact_block(&f.backend, &mut f.block, &mut f.locations, &f.cache).unwrap_err();

        assert!(matches!(err, ArenaError::Gpu(_)));
        assert_eq!(f.block.slots, slots);
        assert_eq!(f.block.vertex_buffer.id(), vertex_buffer);
        assert!(f.block.needs_compaction);
        assert_eq!(f.backend.stats().live_buffers, 2);
    }
}
