//! Lock-protected arena state and the operations on it.
//!
//! Everything here runs with the manager's lock already held; the manager and
//! the background worker decide which lock mode each call needs.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use linepool_core::constants::MIN_POLYLINE_VERTICES;
use linepool_core::{ArenaConfig, Color, DrawMode, PrimitiveId, Vertex};
use linepool_gpu::LineBackend;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::batch::PolylineBatch;
use crate::block::{relative_indices, BlockKey, ColorBlock, PrimitiveSlot};
use crate::compactor::{self, CompactionReport};
use crate::error::{ArenaError, Result};
use crate::growth;
use crate::location::{Location, LocationMap};
use crate::registry::BlockRegistry;
use crate::stats::{ArenaStats, BlockLayout, RenderStats, SlotLayout};
use crate::vertex_cache::VertexCache;

/// State reachable from both the owner and the worker thread.
pub(crate) struct Shared<B: LineBackend> {
    pub(crate) backend: B,
    pub(crate) state: RwLock<ArenaState<B>>,
    /// Blocks sent to the owner and not drained yet.
    pub(crate) queued: Mutex<HashSet<BlockKey>>,
}

impl<B: LineBackend> Shared<B> {
    pub(crate) fn new(backend: B, config: ArenaConfig) -> Self {
        Self {
            backend,
            state: RwLock::new(ArenaState::new(config)),
            queued: Mutex::new(HashSet::new()),
        }
    }
}

type Item<'a> = (PrimitiveId, &'a [Vertex]);

/// Registry, location map and vertex cache, guarded together.
pub(crate) struct ArenaState<B: LineBackend> {
    config: ArenaConfig,
    registry: BlockRegistry<B>,
    locations: LocationMap,
    cache: VertexCache,
}

impl<B: LineBackend> ArenaState<B> {
    pub(crate) fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            registry: BlockRegistry::new(),
            locations: LocationMap::new(),
            cache: VertexCache::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        backend: &B,
        id: PrimitiveId,
        vertices: &[Vertex],
        color: Color,
    ) -> Result<bool> {
        if vertices.len() < MIN_POLYLINE_VERTICES {
            debug!(%id, vertices = vertices.len(), "Add rejected: too few vertices");
            return Ok(false);
        }
        if self.locations.contains(id) {
            debug!(%id, "Add rejected: id already present");
            return Ok(false);
        }

        self.insert(backend, color, &[(id, vertices)])?;
        trace!(%id, vertices = vertices.len(), ?color, "Polyline added");
        Ok(true)
    }

    /// Add many polylines, one growth and one upload per block run.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn add_batch(&mut self, backend: &B, batches: &[PolylineBatch<'_>]) -> Result<usize> {
        let mut groups: BTreeMap<u32, (Color, Vec<Item<'_>>)> = BTreeMap::new();
        let mut seen = HashSet::new();

        for batch in batches {
            let Some(items) = batch.items() else {
                warn!(
                    ids = batch.ids.len(),
                    counts = batch.counts.len(),
                    positions = batch.positions.len(),
                    "Batch group skipped: counts do not match vertex data"
                );
                continue;
            };

            let (_, group) = groups
                .entry(batch.color.key())
                .or_insert_with(|| (batch.color, Vec::new()));
            for (id, vertices) in items {
                if vertices.len() < MIN_POLYLINE_VERTICES {
                    debug!(%id, vertices = vertices.len(), "Batch item skipped: too few vertices");
                } else if self.locations.contains(id) || !seen.insert(id) {
                    debug!(%id, "Batch item skipped: duplicate id");
                } else {
                    group.push((id, vertices));
                }
            }
        }

        let mut added = 0;
        for (color, items) in groups.into_values() {
            self.insert(backend, color, &items)?;
            added += items.len();
        }
        if added > 0 {
            debug!(added, "Batch added");
        }
        Ok(added)
    }

    pub(crate) fn remove(&mut self, id: PrimitiveId) -> bool {
        let Some(location) = self.locations.remove(id) else {
            debug!(%id, "Remove rejected: unknown id");
            return false;
        };
        self.cache.remove(id);
        if let Some(block) = self.registry.get_mut(location.block) {
            block.tombstone(location.slot);
        }
        trace!(%id, block = ?location.block, "Polyline removed");
        true
    }

    pub(crate) fn remove_batch(&mut self, ids: &[PrimitiveId]) -> usize {
        ids.iter().filter(|&&id| self.remove(id)).count()
    }

    /// Replace a polyline's vertices.
    ///
    /// Fits within the reserved span: rewritten in place. Larger, or on a
    /// backend whose live ranges may still be read by frames in flight:
    /// moved to a fresh slot at the tail of a block with room.
    pub(crate) fn update(&mut self, backend: &B, id: PrimitiveId, vertices: &[Vertex]) -> Result<bool> {
        if vertices.len() < MIN_POLYLINE_VERTICES {
            debug!(%id, vertices = vertices.len(), "Update rejected: too few vertices");
            return Ok(false);
        }
        let Some(location) = self.locations.get(id) else {
            debug!(%id, "Update rejected: unknown id");
            return Ok(false);
        };
        self.rebuild_if_needed(backend, location.block)?;
        let Some(location) = self.locations.get(id) else {
            return Ok(false);
        };

        let block = self
            .registry
            .get_mut(location.block)
            .ok_or(ArenaError::StaleBlock(location.block))?;
        let Some(slot) = block.slots.get(location.slot).copied() else {
            return Ok(false);
        };

        let count = vertices.len();
        if count <= slot.span as usize && backend.in_place_writes() {
            block.write_geometry(backend, slot.base_vertex as usize, vertices, &[])?;
            block.slots[location.slot].count = count as u32;
            if count < slot.span as usize {
                block.needs_compaction = true;
            }
            block.rescued.remove(&id);
            block.draw_stale = true;
            self.cache.insert(id, vertices.to_vec());
            trace!(%id, vertices = count, "Polyline updated in place");
            return Ok(true);
        }

        let color = block.color;
        let key = self.block_for(backend, color, count)?;
        self.reserve(backend, key, count)?;
        self.remove(id);
        self.append(backend, key, &[(id, vertices)], count)?;
        if !slot.visible {
            self.set_visible(id, false);
        }
        trace!(%id, vertices = count, block = ?key, "Polyline relocated");
        Ok(true)
    }

    pub(crate) fn set_visible(&mut self, id: PrimitiveId, visible: bool) -> bool {
        let Some(location) = self.locations.get(id) else {
            debug!(%id, "Visibility change rejected: unknown id");
            return false;
        };
        let Some(block) = self.registry.get_mut(location.block) else {
            return false;
        };
        let Some(slot) = block.slots.get_mut(location.slot) else {
            return false;
        };
        if slot.visible != visible {
            slot.visible = visible;
            block.draw_stale = true;
        }
        true
    }

    pub(crate) fn is_visible(&self, id: PrimitiveId) -> Option<bool> {
        let location = self.locations.get(id)?;
        let block = self.registry.get(location.block)?;
        block.slots.get(location.slot).map(|slot| slot.visible)
    }

    pub(crate) fn contains(&self, id: PrimitiveId) -> bool {
        self.locations.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.locations.len()
    }

    /// Drop every polyline and block.
    pub(crate) fn clear(&mut self, backend: &B) {
        let primitives = self.locations.len();
        let blocks = self.registry.len();
        self.registry.clear(backend);
        self.locations.clear();
        self.cache.clear();
        info!(primitives, blocks, "Arena cleared");
    }

    pub(crate) fn vertices(&self, id: PrimitiveId) -> Option<Vec<Vertex>> {
        self.cache.get(id).map(<[Vertex]>::to_vec)
    }

    /// Evict the CPU copy of `id`; later repacks read it back from the GPU.
    pub(crate) fn release_cached(&mut self, backend: &B, id: PrimitiveId) -> Result<bool> {
        let Some(location) = self.locations.get(id) else {
            return Ok(false);
        };
        self.rebuild_if_needed(backend, location.block)?;
        Ok(self.cache.remove(id).is_some())
    }

    /// Current GPU contents of `id`.
    pub(crate) fn read_back(&mut self, backend: &B, id: PrimitiveId) -> Result<Option<Vec<Vertex>>> {
        let Some(location) = self.locations.get(id) else {
            return Ok(None);
        };
        self.rebuild_if_needed(backend, location.block)?;
        let Some(location) = self.locations.get(id) else {
            return Ok(None);
        };
        let block = self
            .registry
            .get(location.block)
            .ok_or(ArenaError::StaleBlock(location.block))?;
        match block.slots.get(location.slot) {
            Some(slot) => Ok(Some(block.read_slot(backend, slot)?)),
            None => Ok(None),
        }
    }

    /// Unconditionally repack `key`.
    pub(crate) fn compact(&mut self, backend: &B, key: BlockKey) -> Result<CompactionReport> {
        let Self {
            registry,
            locations,
            cache,
            ..
        } = self;
        let block = registry.get_mut(key).ok_or(ArenaError::StaleBlock(key))?;
        compactor::compact_block(backend, block, locations, cache)
    }

    /// Repack `key` if the lazy policy still wants it. Stale keys are ignored.
    pub(crate) fn compact_if_wanted(&mut self, backend: &B, key: BlockKey) -> Result<bool> {
        let Some(block) = self.registry.get(key) else {
            debug!(block = ?key, "Compaction request for a cleared block dropped");
            return Ok(false);
        };
        if !block.wants_compaction(self.config.compaction_threshold) {
            return Ok(false);
        }
        self.compact(backend, key)?;
        Ok(true)
    }

    /// Blocks the lazy policy would compact.
    pub(crate) fn compaction_candidates(&self) -> Vec<BlockKey> {
        let threshold = self.config.compaction_threshold;
        self.registry
            .blocks()
            .filter(|block| block.wants_compaction(threshold))
            .map(ColorBlock::key)
            .collect()
    }

    /// Repack every block with holes or orphaned storage, regardless of utilization.
    pub(crate) fn defragment(&mut self, backend: &B) -> Result<usize> {
        let dirty: Vec<BlockKey> = self
            .registry
            .blocks()
            .filter(|block| block.needs_compaction || block.needs_rebuild)
            .map(ColorBlock::key)
            .collect();
        for &key in &dirty {
            self.compact(backend, key)?;
        }
        if !dirty.is_empty() {
            debug!(blocks = dirty.len(), "Defragmented");
        }
        Ok(dirty.len())
    }

    /// Anything `prepare_render` would have to change.
    pub(crate) fn needs_render_prep(&self) -> bool {
        self.registry
            .blocks()
            .any(|block| block.needs_rebuild || block.draw_stale)
    }

    /// Refill orphaned blocks and rebuild stale draw lists.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn prepare_render(&mut self, backend: &B) -> Result<usize> {
        let orphaned: Vec<BlockKey> = self
            .registry
            .blocks()
            .filter(|block| block.needs_rebuild)
            .map(ColorBlock::key)
            .collect();
        for &key in &orphaned {
            self.compact(backend, key)?;
        }
        for block in self.registry.blocks_mut() {
            block.refresh_draw_list();
        }
        Ok(orphaned.len())
    }

    /// Submit every visible polyline. Draw lists must be current.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn draw(&self, backend: &B, pass: &mut B::Pass) -> RenderStats {
        let mut stats = RenderStats::default();

        for group in self.registry.groups() {
            let mut color_set = false;
            for block in group {
                debug_assert!(!block.draw_stale && !block.needs_rebuild);
                let commands = block.draw_list.commands();
                if commands.is_empty() {
                    continue;
                }
                if !color_set {
                    backend.set_line_color(pass, block.color);
                    stats.color_groups += 1;
                    color_set = true;
                }

                backend.bind_geometry(pass, &block.vertex_buffer, &block.index_buffer);
                match self.config.draw_mode {
                    DrawMode::MultiDraw => {
                        backend.multi_draw_indexed(pass, commands);
                        stats.draw_calls += 1;
                    }
                    DrawMode::PerPrimitive => {
                        for &command in commands {
                            backend.draw_indexed(pass, command);
                        }
                        stats.draw_calls += commands.len();
                    }
                }

                stats.blocks += 1;
                stats.primitives += commands.len();
                stats.vertices += commands.iter().map(|c| c.index_count as usize).sum::<usize>();
            }
        }

        stats
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            blocks: self.registry.len(),
            primitives: self.locations.len(),
            cached_primitives: self.cache.len(),
            cached_vertices: self.cache.total_vertices(),
            ..ArenaStats::default()
        };
        for block in self.registry.blocks() {
            stats.used_vertices += block.used_vertices;
            stats.live_vertices += block.live_vertices();
            stats.capacity_vertices += block.vertex_capacity;
            stats.fragmented_blocks += usize::from(block.needs_compaction);
            stats.blocks_pending_rebuild += usize::from(block.needs_rebuild);
            stats.growths += block.growths;
            stats.compactions += block.compactions;
        }
        stats
    }

    pub(crate) fn layouts(&self) -> Vec<BlockLayout> {
        self.registry
            .blocks()
            .map(|block| BlockLayout {
                key: block.key,
                color: block.color,
                vertex_capacity: block.vertex_capacity,
                index_capacity: block.index_capacity,
                used_vertices: block.used_vertices,
                used_indices: block.used_indices,
                slots: block
                    .slots
                    .iter()
                    .filter(|slot| slot.valid)
                    .map(|slot| SlotLayout {
                        id: slot.id,
                        base_vertex: slot.base_vertex,
                        count: slot.count,
                        span: slot.span,
                        visible: slot.visible,
                    })
                    .collect(),
                tombstones: block.slots.iter().filter(|slot| !slot.valid).count(),
                needs_compaction: block.needs_compaction,
                needs_rebuild: block.needs_rebuild,
            })
            .collect()
    }

    fn rebuild_if_needed(&mut self, backend: &B, key: BlockKey) -> Result<()> {
        if self.registry.get(key).is_some_and(|block| block.needs_rebuild) {
            self.compact(backend, key)?;
        }
        Ok(())
    }

    /// A block of `color` with room for `needed` more vertices, ready for writing.
    fn block_for(&mut self, backend: &B, color: Color, needed: usize) -> Result<BlockKey> {
        let max = self.config.max_vertices_per_block;
        let slack = self.config.slack_margin;
        if let Some(key) = self.registry.find_with_room(color, needed, max, slack) {
            self.rebuild_if_needed(backend, key)?;
            return Ok(key);
        }
        let capacity = self.config.initial_capacity.max(needed);
        Ok(self.registry.create(backend, color, capacity)?)
    }

    /// Grow `key` so `extra` more vertices fit at its tail.
    fn reserve(&mut self, backend: &B, key: BlockKey, extra: usize) -> Result<()> {
        let Self {
            config,
            registry,
            locations,
            cache,
        } = self;
        let block = registry.get_mut(key).ok_or(ArenaError::StaleBlock(key))?;
        let needed = block.used_vertices + extra;
        growth::ensure_capacity(backend, block, locations, cache, config, needed)?;
        Ok(())
    }

    /// Place `items` of one color, split into runs that each fit one block.
    fn insert(&mut self, backend: &B, color: Color, items: &[Item<'_>]) -> Result<()> {
        let max = self.config.max_vertices_per_block;
        let slack = self.config.slack_margin;

        let mut rest = items;
        while let Some(&(_, first)) = rest.first() {
            let key = self.block_for(backend, color, first.len())?;
            let block = self.registry.get(key).ok_or(ArenaError::StaleBlock(key))?;

            let mut total = first.len();
            let mut take = 1;
            for &(_, vertices) in &rest[1..] {
                if !block.has_room_for(total + vertices.len(), max, slack) {
                    break;
                }
                total += vertices.len();
                take += 1;
            }

            self.append(backend, key, &rest[..take], total)?;
            rest = &rest[take..];
        }
        Ok(())
    }

    /// Upload `items` back to back at the tail of `key` and record their slots.
    fn append(&mut self, backend: &B, key: BlockKey, items: &[Item<'_>], total: usize) -> Result<()> {
        self.reserve(backend, key, total)?;

        let Self {
            registry,
            locations,
            cache,
            ..
        } = self;
        let block = registry.get_mut(key).ok_or(ArenaError::StaleBlock(key))?;
        let base = block.used_vertices;

        let mut vertices = Vec::with_capacity(total);
        let mut indices = Vec::with_capacity(total);
        for &(_, item) in items {
            vertices.extend_from_slice(item);
            indices.extend(relative_indices(item.len()));
        }
        block.write_geometry(backend, base, &vertices, &indices)?;

        let mut offset = base;
        for &(id, item) in items {
            let count = item.len();
            let location = Location {
                block: key,
                slot: block.slots.len(),
            };
            if let Some(handle) = locations.insert(id, location) {
                block.push_slot(PrimitiveSlot::new(id, handle, offset as u32, count as u32));
                cache.insert(id, item.to_vec());
            } else {
                warn!(%id, "Id already placed; its uploaded range is left as a hole");
                block.needs_compaction = true;
            }
            offset += count;
        }
        block.used_vertices = block.used_vertices.max(offset);
        block.used_indices = block.used_indices.max(offset);
        block.draw_stale = true;

        trace!(block = ?key, primitives = items.len(), vertices = total, base, "Run uploaded");
        Ok(())
    }
}
