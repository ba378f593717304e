//! Block capacity growth by buffer orphaning.
//!
//! A block that runs out of room gets a fresh, larger buffer pair. The old
//! pair is released without copying on the device, so everything that was
//! live in it has to be re-supplied from the vertex cache or read back
//! before the old storage goes away.

use hashbrown::HashMap;
use linepool_core::{ArenaConfig, GrowthRebuild, PrimitiveId, Vertex};
use linepool_gpu::LineBackend;
use tracing::debug;

use crate::block::{allocate_storage, ColorBlock};
use crate::compactor::{self, Staging};
use crate::error::{ArenaError, Result};
use crate::location::LocationMap;
use crate::vertex_cache::VertexCache;

/// Capacity after growing a block that must hold `needed` elements.
///
/// Doubles, or jumps to `needed + grow_step` when doubling is not enough.
/// The result stays within `max_per_block` unless `needed` alone exceeds it.
pub fn grown_capacity(current: usize, needed: usize, grow_step: usize, max_per_block: usize) -> usize {
    let target = current
        .saturating_mul(2)
        .max(needed.saturating_add(grow_step));
    target.min(max_per_block.max(needed))
}

/// Make sure `block` can hold `needed` vertices and indices.
///
/// Returns `Ok(true)` if the block was reallocated. On error the block still
/// owns its old storage and its bookkeeping is unchanged.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub(crate) fn ensure_capacity<B: LineBackend>(
    backend: &B,
    block: &mut ColorBlock<B>,
    locations: &mut LocationMap,
    cache: &VertexCache,
    config: &ArenaConfig,
    needed: usize,
) -> Result<bool> {
    if needed <= block.vertex_capacity && needed <= block.index_capacity {
        return Ok(false);
    }

    let vertex_capacity = if needed > block.vertex_capacity {
        grown_capacity(
            block.vertex_capacity,
            needed,
            config.grow_step,
            config.max_vertices_per_block,
        )
    } else {
        block.vertex_capacity
    };
    let index_capacity = if needed > block.index_capacity {
        grown_capacity(
            block.index_capacity,
            needed,
            config.grow_step,
            config.max_vertices_per_block,
        )
    } else {
        block.index_capacity
    };

    let (vertex_buffer, index_buffer) =
        allocate_storage(backend, block.key, vertex_capacity, index_capacity)?;

    let prepared = match config.growth_rebuild {
        GrowthRebuild::Immediate => compactor::stage_live_slots(backend, block, cache)
            .and_then(|staging| {
                staging.upload(backend, &vertex_buffer, &index_buffer)?;
                Ok(Prepared::Repacked(staging))
            }),
        GrowthRebuild::Deferred => rescue_uncached(backend, block, cache).map(Prepared::Rescued),
    };
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            backend.destroy_buffer(vertex_buffer);
            backend.destroy_buffer(index_buffer);
            return Err(e);
        }
    };

    block.replace_storage(backend, vertex_buffer, index_buffer);

    debug!(
        block = ?block.key,
        from = block.vertex_capacity,
        to = vertex_capacity,
        needed,
        mode = ?config.growth_rebuild,
        "Block grown"
    );

    block.vertex_capacity = vertex_capacity;
    block.index_capacity = index_capacity;
    block.growths += 1;
    block.draw_stale = true;

    match prepared {
        Prepared::Repacked(staging) => {
            compactor::commit(block, locations, staging);
        }
        Prepared::Rescued(rescued) => {
            block.rescued.extend(rescued);
            block.needs_rebuild = true;
        }
    }

    Ok(true)
}

enum Prepared {
    Repacked(Staging),
    Rescued(HashMap<PrimitiveId, Vec<Vertex>>),
}

/// Read back every live slot the cache no longer covers.
///
/// Storage that was already orphaned holds nothing worth reading, so a slot
/// missing from both the cache and the rescued set is lost.
fn rescue_uncached<B: LineBackend>(
    backend: &B,
    block: &ColorBlock<B>,
    cache: &VertexCache,
) -> Result<HashMap<PrimitiveId, Vec<Vertex>>> {
    let mut rescued = HashMap::new();
    for slot in block.slots.iter().filter(|s| s.valid) {
        if cache.contains(slot.id) || block.rescued.contains_key(&slot.id) {
            continue;
        }
        if block.needs_rebuild {
            return Err(ArenaError::GeometryLost { id: slot.id });
        }
        rescued.insert(slot.id, block.read_slot(backend, slot)?);
    }
    Ok(rescued)
}
