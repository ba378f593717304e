//! Snapshots for diagnostics and tests.

use linepool_core::{Color, PrimitiveId};

use crate::block::BlockKey;

/// Arena-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub blocks: usize,
    pub primitives: usize,
    /// Vertices spanned by slots, holes included.
    pub used_vertices: usize,
    /// Vertices of live primitives.
    pub live_vertices: usize,
    pub capacity_vertices: usize,
    pub cached_primitives: usize,
    pub cached_vertices: usize,
    /// Blocks with tombstones or slack waiting for compaction.
    pub fragmented_blocks: usize,
    /// Blocks whose storage was orphaned and not yet refilled.
    pub blocks_pending_rebuild: usize,
    pub growths: usize,
    pub compactions: usize,
}

impl ArenaStats {
    /// `used_vertices / capacity_vertices` over all blocks.
    pub fn utilization(&self) -> f32 {
        if self.capacity_vertices == 0 {
            return 0.0;
        }
        self.used_vertices as f32 / self.capacity_vertices as f32
    }
}

/// One live slot as laid out in GPU storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    pub id: PrimitiveId,
    pub base_vertex: u32,
    pub count: u32,
    /// Reserved length; at least `count`.
    pub span: u32,
    pub visible: bool,
}

/// Layout of one block.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockLayout {
    pub key: BlockKey,
    pub color: Color,
    pub vertex_capacity: usize,
    pub index_capacity: usize,
    pub used_vertices: usize,
    pub used_indices: usize,
    /// Live slots in slot order. Tombstones are counted, not listed.
    pub slots: Vec<SlotLayout>,
    pub tombstones: usize,
    pub needs_compaction: bool,
    pub needs_rebuild: bool,
}

impl BlockLayout {
    /// Base vertices of the live slots, in slot order.
    pub fn bases(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.base_vertex).collect()
    }

    /// True when the live slots tile `[0, used_vertices)` with no gaps or overlap.
    pub fn is_dense(&self) -> bool {
        let mut ranges: Vec<(u32, u32)> = self
            .slots
            .iter()
            .map(|s| (s.base_vertex, s.base_vertex + s.count))
            .collect();
        ranges.sort_unstable();

        let mut cursor = 0;
        for (start, end) in ranges {
            if start != cursor {
                return false;
            }
            cursor = end;
        }
        cursor as usize == self.used_vertices
    }
}

/// What one `render_visible` call submitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Color groups that had something to draw (one color change each).
    pub color_groups: usize,
    pub blocks: usize,
    /// Draw submissions; one per block in multi-draw mode.
    pub draw_calls: usize,
    pub primitives: usize,
    pub vertices: usize,
    /// Blocks compacted before drawing.
    pub compacted_blocks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn layout(slots: &[(u32, u32)], used: usize) -> BlockLayout {
        BlockLayout {
            key: BlockKey {
                color_key: 0,
                index: 0,
                generation: 0,
            },
            color: Color::WHITE,
            vertex_capacity: 64,
            index_capacity: 64,
            used_vertices: used,
            used_indices: used,
            slots: slots
                .iter()
                .enumerate()
                .map(|(i, &(base, count))| SlotLayout {
                    id: PrimitiveId(i as u64),
                    base_vertex: base,
                    count,
                    span: count,
                    visible: true,
                })
                .collect(),
            tombstones: 0,
            needs_compaction: false,
            needs_rebuild: false,
        }
    }

    #[test]
    fn dense_layouts() {
        assert!(layout(&[(0, 2), (2, 4)], 6).is_dense());
        assert!(layout(&[], 0).is_dense());
    }

    #[test]
    fn holes_and_overlaps_are_not_dense() {
        assert!(!layout(&[(0, 2), (5, 4)], 9).is_dense());
        assert!(!layout(&[(0, 3), (2, 4)], 6).is_dense());
        assert!(!layout(&[(0, 2)], 5).is_dense());
    }

    #[test]
    fn empty_arena_reports_zero_utilization() {
        assert_relative_eq!(ArenaStats::default().utilization(), 0.0);
        let stats = ArenaStats {
            used_vertices: 48,
            capacity_vertices: 64,
            ..ArenaStats::default()
        };
        assert_relative_eq!(stats.utilization(), 0.75);
    }
}
