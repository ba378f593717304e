//! Per-block draw command lists.

use linepool_gpu::DrawCommand;

use crate::block::PrimitiveSlot;

/// Draw commands for one block, in slot order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrawList {
    commands: Vec<DrawCommand>,
}

impl DrawList {
    /// Regenerate from the block's slots.
    ///
    /// Tombstoned and hidden slots are skipped. Every slot's index range holds
    /// `0..count`, so the draw starts at the slot's own index range and the
    /// absolute position comes from `base_vertex`.
    pub fn rebuild(&mut self, slots: &[PrimitiveSlot]) {
        self.commands.clear();
        self.commands.extend(
            slots
                .iter()
                .filter(|slot| slot.valid && slot.visible && slot.count > 0)
                .map(|slot| DrawCommand {
                    index_count: slot.count,
                    first_index: slot.base_vertex,
                    base_vertex: slot.base_vertex as i32,
                }),
        );
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationMap;
    use linepool_core::PrimitiveId;

    fn slot(id: u64, base: u32, count: u32) -> PrimitiveSlot {
        let mut map = LocationMap::new();
        let handle = map
            .insert(
                PrimitiveId(id),
                crate::location::Location {
                    block: crate::block::BlockKey {
                        color_key: 0,
                        index: 0,
                        generation: 0,
                    },
                    slot: 0,
                },
            )
            .unwrap();
        PrimitiveSlot::new(PrimitiveId(id), handle, base, count)
    }

    #[test]
    fn skips_invalid_and_hidden_slots() {
        let mut slots = vec![slot(1, 0, 2), slot(2, 2, 3), slot(3, 5, 4)];
        slots[1].valid = false;
        slots[2].visible = false;

        let mut list = DrawList::default();
        list.rebuild(&slots);

        assert_eq!(
            list.commands(),
            &[DrawCommand {
                index_count: 2,
                first_index: 0,
                base_vertex: 0
            }]
        );
    }

    #[test]
    fn preserves_slot_order() {
        let slots = vec![slot(1, 0, 2), slot(2, 2, 3), slot(3, 5, 4)];
        let mut list = DrawList::default();
        list.rebuild(&slots);

        let bases: Vec<i32> = list.commands().iter().map(|c| c.base_vertex).collect();
        assert_eq!(bases, vec![0, 2, 5]);
    }
}
