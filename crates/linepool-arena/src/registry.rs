//! Owned registry of color blocks.

use std::collections::BTreeMap;

use linepool_core::Color;
use linepool_gpu::LineBackend;
use tracing::debug;

use crate::block::{BlockKey, ColorBlock};

/// All blocks, grouped by color key.
///
/// Blocks are only ever appended to a color's list, so a [`BlockKey`] index
/// stays valid until [`BlockRegistry::clear`] bumps the generation.
pub struct BlockRegistry<B: LineBackend> {
    groups: BTreeMap<u32, Vec<ColorBlock<B>>>,
    generation: u32,
}

impl<B: LineBackend> Default for BlockRegistry<B> {
    fn default() -> Self {
        Self {
            groups: BTreeMap::new(),
            generation: 0,
        }
    }
}

impl<B: LineBackend> BlockRegistry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn get(&self, key: BlockKey) -> Option<&ColorBlock<B>> {
        if key.generation != self.generation {
            return None;
        }
        self.groups.get(&key.color_key)?.get(key.index as usize)
    }

    pub fn get_mut(&mut self, key: BlockKey) -> Option<&mut ColorBlock<B>> {
        if key.generation != self.generation {
            return None;
        }
        self.groups.get_mut(&key.color_key)?.get_mut(key.index as usize)
    }

    /// First block of `color` that can take `needed` more vertices.
    pub fn find_with_room(
        &self,
        color: Color,
        needed: usize,
        max_vertices: usize,
        slack: usize,
    ) -> Option<BlockKey> {
        self.groups
            .get(&color.key())?
            .iter()
            .find(|block| block.has_room_for(needed, max_vertices, slack))
            .map(ColorBlock::key)
    }

    /// Allocate a new block for `color`.
    pub(crate) fn create(
        &mut self,
        backend: &B,
        color: Color,
        capacity: usize,
    ) -> linepool_gpu::Result<BlockKey> {
        let color_key = color.key();
        let key = BlockKey {
            color_key,
            index: self.groups.get(&color_key).map_or(0, Vec::len) as u32,
            generation: self.generation,
        };
        let block = ColorBlock::create(backend, key, color, capacity)?;
        self.groups.entry(color_key).or_default().push(block);
        debug!(block = ?key, capacity, "Block opened");
        Ok(key)
    }

    pub fn keys(&self) -> Vec<BlockKey> {
        self.blocks().map(ColorBlock::key).collect()
    }

    /// Every block, color groups in key order.
    pub fn blocks(&self) -> impl Iterator<Item = &ColorBlock<B>> {
        self.groups.values().flatten()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut ColorBlock<B>> {
        self.groups.values_mut().flatten()
    }

    /// Color groups in key order.
    pub fn groups(&self) -> impl Iterator<Item = &[ColorBlock<B>]> {
        self.groups.values().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Destroy every block and start a new generation.
    pub(crate) fn clear(&mut self, backend: &B) {
        for block in std::mem::take(&mut self.groups).into_values().flatten() {
            block.destroy(backend);
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linepool_gpu::HeadlessBackend;

    #[test]
    fn blocks_are_grouped_by_color() {
        let backend = HeadlessBackend::new();
        let mut registry = BlockRegistry::new();
        let red = registry.create(&backend, Color::RED, 16).unwrap();
        let blue = registry.create(&backend, Color::BLUE, 16).unwrap();
        let red2 = registry.create(&backend, Color::RED, 16).unwrap();

        assert_eq!(red.index, 0);
        assert_eq!(red2.index, 1);
        assert_eq!(blue.index, 0);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.groups().count(), 2);
        assert_eq!(registry.get(red2).unwrap().color(), Color::RED);
    }

    #[test]
    fn find_with_room_skips_full_blocks() {
        let backend = HeadlessBackend::new();
        let mut registry = BlockRegistry::new();
        let first = registry.create(&backend, Color::RED, 16).unwrap();
        registry.get_mut(first).unwrap().used_vertices = 20;
        let second = registry.create(&backend, Color::RED, 16).unwrap();

        assert_eq!(registry.find_with_room(Color::RED, 4, 24, 1), Some(second));
        assert_eq!(registry.find_with_room(Color::RED, 2, 24, 1), Some(first));
        assert_eq!(registry.find_with_room(Color::BLUE, 4, 24, 1), None);
    }

    #[test]
    fn clear_invalidates_old_keys_and_frees_storage() {
        let backend = HeadlessBackend::new();
        let mut registry = BlockRegistry::new();
        let key = registry.create(&backend, Color::WHITE, 16).unwrap();

        registry.clear(&backend);

        assert!(registry.get(key).is_none());
        assert!(registry.is_empty());
        assert_eq!(backend.stats().live_buffers, 0);

        let fresh = registry.create(&backend, Color::WHITE, 16).unwrap();
        assert_eq!(fresh.index, key.index);
        assert_ne!(fresh, key);
    }
}
