//! CPU-side copies of each primitive's vertices.
//!
//! The cache is the preferred source when a block is repacked. Entries can be
//! released to save memory; the compactor then reads the primitive back from
//! its block's GPU storage instead.

use hashbrown::HashMap;
use linepool_core::{PrimitiveId, Vertex};

/// Map from primitive id to its last uploaded vertices.
#[derive(Debug, Default)]
pub struct VertexCache {
    entries: HashMap<PrimitiveId, Vec<Vertex>>,
    vertices: usize,
}

impl VertexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the copy for `id`.
    pub fn insert(&mut self, id: PrimitiveId, vertices: Vec<Vertex>) {
        self.vertices += vertices.len();
        if let Some(old) = self.entries.insert(id, vertices) {
            self.vertices -= old.len();
        }
    }

    /// Cached vertices for `id`, if still held.
    pub fn get(&self, id: PrimitiveId) -> Option<&[Vertex]> {
        self.entries.get(&id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drop the copy for `id`, returning it.
    pub fn remove(&mut self, id: PrimitiveId) -> Option<Vec<Vertex>> {
        let removed = self.entries.remove(&id)?;
        self.vertices -= removed.len();
        Some(removed)
    }

    /// Number of cached primitives.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total cached vertices across all entries.
    pub fn total_vertices(&self) -> usize {
        self.vertices
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.vertices = 0;
    }
}
