//! Batched input as producers hand it over.

use linepool_core::{Color, PrimitiveId, Vertex};

/// Many polylines of one color in flattened form.
///
/// `positions` is `[x, y, z, x, y, z, ...]` for all primitives back to back;
/// `counts[i]` vertices of it belong to `ids[i]`.
#[derive(Clone, Copy, Debug)]
pub struct PolylineBatch<'a> {
    pub ids: &'a [PrimitiveId],
    pub positions: &'a [f32],
    pub counts: &'a [usize],
    pub color: Color,
}

impl<'a> PolylineBatch<'a> {
    pub const fn new(
        ids: &'a [PrimitiveId],
        positions: &'a [f32],
        counts: &'a [usize],
        color: Color,
    ) -> Self {
        Self {
            ids,
            positions,
            counts,
            color,
        }
    }

    /// Total vertices described by `counts`, or `None` if the sum overflows.
    pub fn vertex_count(&self) -> Option<usize> {
        self.counts
            .iter()
            .try_fold(0usize, |total, &count| total.checked_add(count))
    }

    /// Split into per-primitive vertex slices.
    ///
    /// Returns `None` if `ids` and `counts` disagree in length or the counts
    /// do not add up to the position data (including counts whose sum
    /// overflows).
    pub fn items(&self) -> Option<Vec<(PrimitiveId, &'a [Vertex])>> {
        if self.ids.len() != self.counts.len() {
            return None;
        }
        let vertices = Vertex::slice_from_flat(self.positions)?;
        if self.vertex_count() != Some(vertices.len()) {
            return None;
        }

        let mut offset = 0;
        Some(
            self.ids
                .iter()
                .zip(self.counts)
                .map(|(&id, &count)| {
                    let item = (id, &vertices[offset..offset + count]);
                    offset += count;
                    item
                })
                .collect(),
        )
    }
}
