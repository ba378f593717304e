//! Core polyline types.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Stable external identifier of a polyline.
///
/// This is the only handle callers hold; GPU offsets behind it move freely
/// during compaction.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct PrimitiveId(pub u64);

impl fmt::Display for PrimitiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrimitiveId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic id source that wraps on overflow.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is `start`.
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Hand out the next id.
    #[inline]
    pub fn next_id(&self) -> PrimitiveId {
        // fetch_add wraps on overflow
        PrimitiveId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Peek at the id the next call will return.
    pub fn peek(&self) -> PrimitiveId {
        PrimitiveId(self.next.load(Ordering::Relaxed))
    }
}

/// Render color (linear RGBA, 0.0-1.0).
///
/// Blocks are grouped by [`Color::key`], so two colors that quantize to the
/// same 8-bit RGBA share GPU storage.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Self = Self::rgb(0.0, 0.0, 0.0);
    pub const WHITE: Self = Self::rgb(1.0, 1.0, 1.0);
    pub const RED: Self = Self::rgb(1.0, 0.0, 0.0);
    pub const GREEN: Self = Self::rgb(0.0, 1.0, 0.0);
    pub const BLUE: Self = Self::rgb(0.0, 0.0, 1.0);

    /// Create a color from RGBA components.
    #[inline]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Create an opaque color.
    #[inline]
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::new(r, g, b, 1.0)
    }

    /// Pack into `0xRRGGBBAA` after clamping each channel to 8 bits.
    pub fn key(self) -> u32 {
        let quantize = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
        (quantize(self.r) << 24) | (quantize(self.g) << 16) | (quantize(self.b) << 8) | quantize(self.a)
    }

    /// Components as an array, in uniform upload order.
    #[inline]
    pub const fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

/// GPU vertex: a bare position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
#[repr(C)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    /// Size of one vertex in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
        }
    }

    /// Reinterpret a flat `[x, y, z, x, y, z, ...]` slice.
    ///
    /// Returns `None` if the length is not a multiple of three.
    pub fn slice_from_flat(flat: &[f32]) -> Option<&[Self]> {
        if flat.len() % 3 != 0 {
            return None;
        }
        Some(bytemuck::cast_slice(flat))
    }
}

impl From<[f32; 3]> for Vertex {
    fn from(position: [f32; 3]) -> Self {
        Self { position }
    }
}

impl From<Vec3> for Vertex {
    fn from(v: Vec3) -> Self {
        Self {
            position: v.to_array(),
        }
    }
}

impl From<Vertex> for Vec3 {
    fn from(v: Vertex) -> Self {
        Self::from_array(v.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_is_monotonic() {
        let ids = IdGenerator::starting_at(10);
        assert_eq!(ids.next_id(), PrimitiveId(10));
        assert_eq!(ids.next_id(), PrimitiveId(11));
        assert_eq!(ids.peek(), PrimitiveId(12));
    }

    #[test]
    fn id_generator_wraps() {
        let ids = IdGenerator::starting_at(u64::MAX);
        assert_eq!(ids.next_id(), PrimitiveId(u64::MAX));
        assert_eq!(ids.next_id(), PrimitiveId(0));
    }

    #[test]
    fn color_key_packs_rgba() {
        assert_eq!(Color::RED.key(), 0xFF00_00FF);
        assert_eq!(Color::new(0.0, 0.0, 1.0, 0.0).key(), 0x0000_FF00);
        // Out of range channels clamp instead of bleeding into neighbours.
        assert_eq!(Color::new(2.0, -1.0, 0.0, 1.0).key(), 0xFF00_00FF);
    }

    #[test]
    fn vertex_flat_view() {
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let verts = Vertex::slice_from_flat(&flat).unwrap();
        assert_eq!(verts.len(), 2);
        assert_eq!(verts[1], Vertex::new(4.0, 5.0, 6.0));
        assert!(Vertex::slice_from_flat(&flat[..4]).is_none());
    }

    #[test]
    fn vertex_is_twelve_bytes() {
        assert_eq!(Vertex::SIZE, 12);
    }
}
