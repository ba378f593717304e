//! Random-walk polyline generator.
//!
//! Each line starts at a random point and wanders around it in short steps,
//! turning at most 30 degrees per step and bending back toward its start
//! once it strays past 80% of the allowed radius.

use std::f32::consts::PI;

use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Upper bound on points per generated line.
pub const MAX_POINTS: usize = 5000;

/// Lines in flattened form, ready for a `PolylineBatch`.
#[derive(Debug, Default)]
pub struct GeneratedLines {
    pub positions: Vec<f32>,
    pub counts: Vec<usize>,
}

impl GeneratedLines {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.counts.iter().sum()
    }
}

pub struct PolylineGenerator {
    rng: StdRng,
    min: Vec2,
    max: Vec2,
}

impl PolylineGenerator {
    /// Generator over the `[-1, 1]` square.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            min: Vec2::splat(-1.0),
            max: Vec2::splat(1.0),
        }
    }

    /// Pick a point count in `[min_points, max_points]`, clamped to `[2, MAX_POINTS]`.
    pub fn point_count(&mut self, min_points: usize, max_points: usize) -> usize {
        let max_points = max_points.clamp(2, MAX_POINTS);
        let min_points = min_points.clamp(2, max_points);
        self.rng.gen_range(min_points..=max_points)
    }

    /// `count` random-walk lines with point counts in `[min_points, max_points]`.
    pub fn lines(&mut self, count: usize, min_points: usize, max_points: usize) -> GeneratedLines {
        let mut out = GeneratedLines::default();
        for _ in 0..count {
            let points = self.point_count(min_points, max_points);
            out.positions
                .extend(self.polyline(points).into_iter().flatten());
            out.counts.push(points);
        }
        out
    }

    /// One random-walk line of `points` vertices on the z = 0 plane.
    pub fn polyline(&mut self, points: usize) -> Vec<[f32; 3]> {
        let points = points.max(2);
        let extent = self.max - self.min;
        let max_radius = extent.min_element() * 0.4;

        let center = Vec2::new(
            self.rng.gen_range(self.min.x..self.max.x),
            self.rng.gen_range(self.min.y..self.max.y),
        );

        let mut line = Vec::with_capacity(points);
        let mut prev = center;
        line.push([prev.x, prev.y, 0.0]);

        for _ in 1..points {
            let offset = prev - center;
            let distance = offset.length();
            let heading = offset.y.atan2(offset.x);

            let mut turn = self.rng.gen_range(-PI / 6.0..PI / 6.0);
            let step = self.rng.gen_range(max_radius * 0.02..max_radius * 0.1);
            if distance > max_radius * 0.8 {
                let inward = (-offset.y).atan2(-offset.x);
                turn = (turn - (heading - inward)) * 0.5;
            }

            let angle = heading + turn;
            let jitter = self.rng.gen_range(-0.5f32..1.5) - 0.5;
            let radius = (distance + step * jitter).min(max_radius).max(0.05);

            prev = center + Vec2::from_angle(angle) * radius;
            line.push([prev.x, prev.y, 0.0]);
        }

        line
    }
}
