//! Arena configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

/// How a block's visible primitives are submitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawMode {
    /// One indexed draw per primitive.
    PerPrimitive,
    /// One batched multi-draw per block.
    #[default]
    MultiDraw,
}

/// What happens to a block's contents after its storage is orphaned by growth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthRebuild {
    /// Repack every live primitive into the new storage right away.
    #[default]
    Immediate,
    /// Mark the block for a forced compaction before it is drawn or written again.
    Deferred,
}

/// Where background compaction does its GPU writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragDispatch {
    /// Worker only scans; the owning thread compacts when it drains requests.
    #[default]
    OwnerThread,
    /// Worker takes the write lock and compacts itself.
    Worker,
}

/// Tunables for the polyline arena.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Vertex/index capacity of a new block.
    pub initial_capacity: usize,
    /// Minimum growth increment.
    pub grow_step: usize,
    /// Vertices per block before a sibling block for the same color is opened.
    pub max_vertices_per_block: usize,
    /// Headroom required when picking an existing block.
    pub slack_margin: usize,
    /// Utilization (used / capacity) below which flagged blocks get compacted.
    pub compaction_threshold: f32,
    /// Draw submission strategy.
    pub draw_mode: DrawMode,
    /// Reconstruction policy after growth.
    pub growth_rebuild: GrowthRebuild,
    /// Background compaction placement.
    pub defrag_dispatch: DefragDispatch,
    /// Time between background scans, in milliseconds.
    pub defrag_interval_ms: u64,
    /// Sleep granularity of the background worker, in milliseconds.
    pub defrag_poll_step_ms: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_capacity: constants::INITIAL_CAPACITY,
            grow_step: constants::GROW_STEP,
            max_vertices_per_block: constants::MAX_VERTICES_PER_BLOCK,
            slack_margin: constants::SLACK_MARGIN,
            compaction_threshold: constants::COMPACTION_THRESHOLD,
            draw_mode: DrawMode::default(),
            growth_rebuild: GrowthRebuild::default(),
            defrag_dispatch: DefragDispatch::default(),
            defrag_interval_ms: 8_000,
            defrag_poll_step_ms: 50,
        }
    }
}

impl ArenaConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity == 0 {
            return Err(Error::InvalidConfig("initial_capacity must be > 0".into()));
        }
        if self.grow_step == 0 {
            return Err(Error::InvalidConfig("grow_step must be > 0".into()));
        }
        if self.slack_margin >= self.max_vertices_per_block {
            return Err(Error::InvalidConfig(format!(
                "slack_margin ({}) must be below max_vertices_per_block ({})",
                self.slack_margin, self.max_vertices_per_block
            )));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "compaction_threshold {} outside (0, 1]",
                self.compaction_threshold
            )));
        }
        if self.defrag_poll_step_ms == 0 {
            return Err(Error::InvalidConfig("defrag_poll_step_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Set the initial block capacity.
    pub fn with_initial_capacity(mut self, vertices: usize) -> Self {
        self.initial_capacity = vertices;
        self
    }

    /// Set the growth increment.
    pub fn with_grow_step(mut self, vertices: usize) -> Self {
        self.grow_step = vertices;
        self
    }

    /// Set the per-block vertex cap and the slack kept below it.
    pub fn with_block_limits(mut self, max_vertices: usize, slack: usize) -> Self {
        self.max_vertices_per_block = max_vertices;
        self.slack_margin = slack;
        self
    }

    /// Set the compaction utilization threshold.
    pub fn with_compaction_threshold(mut self, threshold: f32) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Set the draw submission strategy.
    pub fn with_draw_mode(mut self, mode: DrawMode) -> Self {
        self.draw_mode = mode;
        self
    }

    /// Set the post-growth reconstruction policy.
    pub fn with_growth_rebuild(mut self, rebuild: GrowthRebuild) -> Self {
        self.growth_rebuild = rebuild;
        self
    }

    /// Set where background compaction runs.
    pub fn with_defrag_dispatch(mut self, dispatch: DefragDispatch) -> Self {
        self.defrag_dispatch = dispatch;
        self
    }

    /// Set the background scan interval.
    pub fn with_defrag_interval(mut self, interval: Duration) -> Self {
        self.defrag_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the background worker sleep granularity.
    pub fn with_defrag_poll_step(mut self, step: Duration) -> Self {
        self.defrag_poll_step_ms = (step.as_millis() as u64).max(1);
        self
    }

    /// Background scan interval.
    pub fn defrag_interval(&self) -> Duration {
        Duration::from_millis(self.defrag_interval_ms)
    }

    /// Background worker sleep granularity.
    pub fn defrag_poll_step(&self) -> Duration {
        Duration::from_millis(self.defrag_poll_step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn defaults_are_valid() {
        let config = ArenaConfig::default();
        config.validate().unwrap();
        assert_relative_eq!(config.compaction_threshold, 0.70);
        assert_eq!(config.draw_mode, DrawMode::MultiDraw);
    }

    #[test]
    fn toml_overrides_and_fills_defaults() {
        let config = ArenaConfig::from_toml_str(
            r#"
            initial_capacity = 64
            compaction_threshold = 0.5
            draw_mode = "per_primitive"
            defrag_dispatch = "worker"
            "#,
        )
        .unwrap();

        assert_eq!(config.initial_capacity, 64);
        assert_relative_eq!(config.compaction_threshold, 0.5);
        assert_eq!(config.draw_mode, DrawMode::PerPrimitive);
        assert_eq!(config.defrag_dispatch, DefragDispatch::Worker);
        assert_eq!(config.grow_step, constants::GROW_STEP);
    }

    #[test]
    fn rejects_bad_threshold() {
        let err = ArenaConfig::from_toml_str("compaction_threshold = 1.5").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ArenaConfig::from_toml_str("initial_capacity = \"lots\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn builder_chains() {
        let config = ArenaConfig::default()
            .with_initial_capacity(8)
            .with_block_limits(100, 4)
            .with_defrag_interval(Duration::from_millis(20));
        assert_eq!(config.initial_capacity, 8);
        assert_eq!(config.max_vertices_per_block, 100);
        assert_eq!(config.slack_margin, 4);
        assert_eq!(config.defrag_interval(), Duration::from_millis(20));
    }
}
