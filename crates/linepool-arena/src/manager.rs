//! The public polyline manager.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use linepool_core::{ArenaConfig, Color, IdGenerator, PrimitiveId, Vertex};
use linepool_gpu::LineBackend;
use parking_lot::{Mutex, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use crate::batch::PolylineBatch;
use crate::block::BlockKey;
use crate::error::{ArenaError, Result};
use crate::state::Shared;
use crate::stats::{ArenaStats, BlockLayout, RenderStats};
use crate::worker::DefragWorkerHandle;

/// Owns every polyline's GPU storage.
///
/// All methods take `&self`; one reader/writer lock covers the block
/// registry, the location map and the vertex cache. Rejected input (fewer
/// than two vertices, duplicate or unknown ids) is reported as `Ok(false)`,
/// never as an error.
pub struct PolylineManager<B: LineBackend> {
    shared: Arc<Shared<B>>,
    config: ArenaConfig,
    ids: IdGenerator,
    request_tx: Sender<BlockKey>,
    request_rx: Receiver<BlockKey>,
    error_tx: Sender<ArenaError>,
    error_rx: Receiver<ArenaError>,
    worker: Mutex<Option<DefragWorkerHandle>>,
}

impl<B: LineBackend> PolylineManager<B> {
    /// Create a manager with the default configuration.
    pub fn new(backend: B) -> Self {
        Self::build(backend, ArenaConfig::default())
    }

    /// Create a manager with a validated configuration.
    pub fn with_config(backend: B, config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, config))
    }

    fn build(backend: B, config: ArenaConfig) -> Self {
        let (request_tx, request_rx) = channel::unbounded();
        let (error_tx, error_rx) = channel::unbounded();
        Self {
            shared: Arc::new(Shared::new(backend, config.clone())),
            config,
            ids: IdGenerator::default(),
            request_tx,
            request_rx,
            error_tx,
            error_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Next id from the manager's wrapping generator.
    pub fn allocate_id(&self) -> PrimitiveId {
        self.ids.next_id()
    }

    /// Add a polyline at the tail of a block of its color.
    ///
    /// Returns `Ok(false)` for fewer than two vertices or an id already present.
    pub fn add(&self, id: PrimitiveId, vertices: &[[f32; 3]], color: Color) -> Result<bool> {
        self.shared
            .state
            .write()
            .add(&self.shared.backend, id, as_vertices(vertices), color)
    }

    /// Add many polylines at once.
    ///
    /// Items are grouped by color; each block receives one growth check and
    /// one upload per buffer. Short polylines and duplicate ids are skipped,
    /// and a group whose counts do not match its data is skipped whole.
    /// Returns how many polylines were added.
    pub fn add_batch(&self, batches: &[PolylineBatch<'_>]) -> Result<usize> {
        self.shared
            .state
            .write()
            .add_batch(&self.shared.backend, batches)
    }

    /// Tombstone a polyline. Its space is reclaimed by the next compaction.
    pub fn remove(&self, id: PrimitiveId) -> Result<bool> {
        Ok(self.shared.state.write().remove(id))
    }

    /// Remove several polylines under one lock; returns how many existed.
    pub fn remove_batch(&self, ids: &[PrimitiveId]) -> Result<usize> {
        Ok(self.shared.state.write().remove_batch(ids))
    }

    /// Replace a polyline's vertices, in place when they fit its slot.
    pub fn update(&self, id: PrimitiveId, vertices: &[[f32; 3]]) -> Result<bool> {
        self.shared
            .state
            .write()
            .update(&self.shared.backend, id, as_vertices(vertices))
    }

    /// Show or hide a polyline without touching GPU storage.
    pub fn set_visible(&self, id: PrimitiveId, visible: bool) -> Result<bool> {
        Ok(self.shared.state.write().set_visible(id, visible))
    }

    pub fn is_visible(&self, id: PrimitiveId) -> Option<bool> {
        self.shared.state.read().is_visible(id)
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.shared.state.read().contains(id)
    }

    /// Number of live polylines.
    pub fn len(&self) -> usize {
        self.shared.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every polyline and release all blocks.
    pub fn clear_all(&self) {
        let mut state = self.shared.state.write();
        state.clear(&self.shared.backend);
        // Requests issued before the clear refer to dead blocks
        self.request_rx.try_iter().for_each(drop);
        self.shared.queued.lock().clear();
    }

    /// Draw every visible polyline into `pass`.
    ///
    /// The caller's pipeline must already be bound. Compaction requests from
    /// the background worker are applied first, orphaned blocks are refilled,
    /// and stale draw lists rebuilt; drawing then happens under the shared
    /// lock. Each color group gets a single color change.
    pub fn render_visible(&self, pass: &mut B::Pass) -> Result<RenderStats> {
        let backend = &self.shared.backend;
        let requested = self.drain_requests();

        let state = self.shared.state.upgradable_read();
        let mut compacted = 0;
        let state = if requested.is_empty() && !state.needs_render_prep() {
            RwLockUpgradableReadGuard::downgrade(state)
        } else {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            for key in requested {
                compacted += usize::from(state.compact_if_wanted(backend, key)?);
            }
            compacted += state.prepare_render(backend)?;
            RwLockWriteGuard::downgrade(state)
        };

        let mut stats = state.draw(backend, pass);
        stats.compacted_blocks = compacted;
        trace!(
            draws = stats.draw_calls,
            primitives = stats.primitives,
            compacted,
            "Rendered"
        );
        Ok(stats)
    }

    /// Compact every block with holes or orphaned storage now, ignoring the
    /// utilization threshold. Returns the number of blocks compacted.
    pub fn defragment_now(&self) -> Result<usize> {
        self.shared
            .state
            .write()
            .defragment(&self.shared.backend)
    }

    /// Apply compaction requests queued by the background worker.
    pub fn process_defrag_requests(&self) -> Result<usize> {
        let requested = self.drain_requests();
        if requested.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.write();
        let mut compacted = 0;
        for key in requested {
            compacted += usize::from(state.compact_if_wanted(&self.shared.backend, key)?);
        }
        Ok(compacted)
    }

    /// Start the periodic defrag thread.
    pub fn start_background_defrag(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(ArenaError::WorkerAlreadyRunning);
        }
        *worker = Some(DefragWorkerHandle::spawn(
            Arc::clone(&self.shared),
            &self.config,
            self.request_tx.clone(),
            self.error_tx.clone(),
        )?);
        Ok(())
    }

    /// Stop the defrag thread and wait for it. A no-op if none is running.
    pub fn stop_background_defrag(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        match worker {
            Some(mut worker) => worker.shutdown(),
            None => Ok(()),
        }
    }

    pub fn is_background_defrag_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Errors reported by the background worker since the last call.
    pub fn take_worker_errors(&self) -> Vec<ArenaError> {
        self.error_rx.try_iter().collect()
    }

    /// Cached CPU copy of a polyline's vertices.
    pub fn vertices(&self, id: PrimitiveId) -> Option<Vec<Vertex>> {
        self.shared.state.read().vertices(id)
    }

    /// Evict the CPU copy of `id`. Later repacks read it back from the GPU.
    pub fn release_cached_vertices(&self, id: PrimitiveId) -> Result<bool> {
        self.shared
            .state
            .write()
            .release_cached(&self.shared.backend, id)
    }

    /// Read a polyline's vertices back from GPU storage.
    pub fn read_back(&self, id: PrimitiveId) -> Result<Option<Vec<Vertex>>> {
        self.shared
            .state
            .write()
            .read_back(&self.shared.backend, id)
    }

    pub fn stats(&self) -> ArenaStats {
        self.shared.state.read().stats()
    }

    /// Snapshot of every block's layout.
    pub fn block_layouts(&self) -> Vec<BlockLayout> {
        self.shared.state.read().layouts()
    }

    fn drain_requests(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self.request_rx.try_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        if !keys.is_empty() {
            let mut queued = self.shared.queued.lock();
            for key in &keys {
                queued.remove(key);
            }
        }
        if !keys.is_empty() {
            debug!(blocks = keys.len(), "Draining defrag requests");
        }
        keys
    }
}

impl<B: LineBackend> Drop for PolylineManager<B> {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.get_mut().take() {
            if let Err(e) = worker.shutdown() {
                warn!(error = %e, "Defrag worker did not stop cleanly");
            }
        }
        self.shared.state.write().clear(&self.shared.backend);
    }
}

fn as_vertices(positions: &[[f32; 3]]) -> &[Vertex] {
    bytemuck::cast_slice(positions)
}
