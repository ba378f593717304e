//! Deferred release of orphaned buffers.
//!
//! Growing or compacting a block replaces its storage while earlier frames may
//! still read the old buffers. Retired buffers wait here until enough frames
//! have completed that no command buffer can reference them.

use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use std::collections::VecDeque;

/// A buffer pending deletion.
struct RetiredBuffer {
    buffer: GpuBuffer,
    /// Frame number when this buffer was retired.
    frame_retired: u64,
}

/// FIFO of retired buffers keyed by the frame that retired them.
pub struct DeferredDeletionQueue {
    pending: VecDeque<RetiredBuffer>,
    frames_in_flight: usize,
    pending_bytes: u64,
}

impl DeferredDeletionQueue {
    /// Create a queue that keeps buffers for `frames_in_flight` frames.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
            pending_bytes: 0,
        }
    }

    /// Retire a buffer during `frame_number`.
    pub fn retire(&mut self, buffer: GpuBuffer, frame_number: u64) {
        self.pending_bytes += buffer.size;
        self.pending.push_back(RetiredBuffer {
            buffer,
            frame_retired: frame_number,
        });
    }

    /// Free every buffer retired at least `frames_in_flight` frames ago.
    ///
    /// Returns the number of buffers freed.
    pub fn process(
        &mut self,
        allocator: &mut GpuAllocator,
        current_frame_number: u64,
    ) -> Result<usize> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);
        let mut freed = 0;

        // Frame numbers are non-decreasing, so only the front can mature.
        while matches!(self.pending.front(), Some(p) if p.frame_retired < cutoff) {
            let Some(mut retired) = self.pending.pop_front() else {
                break;
            };
            self.pending_bytes -= retired.buffer.size;
            allocator.free_buffer(&mut retired.buffer)?;
            freed += 1;
        }

        Ok(freed)
    }

    /// Free everything immediately. Call only once the device is idle.
    pub fn flush(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        while let Some(mut retired) = self.pending.pop_front() {
            self.pending_bytes -= retired.buffer.size;
            allocator.free_buffer(&mut retired.buffer)?;
        }
        Ok(())
    }

    /// Bytes held by waiting buffers.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }
}
