//! Vulkan implementation of [`LineBackend`].
//!
//! Block storage is host-visible and persistently mapped, so uploads and the
//! compactor's readback are memcpys. Orphaned buffers go through a
//! [`DeferredDeletionQueue`] because frames still in flight may reference them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use linepool_core::{Color, Vertex};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{BufferKind, DrawCommand, LineBackend};
use crate::deferred::DeferredDeletionQueue;
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};

/// Where draws are recorded and where the line color goes.
///
/// The caller's graphics pipeline must be bound on `command_buffer` inside an
/// active render pass, and its layout must expose a push constant range of
/// at least 16 bytes at `color_offset` for `color_stages`.
#[derive(Clone, Copy, Debug)]
pub struct VulkanPass {
    pub command_buffer: vk::CommandBuffer,
    pub pipeline_layout: vk::PipelineLayout,
    pub color_stages: vk::ShaderStageFlags,
    pub color_offset: u32,
}

/// Vulkan backend over a shared device and allocator.
pub struct VulkanBackend {
    device: Arc<ash::Device>,
    allocator: Arc<Mutex<GpuAllocator>>,
    retired: Mutex<DeferredDeletionQueue>,
    frame: AtomicU64,
    multi_draw: Option<ash::ext::multi_draw::Device>,
}

impl VulkanBackend {
    /// Wrap an existing device and allocator.
    ///
    /// Pass a `VK_EXT_multi_draw` loader to batch each block into a single
    /// draw command; without it batches are recorded as individual draws.
    pub fn new(
        device: Arc<ash::Device>,
        allocator: Arc<Mutex<GpuAllocator>>,
        frames_in_flight: usize,
        multi_draw: Option<ash::ext::multi_draw::Device>,
    ) -> Self {
        Self {
            device,
            allocator,
            retired: Mutex::new(DeferredDeletionQueue::new(frames_in_flight)),
            frame: AtomicU64::new(0),
            multi_draw,
        }
    }

    /// Vertex input binding the caller's pipeline must declare.
    pub fn vertex_binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(Vertex::SIZE as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Vertex attributes: location 0 is the position.
    pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 1] {
        [vk::VertexInputAttributeDescription::default()
            .location(0)
            .binding(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)]
    }

    /// Topology the arena's draws assume.
    pub const fn topology() -> vk::PrimitiveTopology {
        vk::PrimitiveTopology::LINE_STRIP
    }

    /// Advance to `frame_number` and free buffers no frame can still use.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&self, frame_number: u64) -> Result<()> {
        self.frame.store(frame_number, Ordering::Release);
        let mut allocator = self.allocator.lock();
        let freed = self.retired.lock().process(&mut allocator, frame_number)?;
        if freed > 0 {
            debug!(freed, frame = frame_number, "Released orphaned buffers");
        }
        Ok(())
    }

    /// Free all retired buffers. The device must be idle.
    pub fn shutdown(&self) -> Result<()> {
        let mut allocator = self.allocator.lock();
        self.retired.lock().flush(&mut allocator)
    }

    /// Bytes held by buffers waiting for their frames to retire.
    pub fn retired_bytes(&self) -> u64 {
        self.retired.lock().pending_bytes()
    }
}

impl LineBackend for VulkanBackend {
    type Buffer = GpuBuffer;
    type Pass = VulkanPass;

    fn create_buffer(&self, kind: BufferKind, size: u64, label: &str) -> Result<GpuBuffer> {
        self.allocator.lock().create_buffer(size, kind, label)
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let frame = self.frame.load(Ordering::Acquire);
        self.retired.lock().retire(buffer, frame);
    }

    fn buffer_size(&self, buffer: &GpuBuffer) -> u64 {
        buffer.size
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, data)
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        buffer.read_bytes(offset, len)
    }

    fn in_place_writes(&self) -> bool {
        false
    }

    fn set_line_color(&self, pass: &mut VulkanPass, color: Color) {
        unsafe {
            self.device.cmd_push_constants(
                pass.command_buffer,
                pass.pipeline_layout,
                pass.color_stages,
                pass.color_offset,
                bytemuck::bytes_of(&color),
            );
        }
    }

    fn bind_geometry(&self, pass: &mut VulkanPass, vertices: &GpuBuffer, indices: &GpuBuffer) {
        if vertices.kind != BufferKind::Vertex || indices.kind != BufferKind::Index {
            warn!("bind_geometry called with mismatched buffer kinds");
        }
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(pass.command_buffer, 0, &[vertices.buffer], &[0]);
            self.device.cmd_bind_index_buffer(
                pass.command_buffer,
                indices.buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    fn draw_indexed(&self, pass: &mut VulkanPass, command: DrawCommand) {
        unsafe {
            self.device.cmd_draw_indexed(
                pass.command_buffer,
                command.index_count,
                1,
                command.first_index,
                command.base_vertex,
                0,
            );
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn multi_draw_indexed(&self, pass: &mut VulkanPass, commands: &[DrawCommand]) {
        let Some(multi_draw) = &self.multi_draw else {
            for &command in commands {
                self.draw_indexed(pass, command);
            }
            return;
        };

        let infos = multi_draw_infos(commands);

        // ash exposes only the raw entry point for this extension.
        unsafe {
            (multi_draw.fp().cmd_draw_multi_indexed_ext)(
                pass.command_buffer,
                infos.len() as u32,
                infos.as_ptr(),
                1,
                0,
                std::mem::size_of::<vk::MultiDrawIndexedInfoEXT>() as u32,
                std::ptr::null(),
            );
        }
    }
}

/// `VK_EXT_multi_draw` records for a batch, tightly packed.
fn multi_draw_infos(commands: &[DrawCommand]) -> Vec<vk::MultiDrawIndexedInfoEXT> {
    commands
        .iter()
        .map(|c| vk::MultiDrawIndexedInfoEXT {
            first_index: c.first_index,
            index_count: c.index_count,
            vertex_offset: c.base_vertex,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_draw_infos_carry_base_vertex_as_vertex_offset() {
        let infos = multi_draw_infos(&[
            DrawCommand { index_count: 2, first_index: 0, base_vertex: 0 },
            DrawCommand { index_count: 4, first_index: 5, base_vertex: 5 },
        ]);

        assert_eq!(infos.len(), 2);
        assert_eq!(
            (infos[1].index_count, infos[1].first_index, infos[1].vertex_offset),
            (4, 5, 5)
        );
        assert_eq!(std::mem::size_of::<vk::MultiDrawIndexedInfoEXT>(), 12);
    }

    #[test]
    fn vertex_layout_matches_the_uploaded_vertex() {
        assert_eq!(VulkanBackend::vertex_binding().stride as usize, Vertex::SIZE);
        assert_eq!(VulkanBackend::vertex_attributes()[0].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(VulkanBackend::topology(), vk::PrimitiveTopology::LINE_STRIP);
    }
}
