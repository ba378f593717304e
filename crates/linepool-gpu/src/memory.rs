//! GPU memory management.

use crate::backend::BufferKind;
use crate::error::{check_range, GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::sync::Arc;
use tracing::warn;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Allocate a host-visible vertex or index buffer.
    ///
    /// The memory stays persistently mapped so sub-range uploads and
    /// readbacks are plain copies.
    pub fn create_buffer(&mut self, size: u64, kind: BufferKind, name: &str) -> Result<GpuBuffer> {
        let usage = match kind {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        } | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let Some(allocator) = self.allocator.as_mut() else {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::InvalidState("Allocator not initialized".to_string()));
        };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                // Nothing was bound yet, so the raw handle is the only thing to undo.
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(match e {
                    AllocationError::OutOfMemory => GpuError::OutOfMemory {
                        requested: requirements.size,
                        available: 0,
                    },
                    other => GpuError::AllocationFailed(other.to_string()),
                });
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            if let Err(free_err) = allocator.free(allocation) {
                warn!(error = %free_err, name, "Failed to free allocation after bind failure");
            }
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            kind,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A host-visible GPU buffer with its allocation.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub kind: BufferKind,
}

impl GpuBuffer {
    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))
    }

    /// Write raw bytes at the given offset.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.size)?;
        let ptr = self.mapped_ptr()?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Copy `len` bytes out of the mapping starting at `offset`.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_range(offset, len, self.size)?;
        let ptr = self.mapped_ptr()?;

        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }

        Ok(out)
    }
}
