use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::future::KernelFuture;
use crate::geometry::Launch;
use crate::options::BuildOptions;
use crate::types::DeviceInfo;

pub type DeviceRef = Arc<dyn ComputeDevice>;

/// Device allocation as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBuffer {
    pub id: u64,
    /// Base address of the allocation in the device address space.
    pub address: u64,
}

/// Backend-compiled kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledKernel {
    pub id: u64,
    pub program: String,
    /// Entry point name after build-time symbol renaming.
    pub name: String,
    pub max_work_group_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Argument bound to a kernel launch, in declaration order.
#[derive(Clone)]
pub enum KernelArg {
    Buffer {
        buffer: Arc<DeviceBuffer>,
        access: Access,
    },
    U32(u32),
    I32(i32),
    F32(f32),
}

impl KernelArg {
    pub fn read(buffer: &Arc<DeviceBuffer>) -> Self {
        KernelArg::Buffer {
            buffer: buffer.clone(),
            access: Access::Read,
        }
    }

    pub fn write(buffer: &Arc<DeviceBuffer>) -> Self {
        KernelArg::Buffer {
            buffer: buffer.clone(),
            access: Access::ReadWrite,
        }
    }

    pub fn buffer_id(&self) -> Option<u64> {
        match self {
            KernelArg::Buffer { buffer, .. } => Some(buffer.id()),
            _ => None,
        }
    }
}

impl fmt::Debug for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer { buffer, access } => {
                write!(f, "Buffer(#{}, {:?})", buffer.id(), access)
            }
            KernelArg::U32(v) => write!(f, "U32({v})"),
            KernelArg::I32(v) => write!(f, "I32({v})"),
            KernelArg::F32(v) => write!(f, "F32({v})"),
        }
    }
}

/// Compute backend: memory, kernel compilation and an in-order launch queue.
pub trait ComputeDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Allocate `len` f32 elements.
    fn allocate(&self, len: usize, label: &str) -> Result<RawBuffer>;

    fn free(&self, id: u64);

    /// Queue a host-to-device copy ordered after all previously queued work.
    fn write(&self, id: u64, offset: usize, data: &[f32]) -> Result<()>;

    /// Read back `len` elements once all previously queued work has completed.
    fn read(&self, id: u64, offset: usize, len: usize) -> Result<Vec<f32>>;

    fn build_kernel(
        &self,
        program: &str,
        kernel_name: &str,
        options: &BuildOptions,
    ) -> Result<CompiledKernel>;

    fn enqueue(&self, kernel: &CompiledKernel, args: &[KernelArg], launch: &Launch) -> KernelFuture;

    /// Block until the queue drains.
    fn finish(&self) -> Result<()>;
}

/// Owned device allocation; freed on drop.
pub struct DeviceBuffer {
    raw: RawBuffer,
    len: usize,
    device: DeviceRef,
    generation: AtomicU64,
}

impl DeviceBuffer {
    pub fn allocate(device: &DeviceRef, len: usize, label: &str) -> Result<Self> {
        let raw = device.allocate(len, label)?;
        Ok(Self {
            raw,
            len,
            device: device.clone(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.raw.id
    }

    pub fn address(&self) -> u64 {
        self.raw.address
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Number of host writes so far. Host-side caches derived from the
    /// contents key on `(id, generation)`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn write(&self, offset: usize, data: &[f32]) -> Result<()> {
        self.device.write(self.raw.id, offset, data)?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<f32>> {
        self.device.read(self.raw.id, offset, len)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.raw.id)
            .field("address", &format_args!("{:#x}", self.raw.address))
            .field("len", &self.len)
            .field("generation", &self.generation())
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.device.free(self.raw.id);
    }
}
