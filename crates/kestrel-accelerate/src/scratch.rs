use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use kestrel_accelerate_api::{
    shape_size, BufferContentType, DataType, DeviceBuffer, DeviceRef, MemoryType, Result, Tensor,
};
use parking_lot::Mutex;

use crate::metrics;

/// Transient tensor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchRequest {
    pub dtype: DataType,
    pub memory_type: MemoryType,
    pub shape: Vec<usize>,
    pub content_type: BufferContentType,
    /// Rented regions come from (and go back to) the pool; others are persistent.
    pub rent: bool,
}

impl ScratchRequest {
    pub fn rent(shape: Vec<usize>, content_type: BufferContentType) -> Self {
        Self {
            dtype: DataType::F32,
            memory_type: MemoryType::Buffer,
            shape,
            content_type,
            rent: true,
        }
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }
}

struct ScratchPool {
    device: DeviceRef,
    free: Mutex<HashMap<MemoryType, Vec<Arc<DeviceBuffer>>>>,
    max_pooled: usize,
}

impl ScratchPool {
    fn take_best_fit(&self, memory_type: MemoryType, len: usize) -> Option<Arc<DeviceBuffer>> {
        let mut guard = self.free.lock();
        let pool = guard.get_mut(&memory_type)?;
        let idx = pool
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.len() >= len)
            .min_by_key(|(_, buf)| buf.len())
            .map(|(idx, _)| idx)?;
        Some(pool.swap_remove(idx))
    }

    fn release(&self, memory_type: MemoryType, buffer: Arc<DeviceBuffer>) {
        let mut guard = self.free.lock();
        let pool = guard.entry(memory_type).or_default();
        if pool.len() < self.max_pooled {
            log::trace!(
                "scratch: release {:?} len={} addr={:#x}",
                memory_type,
                buffer.len(),
                buffer.address()
            );
            pool.push(buffer);
        } else {
            log::trace!(
                "scratch: drop {:?} len={} addr={:#x} (pool full)",
                memory_type,
                buffer.len(),
                buffer.address()
            );
        }
    }
}

/// Best-fit pool of transient device regions keyed by memory type.
#[derive(Clone)]
pub struct ScratchAllocator {
    pool: Arc<ScratchPool>,
}

impl ScratchAllocator {
    pub fn new(device: DeviceRef, max_pooled: usize) -> Self {
        Self {
            pool: Arc::new(ScratchPool {
                device,
                free: Mutex::new(HashMap::new()),
                max_pooled,
            }),
        }
    }

    pub fn allocate(&self, name: &str, request: ScratchRequest) -> Result<ScratchTensor> {
        let len = shape_size(&request.shape).max(1);
        let reused = if request.rent {
            self.pool.take_best_fit(request.memory_type, len)
        } else {
            None
        };
        let buffer = match reused {
            Some(buffer) => {
                metrics::global().inc_scratch_reuse();
                log::trace!(
                    "scratch: reuse {:?} len={} (capacity {}) addr={:#x}",
                    request.memory_type,
                    len,
                    buffer.len(),
                    buffer.address()
                );
                buffer
            }
            None => {
                let buffer = Arc::new(DeviceBuffer::allocate(&self.pool.device, len, name)?);
                log::trace!(
                    "scratch: new {:?} len={} addr={:#x} rent={}",
                    request.memory_type,
                    len,
                    buffer.address(),
                    request.rent
                );
                buffer
            }
        };
        let tensor = Tensor::from_buffer(
            name,
            request.shape,
            request.dtype,
            request.memory_type,
            request.content_type,
            buffer,
        )?;
        Ok(ScratchTensor {
            tensor,
            pool: request.rent.then(|| self.pool.clone()),
        })
    }

    /// Regions currently pooled for `memory_type`.
    pub fn pooled(&self, memory_type: MemoryType) -> usize {
        self.pool
            .free
            .lock()
            .get(&memory_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every pooled region.
    pub fn trim(&self) {
        self.pool.free.lock().clear();
    }
}

/// Lease on a scratch region; the region returns to the pool on drop.
pub struct ScratchTensor {
    tensor: Tensor,
    pool: Option<Arc<ScratchPool>>,
}

impl ScratchTensor {
    pub fn is_rented(&self) -> bool {
        self.pool.is_some()
    }

    /// Keep the region beyond the current call.
    pub fn promote(mut self) -> Tensor {
        self.pool = None;
        let placeholder = Tensor::new(self.tensor.device(), self.tensor.name(), self.tensor.dtype());
        std::mem::replace(&mut self.tensor, placeholder)
    }
}

impl Deref for ScratchTensor {
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        &self.tensor
    }
}

impl DerefMut for ScratchTensor {
    fn deref_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }
}

impl Drop for ScratchTensor {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            if let Some(buffer) = self.tensor.take_buffer() {
                pool.release(self.tensor.memory_type(), buffer);
            }
        }
    }
}
