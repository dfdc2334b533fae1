use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceBuffer, DeviceRef};
use crate::error::{DispatchError, Result};
use crate::types::{BufferContentType, DataType, MemoryType};

pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Device tensor: shape and layout metadata over a shared device buffer.
///
/// The buffer capacity may exceed the element count; `resize` only
/// reallocates when the new element count does not fit.
pub struct Tensor {
    name: String,
    shape: Vec<usize>,
    dtype: DataType,
    memory_type: MemoryType,
    content_type: BufferContentType,
    buffer: Option<Arc<DeviceBuffer>>,
    device: DeviceRef,
}

impl Tensor {
    pub fn new(device: &DeviceRef, name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            dtype,
            memory_type: MemoryType::Buffer,
            content_type: BufferContentType::InOutChannel,
            buffer: None,
            device: device.clone(),
        }
    }

    /// Wrap an existing buffer, e.g. a scratch region.
    pub fn from_buffer(
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DataType,
        memory_type: MemoryType,
        content_type: BufferContentType,
        buffer: Arc<DeviceBuffer>,
    ) -> Result<Self> {
        let name = name.into();
        let needed = shape_size(&shape);
        if needed > buffer.len() {
            return Err(DispatchError::config(
                name,
                format!(
                    "shape {:?} needs {} elements, buffer holds {}",
                    shape,
                    needed,
                    buffer.len()
                ),
            ));
        }
        let device = buffer.device().clone();
        Ok(Self {
            name,
            shape,
            dtype,
            memory_type,
            content_type,
            buffer: Some(buffer),
            device,
        })
    }

    /// Upload host data into a freshly allocated tensor.
    pub fn from_host(
        device: &DeviceRef,
        name: impl Into<String>,
        shape: &[usize],
        data: &[f32],
    ) -> Result<Self> {
        let mut tensor = Tensor::new(device, name, DataType::F32);
        if data.len() != shape_size(shape) {
            return Err(DispatchError::config(
                tensor.name.clone(),
                format!(
                    "shape {:?} expects {} values, got {}",
                    shape,
                    shape_size(shape),
                    data.len()
                ),
            ));
        }
        tensor.resize(shape)?;
        tensor.copy_from_host(data)?;
        Ok(tensor)
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_content_type(mut self, content_type: BufferContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self, index: usize) -> usize {
        self.shape.get(index).copied().unwrap_or(1)
    }

    pub fn dim_size(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        shape_size(&self.shape)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DataType) {
        self.dtype = dtype;
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn content_type(&self) -> BufferContentType {
        self.content_type
    }

    pub fn set_content_type(&mut self, content_type: BufferContentType) {
        self.content_type = content_type;
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Allocated capacity in elements.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn memory(&self) -> Result<&Arc<DeviceBuffer>> {
        self.buffer
            .as_ref()
            .ok_or_else(|| DispatchError::config(self.name.clone(), "tensor has no device memory"))
    }

    /// Buffer for kernels that write this tensor; allocates when the tensor is empty.
    pub fn mutable_memory(&mut self) -> Result<&Arc<DeviceBuffer>> {
        if self.buffer.is_none() {
            let len = self.size().max(1);
            let buffer = DeviceBuffer::allocate(&self.device, len, &self.name)?;
            self.buffer = Some(Arc::new(buffer));
        }
        self.memory()
    }

    /// Base address of the backing buffer, if any.
    pub fn base_address(&self) -> Option<u64> {
        self.buffer.as_ref().map(|b| b.address())
    }

    pub fn buffer_id(&self) -> Option<u64> {
        self.buffer.as_ref().map(|b| b.id())
    }

    /// Buffer id and host write generation; changes whenever the contents
    /// are rewritten from the host.
    pub fn contents_key(&self) -> Result<(u64, u64)> {
        let buffer = self.memory()?;
        Ok((buffer.id(), buffer.generation()))
    }

    /// Change the logical shape, reusing the current buffer when it is large enough.
    pub fn resize(&mut self, shape: &[usize]) -> Result<()> {
        let needed = shape_size(shape);
        let fits = self
            .buffer
            .as_ref()
            .map(|b| b.len() >= needed)
            .unwrap_or(false);
        if !fits {
            self.buffer = None;
            let buffer = DeviceBuffer::allocate(&self.device, needed.max(1), &self.name)?;
            self.buffer = Some(Arc::new(buffer));
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Change the logical shape without touching memory.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<()> {
        if shape_size(shape) > self.capacity() {
            return Err(DispatchError::config(
                self.name.clone(),
                format!("cannot reshape to {:?}: capacity {}", shape, self.capacity()),
            ));
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    pub fn copy_from_host(&mut self, data: &[f32]) -> Result<()> {
        if data.len() > self.size() {
            return Err(DispatchError::config(
                self.name.clone(),
                format!("{} values do not fit shape {:?}", data.len(), self.shape),
            ));
        }
        self.mutable_memory()?.write(0, data)
    }

    /// Read the tensor back, waiting for all queued work that touches it.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        let size = self.size();
        self.memory()?.read(0, size)
    }

    /// Detach the backing buffer, leaving the tensor empty.
    pub fn take_buffer(&mut self) -> Option<Arc<DeviceBuffer>> {
        self.buffer.take()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("memory_type", &self.memory_type)
            .field("content_type", &self.content_type)
            .field("buffer", &self.buffer)
            .finish()
    }
}
