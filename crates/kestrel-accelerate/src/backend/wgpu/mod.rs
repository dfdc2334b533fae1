//! WebGPU compute device.
//!
//! Programs are generated as WGSL per build option set and compiled lazily
//! per work-group size, since WGSL fixes the work-group size in the module.

mod bindings;
pub mod shaders;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::channel::oneshot;
use kestrel_accelerate_api::{
    BuildOptions, CompiledKernel, ComputeDevice, DeviceInfo, DeviceRef, DispatchError, KernelArg,
    KernelFuture, Launch, LaunchStats, RawBuffer, Result,
};
use parking_lot::{Mutex, RwLock};
use wgpu::util::DeviceExt;

use shaders::{ShaderSpec, OFFSET_WORDS};

const ADDRESS_ALIGNMENT: u64 = 256;
const BASE_ADDRESS: u64 = 0x1000;
const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

#[derive(Debug, Clone)]
pub struct WgpuDeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for WgpuDeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

struct Allocation {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
}

struct WgpuKernel {
    name: String,
    spec: ShaderSpec,
    layout: wgpu::BindGroupLayout,
    pipelines: Mutex<HashMap<[u32; 3], Arc<wgpu::ComputePipeline>>>,
}

pub struct WgpuDevice {
    info: DeviceInfo,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: RwLock<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    next_address: AtomicU64,
    kernels: Mutex<HashMap<u64, Arc<WgpuKernel>>>,
    next_kernel: AtomicU64,
}

impl WgpuDevice {
    pub fn new(options: WgpuDeviceOptions) -> Result<Self> {
        pollster::block_on(Self::new_async(options))
    }

    pub async fn new_async(options: WgpuDeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| DispatchError::device("wgpu: no compatible adapter found"))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("kestrel-wgpu-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                },
                None,
            )
            .await
            .map_err(|err| DispatchError::device(format!("wgpu: request_device failed: {err}")))?;
        let max_wg = limits.max_compute_invocations_per_workgroup.max(1);
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("wgpu-{:?}", adapter_info.backend).to_ascii_lowercase(),
            max_work_group_size: max_wg,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            non_uniform_work_groups: false,
            supports_f16: false,
            memory_bytes: None,
        };
        log::info!(
            "wgpu: using adapter '{}' ({:?}), max work-group size {}",
            adapter_info.name,
            adapter_info.backend,
            max_wg
        );
        Ok(Self {
            info,
            device: Arc::new(device),
            queue: Arc::new(queue),
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(BASE_ADDRESS),
            kernels: Mutex::new(HashMap::new()),
            next_kernel: AtomicU64::new(1),
        })
    }

    pub fn shared() -> Result<DeviceRef> {
        Ok(Arc::new(Self::new(WgpuDeviceOptions::default())?))
    }

    pub fn shared_with(options: WgpuDeviceOptions) -> Result<DeviceRef> {
        Ok(Arc::new(Self::new(options)?))
    }

    fn allocation(&self, id: u64) -> Result<(Arc<wgpu::Buffer>, usize)> {
        self.buffers
            .read()
            .get(&id)
            .map(|a| (a.buffer.clone(), a.len))
            .ok_or_else(|| DispatchError::device(format!("unknown buffer #{id}")))
    }

    /// Compile `kernel` for one work-group size, surfacing validation errors.
    fn pipeline(&self, kernel: &WgpuKernel, local: [u32; 3]) -> Result<Arc<wgpu::ComputePipeline>> {
        if let Some(pipeline) = kernel.pipelines.lock().get(&local) {
            return Ok(pipeline.clone());
        }
        let source = kernel.spec.source(local);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&kernel.name),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&kernel.name),
                bind_group_layouts: &[&kernel.layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&kernel.name),
                layout: Some(&layout),
                module: &module,
                entry_point: "main",
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(DispatchError::device(format!("{}: {err}", kernel.name)));
        }
        let pipeline = Arc::new(pipeline);
        log::trace!("wgpu: compiled '{}' for local {:?}", kernel.name, local);
        kernel.pipelines.lock().insert(local, pipeline.clone());
        Ok(pipeline)
    }

    fn submit(&self, kernel: &CompiledKernel, args: &[KernelArg], launch: &Launch) -> Result<KernelFuture> {
        let entry = self
            .kernels
            .lock()
            .get(&kernel.id)
            .cloned()
            .ok_or_else(|| DispatchError::device(format!("unknown kernel '{}'", kernel.name)))?;
        let local_total: u64 = launch.local.iter().map(|&v| v as u64).product();
        if local_total == 0 || local_total > self.info.max_work_group_size as u64 {
            return Err(DispatchError::device(format!(
                "{}: local size {:?} exceeds max work-group size {}",
                entry.name, launch.local, self.info.max_work_group_size
            )));
        }
        let pipeline = self.pipeline(&entry, launch.local)?;

        let mut words: Vec<u32> = Vec::with_capacity(OFFSET_WORDS + args.len());
        words.extend_from_slice(&launch.offset);
        let mut tensors = Vec::new();
        for arg in args {
            match arg {
                KernelArg::Buffer { buffer, .. } => tensors.push(self.allocation(buffer.id())?.0),
                KernelArg::U32(v) => words.push(*v),
                KernelArg::I32(v) => words.push(*v as u32),
                KernelArg::F32(v) => words.push(v.to_bits()),
            }
        }
        let expected = entry.spec.buffers + entry.spec.guarded as usize;
        if tensors.len() != expected {
            return Err(DispatchError::device(format!(
                "{}: expected {expected} buffer arguments, got {}",
                entry.name,
                tensors.len()
            )));
        }
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kestrel-kernel-params"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let mut entries = Vec::with_capacity(tensors.len() + 1);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        });
        for (i, buffer) in tensors.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&entry.name),
            layout: &entry.layout,
            entries: &entries,
        });

        let groups = launch.work_groups();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&entry.name),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&entry.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        let started = Instant::now();
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = oneshot::channel();
        let name = entry.name.clone();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(Ok(LaunchStats::single(name, started.elapsed())));
        });
        let device = self.device.clone();
        Ok(KernelFuture::from_receiver(rx, &kernel.name).with_poller(Arc::new(move || {
            device.poll(wgpu::Maintain::Wait);
        })))
    }
}

impl ComputeDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, len: usize, label: &str) -> Result<RawBuffer> {
        let bytes = len.max(1) as u64 * F32_BYTES;
        if bytes > self.device.limits().max_storage_buffer_binding_size as u64 {
            return Err(DispatchError::OutOfMemory {
                requested: bytes,
                available: self.device.limits().max_storage_buffer_binding_size as u64,
            });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let span = bytes.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let address = self.next_address.fetch_add(span, Ordering::Relaxed);
        self.buffers.write().insert(
            id,
            Allocation {
                buffer: Arc::new(buffer),
                len: len.max(1),
            },
        );
        log::trace!("wgpu: allocate #{id} '{label}' len={len}");
        Ok(RawBuffer { id, address })
    }

    fn free(&self, id: u64) {
        if let Some(allocation) = self.buffers.write().remove(&id) {
            allocation.buffer.destroy();
            log::trace!("wgpu: free #{id}");
        }
    }

    fn write(&self, id: u64, offset: usize, data: &[f32]) -> Result<()> {
        let (buffer, len) = self.allocation(id)?;
        let end = (offset + data.len()).min(len);
        if offset < end {
            self.queue.write_buffer(
                &buffer,
                offset as u64 * F32_BYTES,
                bytemuck::cast_slice(&data[..end - offset]),
            );
        }
        Ok(())
    }

    fn read(&self, id: u64, offset: usize, len: usize) -> Result<Vec<f32>> {
        let (buffer, capacity) = self.allocation(id)?;
        let end = (offset + len).min(capacity);
        if offset >= end {
            return Ok(Vec::new());
        }
        let size = (end - offset) as u64 * F32_BYTES;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kestrel-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kestrel-readback"),
            });
        encoder.copy_buffer_to_buffer(&buffer, offset as u64 * F32_BYTES, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .map_err(|_| DispatchError::device("wgpu: map_async callback dropped"))?
            .map_err(|err| DispatchError::device(format!("wgpu: readback failed: {err}")))?;
        let out = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&data).to_vec()
        };
        staging.unmap();
        Ok(out)
    }

    fn build_kernel(
        &self,
        program: &str,
        kernel_name: &str,
        options: &BuildOptions,
    ) -> Result<CompiledKernel> {
        let defines = options.defines();
        if defines.get("DATA_TYPE").map(String::as_str) == Some("half") {
            return Err(DispatchError::build(
                program,
                kernel_name,
                "half precision is not supported by this device",
            ));
        }
        let spec = shaders::kernel_spec(program, kernel_name, &defines)
            .ok_or_else(|| DispatchError::build(program, kernel_name, "no such entry point"))?;
        let bindings = spec.buffers + spec.guarded as usize;
        let kernel = Arc::new(WgpuKernel {
            name: kernel_name.to_string(),
            layout: bindings::kernel_layout(&self.device, kernel_name, bindings),
            spec,
            pipelines: Mutex::new(HashMap::new()),
        });
        // Compile once up front so malformed sources fail at build time.
        self.pipeline(&kernel, [1, 1, 1])
            .map_err(|err| DispatchError::build(program, kernel_name, err.to_string()))?;
        let id = self.next_kernel.fetch_add(1, Ordering::Relaxed);
        self.kernels.lock().insert(id, kernel);
        Ok(CompiledKernel {
            id,
            program: program.to_string(),
            name: kernel_name.to_string(),
            max_work_group_size: self.info.max_work_group_size,
        })
    }

    fn enqueue(&self, kernel: &CompiledKernel, args: &[KernelArg], launch: &Launch) -> KernelFuture {
        match self.submit(kernel, args, launch) {
            Ok(future) => future,
            Err(err) => KernelFuture::failed(err),
        }
    }

    fn finish(&self) -> Result<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
