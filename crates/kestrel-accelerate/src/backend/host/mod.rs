//! In-process compute device.
//!
//! Buffers live in host memory and kernels are Rust functions executed per
//! work item on a dedicated queue thread, in submission order.

mod invocation;
pub mod programs;

pub use invocation::{HostInvocation, KernelDefines};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use futures::channel::oneshot;
use kestrel_accelerate_api::{
    BuildOptions, CompiledKernel, ComputeDevice, DeviceInfo, DeviceRef, DispatchError,
    KernelArg, KernelFuture, Launch, LaunchStats, RawBuffer, Result,
};
use parking_lot::{Mutex, RwLock};

use invocation::{ResolvedArg, Storage};
use programs::HostKernelDef;

pub const DEFAULT_MAX_WORK_GROUP_SIZE: u32 = 256;
const ADDRESS_ALIGNMENT: u64 = 256;
const BASE_ADDRESS: u64 = 0x1000;

#[derive(Debug, Clone)]
pub struct HostDeviceOptions {
    pub name: String,
    pub max_work_group_size: u32,
    pub non_uniform_work_groups: bool,
    /// Total allocation budget in bytes.
    pub memory_limit: Option<u64>,
}

impl Default for HostDeviceOptions {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
            non_uniform_work_groups: false,
            memory_limit: None,
        }
    }
}

struct Allocation {
    storage: Storage,
    bytes: u64,
}

#[derive(Default)]
struct HostState {
    buffers: RwLock<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    next_address: AtomicU64,
    allocated_bytes: AtomicU64,
}

struct HostKernel {
    name: String,
    def: &'static HostKernelDef,
    defines: KernelDefines,
    guarded: bool,
}

enum Job {
    Write {
        storage: Storage,
        offset: usize,
        data: Vec<f32>,
    },
    Read {
        storage: Storage,
        offset: usize,
        len: usize,
        done: oneshot::Sender<Vec<f32>>,
    },
    Launch {
        kernel: Arc<HostKernel>,
        args: Vec<ResolvedArg>,
        storage: Vec<Storage>,
        launch: Launch,
        done: oneshot::Sender<Result<LaunchStats>>,
    },
    Barrier {
        done: oneshot::Sender<()>,
    },
}

pub struct HostDevice {
    info: DeviceInfo,
    state: Arc<HostState>,
    memory_limit: Option<u64>,
    kernels: Mutex<HashMap<u64, Arc<HostKernel>>>,
    next_kernel: AtomicU64,
    queue: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl HostDevice {
    pub fn new(options: HostDeviceOptions) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("kestrel-host-queue".to_string())
            .spawn(move || run_queue(rx))
            .map_err(|err| DispatchError::device(format!("failed to start host queue: {err}")))?;
        let max_wg = options.max_work_group_size.max(1);
        let info = DeviceInfo {
            name: options.name,
            backend: "host".to_string(),
            max_work_group_size: max_wg,
            max_work_item_sizes: [max_wg; 3],
            non_uniform_work_groups: options.non_uniform_work_groups,
            supports_f16: false,
            memory_bytes: options.memory_limit,
        };
        let state = HostState {
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(BASE_ADDRESS),
            ..Default::default()
        };
        Ok(Self {
            info,
            state: Arc::new(state),
            memory_limit: options.memory_limit,
            kernels: Mutex::new(HashMap::new()),
            next_kernel: AtomicU64::new(1),
            queue: Some(tx),
            worker: Some(worker),
        })
    }

    /// Shared handle with default options.
    pub fn shared() -> Result<DeviceRef> {
        Ok(Arc::new(Self::new(HostDeviceOptions::default())?))
    }

    pub fn shared_with(options: HostDeviceOptions) -> Result<DeviceRef> {
        Ok(Arc::new(Self::new(options)?))
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.state.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        self.state.buffers.read().len()
    }

    fn storage(&self, id: u64) -> Result<Storage> {
        self.state
            .buffers
            .read()
            .get(&id)
            .map(|a| a.storage.clone())
            .ok_or_else(|| DispatchError::device(format!("unknown buffer #{id}")))
    }

    fn submit(&self, job: Job) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| DispatchError::device("host queue is shut down"))?;
        queue
            .send(job)
            .map_err(|_| DispatchError::device("host queue is shut down"))
    }

    fn check_launch(&self, kernel: &HostKernel, launch: &Launch) -> Result<()> {
        let local_total: u64 = launch.local.iter().map(|&v| v as u64).product();
        let limit = kernel.def.max_work_group_size.min(self.info.max_work_group_size);
        if local_total == 0 || local_total > limit as u64 {
            return Err(DispatchError::device(format!(
                "{}: local size {:?} exceeds max work-group size {limit}",
                kernel.name, launch.local
            )));
        }
        if !self.info.non_uniform_work_groups {
            for axis in 0..3 {
                if launch.global[axis] % launch.local[axis].max(1) != 0 {
                    return Err(DispatchError::device(format!(
                        "{}: global size {:?} is not a multiple of local size {:?}",
                        kernel.name, launch.global, launch.local
                    )));
                }
            }
        }
        Ok(())
    }

    fn prepare_launch(
        &self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        launch: &Launch,
    ) -> Result<(Arc<HostKernel>, Vec<ResolvedArg>, Vec<Storage>)> {
        let host_kernel = self
            .kernels
            .lock()
            .get(&kernel.id)
            .cloned()
            .ok_or_else(|| DispatchError::device(format!("unknown kernel '{}'", kernel.name)))?;
        self.check_launch(&host_kernel, launch)?;
        let mut slots: HashMap<u64, usize> = HashMap::new();
        let mut storage = Vec::new();
        let mut resolved = Vec::with_capacity(args.len());
        for arg in args {
            resolved.push(match arg {
                KernelArg::Buffer { buffer, .. } => {
                    let slot = match slots.get(&buffer.id()) {
                        Some(slot) => *slot,
                        None => {
                            storage.push(self.storage(buffer.id())?);
                            slots.insert(buffer.id(), storage.len() - 1);
                            storage.len() - 1
                        }
                    };
                    ResolvedArg::Buffer(slot)
                }
                KernelArg::U32(v) => ResolvedArg::U32(*v),
                KernelArg::I32(v) => ResolvedArg::I32(*v),
                KernelArg::F32(v) => ResolvedArg::F32(*v),
            });
        }
        Ok((host_kernel, resolved, storage))
    }
}

impl ComputeDevice for HostDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, len: usize, label: &str) -> Result<RawBuffer> {
        let bytes = (len.max(1) * std::mem::size_of::<f32>()) as u64;
        if let Some(limit) = self.memory_limit {
            let used = self.state.allocated_bytes.load(Ordering::Relaxed);
            if used + bytes > limit {
                return Err(DispatchError::OutOfMemory {
                    requested: bytes,
                    available: limit.saturating_sub(used),
                });
            }
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let span = bytes.div_ceil(ADDRESS_ALIGNMENT) * ADDRESS_ALIGNMENT;
        let address = self.state.next_address.fetch_add(span, Ordering::Relaxed);
        self.state.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.state.buffers.write().insert(
            id,
            Allocation {
                storage: Arc::new(Mutex::new(vec![0.0; len.max(1)])),
                bytes,
            },
        );
        log::trace!("host: allocate #{id} '{label}' len={len} addr={address:#x}");
        Ok(RawBuffer { id, address })
    }

    fn free(&self, id: u64) {
        if let Some(allocation) = self.state.buffers.write().remove(&id) {
            self.state
                .allocated_bytes
                .fetch_sub(allocation.bytes, Ordering::Relaxed);
            log::trace!("host: free #{id}");
        }
    }

    fn write(&self, id: u64, offset: usize, data: &[f32]) -> Result<()> {
        let storage = self.storage(id)?;
        self.submit(Job::Write {
            storage,
            offset,
            data: data.to_vec(),
        })
    }

    fn read(&self, id: u64, offset: usize, len: usize) -> Result<Vec<f32>> {
        let storage = self.storage(id)?;
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Read {
            storage,
            offset,
            len,
            done: tx,
        })?;
        pollster::block_on(rx).map_err(|_| DispatchError::device("host queue dropped a read"))
    }

    fn build_kernel(
        &self,
        program: &str,
        kernel_name: &str,
        options: &BuildOptions,
    ) -> Result<CompiledKernel> {
        let defines = options.defines();
        if defines.get("DATA_TYPE").map(String::as_str) == Some("half") && !self.info.supports_f16 {
            return Err(DispatchError::build(
                program,
                kernel_name,
                "half precision is not supported by this device",
            ));
        }
        let table = programs::lookup(program).ok_or_else(|| {
            DispatchError::build(program, kernel_name, "unknown program")
        })?;
        let def = table
            .iter()
            .find(|def| {
                defines
                    .get(def.name)
                    .filter(|renamed| !renamed.is_empty())
                    .map(String::as_str)
                    .unwrap_or(def.name)
                    == kernel_name
            })
            .ok_or_else(|| DispatchError::build(program, kernel_name, "no such entry point"))?;
        let guarded = defines.contains_key(kestrel_accelerate_api::options::OUT_OF_RANGE_CHECK);
        let id = self.next_kernel.fetch_add(1, Ordering::Relaxed);
        let max_work_group_size = def.max_work_group_size.min(self.info.max_work_group_size);
        self.kernels.lock().insert(
            id,
            Arc::new(HostKernel {
                name: kernel_name.to_string(),
                def,
                defines: KernelDefines::new(defines),
                guarded,
            }),
        );
        Ok(CompiledKernel {
            id,
            program: program.to_string(),
            name: kernel_name.to_string(),
            max_work_group_size,
        })
    }

    fn enqueue(&self, kernel: &CompiledKernel, args: &[KernelArg], launch: &Launch) -> KernelFuture {
        let (host_kernel, resolved, storage) = match self.prepare_launch(kernel, args, launch) {
            Ok(parts) => parts,
            Err(err) => return KernelFuture::failed(err),
        };
        let (tx, rx) = oneshot::channel();
        let job = Job::Launch {
            kernel: host_kernel,
            args: resolved,
            storage,
            launch: *launch,
            done: tx,
        };
        if let Err(err) = self.submit(job) {
            return KernelFuture::failed(err);
        }
        KernelFuture::from_receiver(rx, &kernel.name)
    }

    fn finish(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Job::Barrier { done: tx })?;
        pollster::block_on(rx).map_err(|_| DispatchError::device("host queue dropped a barrier"))
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_queue(rx: mpsc::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Write {
                storage,
                offset,
                data,
            } => {
                let mut guard = storage.lock();
                let end = (offset + data.len()).min(guard.len());
                if offset < end {
                    guard[offset..end].copy_from_slice(&data[..end - offset]);
                }
            }
            Job::Read {
                storage,
                offset,
                len,
                done,
            } => {
                let guard = storage.lock();
                let end = (offset + len).min(guard.len());
                let out = if offset < end {
                    guard[offset..end].to_vec()
                } else {
                    Vec::new()
                };
                let _ = done.send(out);
            }
            Job::Launch {
                kernel,
                args,
                storage,
                launch,
                done,
            } => {
                let _ = done.send(execute(&kernel, &args, &storage, &launch));
            }
            Job::Barrier { done } => {
                let _ = done.send(());
            }
        }
    }
}

fn execute(
    kernel: &HostKernel,
    args: &[ResolvedArg],
    storage: &[Storage],
    launch: &Launch,
) -> Result<LaunchStats> {
    let started = Instant::now();
    let mut inv = HostInvocation::new(args, storage, &kernel.defines);
    let [ox, oy, oz] = launch.offset;
    for z in oz..oz + launch.global[2].max(1) {
        for y in oy..oy + launch.global[1].max(1) {
            for x in ox..ox + launch.global[0].max(1) {
                (kernel.def.entry)(&mut inv, [x, y, z]);
            }
        }
    }
    if let Some(err) = inv.take_error() {
        return Err(DispatchError::device(format!("{}: {err}", kernel.name)));
    }
    if inv.violation() {
        if kernel.guarded {
            inv.raise_guard();
        } else {
            log::warn!(
                "{}: out of range access suppressed (bounds check disabled)",
                kernel.name
            );
        }
    }
    Ok(LaunchStats::single(kernel.name.clone(), started.elapsed()))
}
