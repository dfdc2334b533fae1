use std::sync::Arc;

use kestrel_accelerate_api::{DeviceRef, KernelFuture, LaunchStats, Result};

use crate::autotune::{self, TunerOptions, TuningStore, WorkGroupTuner};
use crate::config::{self, RuntimeOptions};
use crate::scratch::ScratchAllocator;

/// Execution context handed to operators: device, tuner, scratch pool and
/// the future of the most recent operator run.
pub struct OpContext {
    device: DeviceRef,
    options: RuntimeOptions,
    tuner: WorkGroupTuner,
    scratch: ScratchAllocator,
    future: Option<KernelFuture>,
}

impl OpContext {
    /// Context on the process-wide tuning table. A configured tuning file is
    /// attached on first use and `KESTREL_TUNING` is applied to the tuning flag.
    pub fn new(device: DeviceRef, options: RuntimeOptions) -> Self {
        config::init_from_env();
        let store = autotune::global_store();
        if store.path().is_none() {
            if let Some(path) = options.tuning_file(&device.info().tag()) {
                if let Err(err) = store.attach(&path) {
                    log::warn!("tuning table {:?} not loaded: {err}", path);
                }
            }
        }
        Self::with_store(device, options, store)
    }

    pub fn with_store(device: DeviceRef, options: RuntimeOptions, store: Arc<TuningStore>) -> Self {
        let tuner = WorkGroupTuner::new(device.clone(), store, TunerOptions::from_runtime(&options));
        let scratch = ScratchAllocator::new(device.clone(), options.scratch_pool_limit);
        Self {
            device,
            options,
            tuner,
            scratch,
            future: None,
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn tuner(&self) -> &WorkGroupTuner {
        &self.tuner
    }

    pub fn tuner_mut(&mut self) -> &mut WorkGroupTuner {
        &mut self.tuner
    }

    pub fn scratch(&self) -> &ScratchAllocator {
        &self.scratch
    }

    /// Attach the future of the current operator; a pending future is merged with it.
    pub fn set_future(&mut self, future: KernelFuture) {
        self.future = Some(match self.future.take() {
            Some(pending) => KernelFuture::merge(vec![pending, future]),
            None => future,
        });
    }

    pub fn take_future(&mut self) -> Option<KernelFuture> {
        self.future.take()
    }

    /// Wait for the attached future, if any.
    pub fn wait(&mut self) -> Result<LaunchStats> {
        match self.future.take() {
            Some(future) => future.wait(),
            None => Ok(LaunchStats::default()),
        }
    }
}
