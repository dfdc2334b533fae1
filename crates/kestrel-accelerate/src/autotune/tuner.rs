use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kestrel_accelerate_api::{
    CompiledKernel, DeviceRef, DispatchError, KernelArg, KernelFuture, Launch, LaunchGeometry,
    LocalWorkSize, Result,
};

use super::TuningStore;
use crate::cache::KernelHandle;
use crate::config::{self, RuntimeOptions};
use crate::metrics;

/// Cache-size derived base used by the default 3D heuristic.
const DEFAULT_3D_BASE: u32 = 4;

#[derive(Debug, Clone)]
pub struct TunerOptions {
    /// `None` follows the process-wide tuning flag.
    pub tuning: Option<bool>,
    pub repetitions: u32,
    pub noise_tolerance: f64,
    pub max_items_per_launch: Option<u64>,
}

impl Default for TunerOptions {
    fn default() -> Self {
        Self {
            tuning: None,
            repetitions: config::DEFAULT_TUNING_REPETITIONS,
            noise_tolerance: 0.05,
            max_items_per_launch: None,
        }
    }
}

impl TunerOptions {
    pub fn from_runtime(opts: &RuntimeOptions) -> Self {
        Self {
            tuning: opts.tuning.then_some(true),
            repetitions: opts.tuning_repetitions.max(1),
            noise_tolerance: opts.tuning_noise_tolerance.max(0.0),
            max_items_per_launch: opts.max_items_per_launch,
        }
    }

    pub fn tuning_enabled(&self) -> bool {
        self.tuning.unwrap_or_else(config::tuning_mode)
    }
}

/// One kernel launch to resolve.
pub struct TuneRequest<'a> {
    pub key: &'a str,
    pub kernel: &'a KernelHandle,
    pub args: &'a [KernelArg],
    /// True global size (2 or 3 dimensions).
    pub global: &'a [u32],
    pub default_lws: LocalWorkSize,
}

/// 2D local-size candidates derived from the kernel's max work-group size.
pub fn candidates_2d(kwg: u32) -> Vec<LocalWorkSize> {
    let kwg = kwg.max(1);
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let splits = [2u32, 4, 8, 16, 32, 64, 128, 256];
    let raw = splits
        .iter()
        .map(|&y| (kwg / y, y))
        .chain([(kwg, 1), (1, kwg)]);
    for (x, y) in raw {
        if x == 0 || y == 0 || (x as u64) * (y as u64) > kwg as u64 {
            continue;
        }
        let lws = LocalWorkSize::new_2d(x, y);
        if seen.insert(lws) {
            out.push(lws);
        }
    }
    out
}

/// 3D candidates, clamped to the global size and deduplicated in enumeration order.
pub fn candidates_3d(kwg: u32, global: [u32; 3]) -> Vec<LocalWorkSize> {
    let kwg = kwg.max(1);
    let raw = [
        [kwg / 64, 8, 8],
        [kwg / 32, 4, 8],
        [kwg / 16, 4, 4],
        [kwg / 8, 2, 4],
        [kwg / 4, 2, 2],
        [kwg / 2, 1, 2],
        [kwg, 1, 1],
        [1, kwg / 8, 8],
        [4, kwg / 32, 8],
        [1, kwg, 1],
        [1, 1, kwg],
        [4, 15, 8],
    ];
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for cand in raw {
        if cand.iter().any(|&v| v == 0) {
            continue;
        }
        let clamped = [
            cand[0].min(global[0].max(1)),
            cand[1].min(global[1].max(1)),
            cand[2].min(global[2].max(1)),
        ];
        let total: u64 = clamped.iter().map(|&v| v as u64).product();
        if total > kwg as u64 {
            continue;
        }
        let lws = LocalWorkSize::new_3d(clamped[0], clamped[1], clamped[2]);
        if seen.insert(lws) {
            out.push(lws);
        }
    }
    out
}

/// Default 2D local size `(kwg / inner, inner)`, shrunk to fit small kernels.
pub fn default_lws_2d(kwg: u32, inner: u32) -> LocalWorkSize {
    let kwg = kwg.max(1);
    let y = inner.clamp(1, kwg);
    LocalWorkSize::new_2d((kwg / y).max(1), y)
}

/// Default 3D local size: fill the second axis first, then the third, then the first.
pub fn default_lws_3d(global: [u32; 3], kwg: u32) -> LocalWorkSize {
    if kwg == 0 {
        return LocalWorkSize::new_3d(1, 1, 1);
    }
    let y = global[1].clamp(1, kwg);
    let z = global[2].min(DEFAULT_3D_BASE).min(kwg / y).max(1);
    let x = DEFAULT_3D_BASE.min(kwg / (y * z)).max(1);
    LocalWorkSize::new_3d(x, y, z)
}

/// Index of the fastest candidate. A later candidate only wins when it beats
/// the current best by more than `noise_tolerance` (relative).
pub fn select_best(timings: &[(LocalWorkSize, Duration)], noise_tolerance: f64) -> Option<usize> {
    let mut best: Option<(usize, Duration)> = None;
    for (idx, (_, elapsed)) in timings.iter().enumerate() {
        match best {
            None => best = Some((idx, *elapsed)),
            Some((_, best_time)) => {
                let threshold = best_time.as_secs_f64() * (1.0 - noise_tolerance);
                if elapsed.as_secs_f64() < threshold {
                    best = Some((idx, *elapsed));
                }
            }
        }
    }
    best.map(|(idx, _)| idx)
}

/// Resolves launch geometry per tuning key and launches kernels with it.
pub struct WorkGroupTuner {
    device: DeviceRef,
    store: Arc<TuningStore>,
    options: TunerOptions,
}

impl WorkGroupTuner {
    pub fn new(device: DeviceRef, store: Arc<TuningStore>, options: TunerOptions) -> Self {
        Self {
            device,
            store,
            options,
        }
    }

    pub fn store(&self) -> &Arc<TuningStore> {
        &self.store
    }

    pub fn options(&self) -> &TunerOptions {
        &self.options
    }

    pub fn set_tuning(&mut self, tuning: Option<bool>) {
        self.options.tuning = tuning;
    }

    /// Tune (tuning mode) or replay the stored geometry, then launch once.
    pub fn resolve(&self, req: &TuneRequest<'_>) -> Result<(LaunchGeometry, KernelFuture)> {
        if req.global.is_empty() || req.global.len() > 3 {
            return Err(DispatchError::config(
                req.key,
                format!("unsupported global work size {:?}", req.global),
            ));
        }
        let lws = if self.options.tuning_enabled() {
            let lock = self.store.key_lock(req.key);
            let _serialized = lock.lock();
            let best = self.tune(req)?;
            self.store.insert(req.key, best);
            best
        } else {
            self.store.get(req.key).unwrap_or(req.default_lws)
        };
        let geometry = LaunchGeometry::new(req.global, sanitize(lws));
        let future = self.launch(&req.kernel.kernel, req.args, &geometry);
        Ok((geometry, future))
    }

    fn tune(&self, req: &TuneRequest<'_>) -> Result<LocalWorkSize> {
        let span = tracing::info_span!("kernel.tune", key = req.key);
        let _enter = span.enter();
        let kwg = req.kernel.max_work_group_size;
        let candidates = if req.global.len() == 3 {
            candidates_3d(kwg, [req.global[0], req.global[1], req.global[2]])
        } else {
            candidates_2d(kwg)
        };
        let mut timings = Vec::with_capacity(candidates.len());
        let mut last_err = None;
        for lws in candidates {
            let geometry = LaunchGeometry::new(req.global, lws);
            match self.time_candidate(&req.kernel.kernel, req.args, &geometry) {
                Ok(elapsed) => {
                    log::trace!("tuning {}: {:?} took {:?}", req.key, lws.size, elapsed);
                    timings.push((lws, elapsed));
                }
                Err(err) => {
                    log::debug!("tuning {}: candidate {:?} failed: {err}", req.key, lws.size);
                    last_err = Some(err);
                }
            }
        }
        metrics::global().inc_tuning_run();
        match select_best(&timings, self.options.noise_tolerance) {
            Some(idx) => {
                let (best, elapsed) = timings[idx];
                log::info!(
                    "tuned {}: local work size {:?} ({:?} over {} candidates)",
                    req.key,
                    best.size,
                    elapsed,
                    timings.len()
                );
                Ok(best)
            }
            None => Err(last_err.unwrap_or_else(|| {
                DispatchError::config(req.key, "no local work size candidates")
            })),
        }
    }

    fn time_candidate(
        &self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        geometry: &LaunchGeometry,
    ) -> Result<Duration> {
        let mut best: Option<Duration> = None;
        for _ in 0..self.options.repetitions.max(1) {
            let start = Instant::now();
            self.launch(kernel, args, geometry).wait()?;
            let elapsed = start.elapsed();
            if best.is_none_or(|t| elapsed < t) {
                best = Some(elapsed);
            }
        }
        Ok(best.unwrap_or_default())
    }

    /// Enqueue `kernel` with `geometry`, splitting the last dimension into blocks if requested.
    pub fn launch(
        &self,
        kernel: &CompiledKernel,
        args: &[KernelArg],
        geometry: &LaunchGeometry,
    ) -> KernelFuture {
        let span = tracing::trace_span!("kernel.dispatch", kernel = %kernel.name);
        let _enter = span.enter();
        let launches = self.plan(geometry);
        metrics::global().add_launches(launches.len() as u64);
        let futures = launches
            .iter()
            .map(|launch| self.device.enqueue(kernel, args, launch))
            .collect();
        KernelFuture::merge(futures)
    }

    /// Split a geometry into submissions.
    pub fn plan(&self, geometry: &LaunchGeometry) -> Vec<Launch> {
        let dims = geometry.dims.clamp(1, 3) as usize;
        let global = if self.device.info().non_uniform_work_groups {
            geometry.global
        } else {
            geometry.rounded_global()
        };
        let local = geometry.local.size;
        let last = dims - 1;
        let groups_last = global[last].div_ceil(local[last].max(1)).max(1);

        let requested = if geometry.local.blocks > 0 {
            geometry.local.blocks as u64
        } else if let Some(budget) = self.options.max_items_per_launch {
            let total: u64 = global.iter().map(|&v| v as u64).product();
            total.div_ceil(budget.max(1))
        } else {
            1
        };
        let blocks = requested.clamp(1, groups_last as u64) as u32;
        let block_len = groups_last.div_ceil(blocks) * local[last].max(1);

        let mut launches = Vec::with_capacity(blocks as usize);
        let mut offset = 0u32;
        while offset < global[last] {
            let mut block_global = global;
            block_global[last] = block_len.min(global[last] - offset);
            let mut block_offset = [0u32; 3];
            block_offset[last] = offset;
            launches.push(Launch {
                global: block_global,
                local,
                offset: block_offset,
                dims: dims as u8,
            });
            offset += block_len;
        }
        if launches.is_empty() {
            launches.push(Launch {
                global,
                local,
                offset: [0; 3],
                dims: dims as u8,
            });
        }
        launches
    }
}

fn sanitize(lws: LocalWorkSize) -> LocalWorkSize {
    LocalWorkSize {
        size: lws.size.map(|v| v.max(1)),
        blocks: lws.blocks,
    }
}
