use std::sync::Arc;

use kestrel_accelerate_api::{DispatchError, KernelArg, KernelFuture, LocalWorkSize, Result};

use crate::autotune::TuneRequest;
use crate::bounds::OutOfRangeGuard;
use crate::cache::{KernelCache, KernelHandle, KernelRequest};
use crate::context::OpContext;

/// What the bound arguments of a slot were derived from.
///
/// Arguments are rebuilt when the input shape or the identity of any bound
/// buffer changes, so a reused slot never launches with a stale buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSignature {
    pub shape: Vec<usize>,
    pub buffers: Vec<u64>,
    pub global: Vec<u32>,
}

impl BindingSignature {
    pub fn new(shape: &[usize], buffers: Vec<u64>, global: &[u32]) -> Self {
        Self {
            shape: shape.to_vec(),
            buffers,
            global: global.to_vec(),
        }
    }
}

/// One kernel of an operator: its cache, bounds guard and bound arguments.
///
/// Argument layout is `[global sizes as u32..., kernel args..., guard]`, the
/// guard only present when the out-of-range check is enabled.
#[derive(Default)]
pub struct KernelSlot {
    cache: KernelCache,
    handle: Option<Arc<KernelHandle>>,
    guard: OutOfRangeGuard,
    signature: Option<BindingSignature>,
    args: Vec<KernelArg>,
    rebinds: u64,
}

impl KernelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or fetch) the kernel with the context's device-dependent options.
    pub fn ensure(&mut self, ctx: &OpContext, mut request: KernelRequest) -> Result<Arc<KernelHandle>> {
        let check = ctx.options().out_of_range_check;
        if self.guard.is_enabled() != check {
            self.guard = OutOfRangeGuard::new(check);
            self.signature = None;
        }
        request
            .options
            .non_uniform_work_group(ctx.device().info().non_uniform_work_groups);
        self.guard.configure(&mut request.options);
        self.guard.reset(ctx.device())?;
        request.obfuscate = request.obfuscate && ctx.options().obfuscate_kernels;
        let handle = self.cache.ensure(ctx.device(), &request)?;
        if !self
            .handle
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            self.signature = None;
        }
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Rebuild the bound arguments when `signature` differs from the last binding.
    /// Returns whether a rebind happened.
    pub fn bind<F>(&mut self, signature: BindingSignature, build: F) -> Result<bool>
    where
        F: FnOnce() -> Result<Vec<KernelArg>>,
    {
        if self.signature.as_ref() == Some(&signature) {
            return Ok(false);
        }
        let mut args: Vec<KernelArg> = signature.global.iter().map(|&g| KernelArg::U32(g)).collect();
        args.extend(build()?);
        if let Some(guard) = self.guard.arg() {
            args.push(guard);
        }
        log::trace!(
            "kernel_slot: bound {} args for shape {:?}",
            args.len(),
            signature.shape
        );
        self.args = args;
        self.signature = Some(signature);
        self.rebinds += 1;
        Ok(true)
    }

    /// Reset the guard, resolve geometry for `key`, launch and validate.
    pub fn run(
        &mut self,
        ctx: &OpContext,
        key: &str,
        default_lws: LocalWorkSize,
    ) -> Result<KernelFuture> {
        let handle = self.handle.clone().ok_or_else(|| {
            DispatchError::config(key, "kernel slot used before ensure")
        })?;
        let signature = self.signature.clone().ok_or_else(|| {
            DispatchError::config(key, "kernel slot used before bind")
        })?;
        self.guard.reset(ctx.device())?;
        let request = TuneRequest {
            key,
            kernel: &handle,
            args: &self.args,
            global: &signature.global,
            default_lws,
        };
        let (geometry, future) = ctx.tuner().resolve(&request)?;
        log::trace!(
            "kernel_slot: {} launched {:?} local {:?}",
            key,
            geometry.global,
            geometry.local.size
        );
        self.guard.validate(&handle.kernel.name, future)
    }

    pub fn handle(&self) -> Option<&Arc<KernelHandle>> {
        self.handle.as_ref()
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn guard_enabled(&self) -> bool {
        self.guard.is_enabled()
    }

    /// How many times the arguments were (re)bound.
    pub fn rebinds(&self) -> u64 {
        self.rebinds
    }
}
