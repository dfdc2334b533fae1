use std::collections::HashMap;
use std::sync::Arc;

use kestrel_accelerate_api::{
    obfuscate_symbol, BuildOptions, CompiledKernel, DeviceRef, KernelIdentity, Result,
};

use crate::metrics;

/// Kernel to build: program, unobfuscated entry point and caller options.
#[derive(Debug, Clone)]
pub struct KernelRequest {
    pub program: String,
    pub kernel: String,
    pub options: BuildOptions,
    pub obfuscate: bool,
}

impl KernelRequest {
    pub fn new(program: &str, kernel: &str) -> Self {
        Self {
            program: program.to_string(),
            kernel: kernel.to_string(),
            options: BuildOptions::new(),
            obfuscate: true,
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn obfuscate(mut self, enabled: bool) -> Self {
        self.obfuscate = enabled;
        self
    }

    /// Final identity: the symbol rename is part of the option set.
    pub fn identity(&self) -> KernelIdentity {
        let mut options = self.options.clone();
        let kernel_name = if self.obfuscate {
            let renamed = obfuscate_symbol(&self.kernel);
            options.define_symbol(&self.kernel, &renamed);
            renamed
        } else {
            self.kernel.clone()
        };
        KernelIdentity::new(self.program.clone(), kernel_name, options)
    }
}

#[derive(Debug)]
pub struct KernelHandle {
    pub identity: KernelIdentity,
    pub kernel: CompiledKernel,
    /// Queried once after the build.
    pub max_work_group_size: u32,
}

/// Specialized kernels owned by one operator instance.
#[derive(Default)]
pub struct KernelCache {
    kernels: HashMap<KernelIdentity, Arc<KernelHandle>>,
    builds: u64,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled kernel for `request`, building it on first use.
    pub fn ensure(&mut self, device: &DeviceRef, request: &KernelRequest) -> Result<Arc<KernelHandle>> {
        let identity = request.identity();
        if let Some(handle) = self.kernels.get(&identity) {
            metrics::global().inc_hit();
            log::trace!("kernel_cache: hit {}", identity);
            return Ok(handle.clone());
        }
        metrics::global().inc_miss();
        let kernel = device.build_kernel(&identity.program, &identity.kernel_name, &identity.options)?;
        metrics::global().inc_build();
        self.builds += 1;
        log::debug!(
            "kernel_cache: built {} (max work-group size {})",
            identity,
            kernel.max_work_group_size
        );
        let handle = Arc::new(KernelHandle {
            max_work_group_size: kernel.max_work_group_size,
            identity: identity.clone(),
            kernel,
        });
        self.kernels.insert(identity, handle.clone());
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Builds performed by this cache.
    pub fn builds(&self) -> u64 {
        self.builds
    }
}
