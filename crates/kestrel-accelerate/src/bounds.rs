use std::sync::Arc;

use kestrel_accelerate_api::{
    BuildOptions, DeviceBuffer, DeviceRef, DispatchError, KernelArg, KernelFuture, Result,
};

/// Optional out-of-range guard bound as the trailing kernel argument.
///
/// Kernels built with `-DOUT_OF_RANGE_CHECK` set the guard's single element
/// to a non-zero value instead of touching memory outside their buffers.
/// When disabled every method is a no-op.
#[derive(Debug, Default)]
pub struct OutOfRangeGuard {
    enabled: bool,
    buffer: Option<Arc<DeviceBuffer>>,
}

impl OutOfRangeGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            buffer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn configure(&self, options: &mut BuildOptions) {
        options.out_of_range_check(self.enabled);
    }

    /// Allocate the guard on first use and clear it before a launch.
    pub fn reset(&mut self, device: &DeviceRef) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let buffer = match &self.buffer {
            Some(buffer) => buffer.clone(),
            None => {
                let buffer = Arc::new(DeviceBuffer::allocate(device, 1, "out_of_range_guard")?);
                self.buffer = Some(buffer.clone());
                buffer
            }
        };
        buffer.write(0, &[0.0])
    }

    pub fn arg(&self) -> Option<KernelArg> {
        self.buffer.as_ref().map(KernelArg::write)
    }

    /// Wait for `future` and check the guard. Disabled guards pass the future through.
    pub fn validate(&self, kernel: &str, future: KernelFuture) -> Result<KernelFuture> {
        let Some(buffer) = self.buffer.as_ref().filter(|_| self.enabled) else {
            return Ok(future);
        };
        let stats = future.wait()?;
        let flag = buffer.read(0, 1)?;
        if flag.first().is_some_and(|v| v.to_bits() != 0) {
            log::error!("out of range access detected in kernel '{kernel}'");
            return Err(DispatchError::OutOfRange {
                kernel: kernel.to_string(),
            });
        }
        Ok(KernelFuture::ready(stats))
    }
}
