//! Device-neutral types shared by the Kestrel dispatch engine and its backends.

use once_cell::sync::Lazy;
use std::sync::RwLock;

pub mod device;
pub mod error;
pub mod future;
pub mod geometry;
pub mod options;
pub mod tensor;
pub mod types;

pub use device::{
    Access, CompiledKernel, ComputeDevice, DeviceBuffer, DeviceRef, KernelArg, RawBuffer,
};
pub use error::{DispatchError, Result};
pub use future::{KernelFuture, LaunchStats, Poller};
pub use geometry::{round_up, Launch, LaunchGeometry, LocalWorkSize};
pub use options::{obfuscate_symbol, BuildOptions, KernelIdentity};
pub use tensor::{shape_size, Tensor};
pub use types::{
    apply_activation, Activation, ActivationType, BufferContentType, DataType, DeviceInfo,
    MemoryType,
};

static DEFAULT_DEVICE: Lazy<RwLock<Option<DeviceRef>>> = Lazy::new(|| RwLock::new(None));

/// Register the device used when callers do not pass one explicitly.
pub fn register_device(device: DeviceRef) {
    if let Ok(mut guard) = DEFAULT_DEVICE.write() {
        log::debug!("registered default compute device '{}'", device.info().name);
        *guard = Some(device);
    }
}

pub fn default_device() -> Option<DeviceRef> {
    DEFAULT_DEVICE.read().ok().and_then(|guard| guard.clone())
}

/// Clear the default device. Intended for tests.
pub fn clear_device() {
    if let Ok(mut guard) = DEFAULT_DEVICE.write() {
        *guard = None;
    }
}
