//! Kernel dispatch engine: specialized kernel cache, work-group tuning,
//! scratch memory, the Winograd convolution pipeline and the operators
//! built on top of them.

pub mod autotune;
pub mod backend;
pub mod bounds;
pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod metrics;
pub mod net;
pub mod ops;
pub mod scratch;
pub mod winograd;

pub use autotune::{TuningStore, WorkGroupTuner};
pub use backend::host::{HostDevice, HostDeviceOptions};
pub use bounds::OutOfRangeGuard;
pub use cache::{KernelCache, KernelHandle, KernelRequest};
pub use config::RuntimeOptions;
pub use context::OpContext;
pub use dispatch::{BindingSignature, KernelSlot};
pub use net::{Net, Workspace};
pub use ops::{OpBuilder, OpDef, OpDefBuilder, OpRegistry, Operation};
pub use scratch::{ScratchAllocator, ScratchRequest, ScratchTensor};
pub use winograd::{WinogradBlock, WinogradConv, WinogradPlan};

use kestrel_accelerate_api::{DeviceRef, DispatchError, Result};
use serde::{Deserialize, Serialize};

pub const DEVICE_ENV: &str = "KESTREL_DEVICE";

/// Preferred compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Wgpu,
    Host,
}

impl DevicePreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            "host" | "cpu" | "in-process" => Some(Self::Host),
            _ => None,
        }
    }
}

/// Power preference used when initializing a WGPU adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    Auto,
    HighPerformance,
    LowPower,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceInitOptions {
    pub device: DevicePreference,
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    /// Fall back to the host device when the preferred device is unavailable.
    pub allow_host_fallback: bool,
    pub host_max_work_group_size: u32,
}

impl Default for DeviceInitOptions {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            power_preference: PowerPreference::Auto,
            force_fallback_adapter: false,
            allow_host_fallback: true,
            host_max_work_group_size: backend::host::DEFAULT_MAX_WORK_GROUP_SIZE,
        }
    }
}

impl DeviceInitOptions {
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(raw) = std::env::var(DEVICE_ENV) {
            match DevicePreference::parse(&raw) {
                Some(pref) => opts.device = pref,
                None => log::warn!("{DEVICE_ENV}={raw:?} not recognized; using auto"),
            }
        }
        opts
    }
}

/// Return the registered default device, creating and registering one
/// from `options` on first use.
pub fn initialize_device_with(options: &DeviceInitOptions) -> Result<DeviceRef> {
    if let Some(device) = kestrel_accelerate_api::default_device() {
        return Ok(device);
    }

    let preferred: Option<DeviceRef> = {
        #[cfg(feature = "wgpu")]
        {
            let mut device = None;
            if matches!(options.device, DevicePreference::Auto | DevicePreference::Wgpu) {
                let wgpu_options = backend::wgpu::WgpuDeviceOptions {
                    power_preference: match options.power_preference {
                        PowerPreference::Auto | PowerPreference::HighPerformance => {
                            ::wgpu::PowerPreference::HighPerformance
                        }
                        PowerPreference::LowPower => ::wgpu::PowerPreference::LowPower,
                    },
                    force_fallback_adapter: options.force_fallback_adapter,
                };
                match backend::wgpu::WgpuDevice::shared_with(wgpu_options) {
                    Ok(dev) => {
                        log::info!(
                            "Kestrel: using wgpu device {} (backend: {})",
                            dev.info().name,
                            dev.info().backend
                        );
                        device = Some(dev);
                    }
                    Err(err) => {
                        log::warn!("Kestrel: failed to initialize wgpu device, falling back: {err}");
                    }
                }
            }
            device
        }
        #[cfg(not(feature = "wgpu"))]
        {
            if matches!(options.device, DevicePreference::Wgpu) {
                log::warn!("Kestrel: wgpu device requested but crate built without 'wgpu' feature");
            }
            None
        }
    };

    let device = match preferred {
        Some(device) => device,
        None if options.allow_host_fallback || options.device == DevicePreference::Host => {
            let device = HostDevice::shared_with(HostDeviceOptions {
                max_work_group_size: options.host_max_work_group_size,
                ..Default::default()
            })?;
            log::info!("Kestrel: using host compute device");
            device
        }
        None => {
            return Err(DispatchError::device(
                "no compute device available and host fallback is disabled",
            ))
        }
    };
    kestrel_accelerate_api::register_device(device.clone());
    Ok(device)
}

/// [`initialize_device_with`] using `KESTREL_DEVICE`.
pub fn initialize_device() -> Result<DeviceRef> {
    initialize_device_with(&DeviceInitOptions::from_env())
}
