use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

pub const TUNING_ENV: &str = "KESTREL_TUNING";
pub const TUNING_PATH_ENV: &str = "KESTREL_TUNING_PATH";
pub const AUTOTUNE_DIR_ENV: &str = "KESTREL_AUTOTUNE_DIR";
pub const OUT_OF_RANGE_CHECK_ENV: &str = "KESTREL_OUT_OF_RANGE_CHECK";
pub const OBFUSCATE_ENV: &str = "KESTREL_OBFUSCATE_KERNELS";
pub const SCRATCH_POOL_LIMIT_ENV: &str = "KESTREL_SCRATCH_POOL_LIMIT";
pub const MAX_ITEMS_PER_LAUNCH_ENV: &str = "KESTREL_MAX_ITEMS_PER_LAUNCH";

pub const DEFAULT_SCRATCH_POOL_LIMIT: usize = 16;
pub const DEFAULT_TUNING_REPETITIONS: u32 = 3;

static TUNING_MODE: AtomicBool = AtomicBool::new(false);

/// Toggle the process-wide tuning pass.
pub fn set_tuning_mode(enabled: bool) {
    TUNING_MODE.store(enabled, Ordering::SeqCst);
}

pub fn tuning_mode() -> bool {
    TUNING_MODE.load(Ordering::SeqCst)
}

/// Apply `KESTREL_TUNING` to the process-wide tuning flag. Leaves the flag
/// alone when the variable is unset.
pub fn init_from_env() -> Option<bool> {
    let enabled = env_truthy(TUNING_ENV)?;
    if enabled != tuning_mode() {
        log::info!("{TUNING_ENV}={enabled}: tuning pass {}", if enabled { "on" } else { "off" });
    }
    set_tuning_mode(enabled);
    Some(enabled)
}

pub fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_usize(var: &str) -> Option<usize> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RuntimeOptions {
    pub tuning: bool,
    /// Explicit tuning table file; wins over `autotune_dir`.
    pub tuning_path: Option<PathBuf>,
    pub autotune_dir: Option<PathBuf>,
    pub out_of_range_check: bool,
    pub obfuscate_kernels: bool,
    /// Pooled scratch regions kept per memory type.
    pub scratch_pool_limit: usize,
    /// Upper bound on work items per submission; `None` launches everything at once.
    pub max_items_per_launch: Option<u64>,
    pub tuning_repetitions: u32,
    /// Relative timing difference treated as measurement noise.
    pub tuning_noise_tolerance: f64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tuning: false,
            tuning_path: None,
            autotune_dir: None,
            out_of_range_check: false,
            obfuscate_kernels: true,
            scratch_pool_limit: DEFAULT_SCRATCH_POOL_LIMIT,
            max_items_per_launch: None,
            tuning_repetitions: DEFAULT_TUNING_REPETITIONS,
            tuning_noise_tolerance: 0.05,
        }
    }
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        let mut opts = RuntimeOptions::default();
        if let Some(v) = env_truthy(TUNING_ENV) {
            opts.tuning = v;
        }
        opts.tuning_path = std::env::var_os(TUNING_PATH_ENV).map(PathBuf::from);
        opts.autotune_dir = std::env::var_os(AUTOTUNE_DIR_ENV).map(PathBuf::from);
        if let Some(v) = env_truthy(OUT_OF_RANGE_CHECK_ENV) {
            opts.out_of_range_check = v;
        }
        if let Some(v) = env_truthy(OBFUSCATE_ENV) {
            opts.obfuscate_kernels = v;
        }
        if let Some(v) = env_usize(SCRATCH_POOL_LIMIT_ENV) {
            opts.scratch_pool_limit = v;
        }
        opts.max_items_per_launch = env_usize(MAX_ITEMS_PER_LAUNCH_ENV)
            .filter(|v| *v > 0)
            .map(|v| v as u64);
        opts
    }

    /// Location of the persisted tuning table for a device.
    pub fn tuning_file(&self, device_tag: &str) -> Option<PathBuf> {
        if let Some(path) = &self.tuning_path {
            return Some(path.clone());
        }
        self.autotune_dir.as_ref().map(|dir| {
            let mut path = dir.clone();
            path.push("autotune");
            path.push(format!("{device_tag}.json"));
            path
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        std::env::set_var(TUNING_ENV, "yes");
        std::env::set_var(OUT_OF_RANGE_CHECK_ENV, "0");
        std::env::set_var(SCRATCH_POOL_LIMIT_ENV, " 4 ");
        std::env::set_var(MAX_ITEMS_PER_LAUNCH_ENV, "0");
        let opts = RuntimeOptions::from_env();
        std::env::remove_var(TUNING_ENV);
        std::env::remove_var(OUT_OF_RANGE_CHECK_ENV);
        std::env::remove_var(SCRATCH_POOL_LIMIT_ENV);
        std::env::remove_var(MAX_ITEMS_PER_LAUNCH_ENV);

        assert!(opts.tuning);
        assert!(!opts.out_of_range_check);
        assert!(opts.obfuscate_kernels);
        assert_eq!(opts.scratch_pool_limit, 4);
        assert_eq!(opts.max_items_per_launch, None);
    }

    #[test]
    #[serial]
    fn tuning_env_drives_process_flag() {
        std::env::remove_var(TUNING_ENV);
        set_tuning_mode(false);
        assert_eq!(init_from_env(), None);
        assert!(!tuning_mode());

        std::env::set_var(TUNING_ENV, "on");
        assert_eq!(init_from_env(), Some(true));
        assert!(tuning_mode());

        std::env::set_var(TUNING_ENV, "0");
        assert_eq!(init_from_env(), Some(false));
        std::env::remove_var(TUNING_ENV);
        assert!(!tuning_mode());
    }

    #[test]
    fn tuning_file_prefers_explicit_path() {
        let mut opts = RuntimeOptions {
            autotune_dir: Some(PathBuf::from("/tmp/kestrel")),
            ..Default::default()
        };
        assert_eq!(
            opts.tuning_file("host-cpu"),
            Some(PathBuf::from("/tmp/kestrel/autotune/host-cpu.json"))
        );
        opts.tuning_path = Some(PathBuf::from("/data/tuned.json"));
        assert_eq!(
            opts.tuning_file("host-cpu"),
            Some(PathBuf::from("/data/tuned.json"))
        );
    }

    #[test]
    fn options_deserialize_kebab_case_with_defaults() {
        let opts: RuntimeOptions =
            serde_json::from_str(r#"{"out-of-range-check": true, "scratch-pool-limit": 2}"#)
                .expect("parse");
        assert!(opts.out_of_range_check);
        assert_eq!(opts.scratch_pool_limit, 2);
        assert_eq!(opts.tuning_repetitions, DEFAULT_TUNING_REPETITIONS);
    }
}
