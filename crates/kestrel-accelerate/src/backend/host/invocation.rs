use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_accelerate_api::{apply_activation, ActivationType};
use parking_lot::{Mutex, MutexGuard};

pub(crate) type Storage = Arc<Mutex<Vec<f32>>>;

/// Kernel argument after buffer ids were resolved to storage.
#[derive(Clone)]
pub(crate) enum ResolvedArg {
    Buffer(usize),
    U32(u32),
    I32(i32),
    F32(f32),
}

/// Build-time configuration of a host kernel, derived from its `-D` options.
#[derive(Debug, Clone)]
pub struct KernelDefines {
    defines: BTreeMap<String, String>,
    activation: ActivationType,
}

impl KernelDefines {
    pub(crate) fn new(defines: BTreeMap<String, String>) -> Self {
        let activation = defines
            .keys()
            .find_map(|name| ActivationType::from_build_macro(name))
            .unwrap_or(ActivationType::NoOp);
        Self {
            defines,
            activation,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    pub fn activation(&self) -> ActivationType {
        self.activation
    }
}

/// State of one work item's view of a launch.
///
/// Accesses outside a buffer never touch memory: loads return zero, stores
/// are dropped and the violation is recorded for the bounds guard.
pub struct HostInvocation<'a> {
    args: &'a [ResolvedArg],
    storage: Vec<MutexGuard<'a, Vec<f32>>>,
    defines: &'a KernelDefines,
    violation: bool,
    error: Option<String>,
}

impl<'a> HostInvocation<'a> {
    pub(crate) fn new(
        args: &'a [ResolvedArg],
        storage: &'a [Storage],
        defines: &'a KernelDefines,
    ) -> Self {
        Self {
            args,
            storage: storage.iter().map(|s| s.lock()).collect(),
            defines,
            violation: false,
            error: None,
        }
    }

    pub fn defines(&self) -> &KernelDefines {
        self.defines
    }

    pub fn has(&self, name: &str) -> bool {
        self.defines.has(name)
    }

    pub fn activate(&self, value: f32, limit: f32, coefficient: f32) -> f32 {
        apply_activation(self.defines.activation(), value, limit, coefficient)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }

    pub fn u32(&mut self, index: usize) -> u32 {
        match self.args.get(index) {
            Some(ResolvedArg::U32(v)) => *v,
            Some(ResolvedArg::I32(v)) if *v >= 0 => *v as u32,
            other => {
                let kind = describe(other);
                self.fail(format!("argument {index}: expected u32, got {kind}"));
                0
            }
        }
    }

    pub fn i32(&mut self, index: usize) -> i32 {
        match self.args.get(index) {
            Some(ResolvedArg::I32(v)) => *v,
            Some(ResolvedArg::U32(v)) => *v as i32,
            other => {
                let kind = describe(other);
                self.fail(format!("argument {index}: expected i32, got {kind}"));
                0
            }
        }
    }

    pub fn f32(&mut self, index: usize) -> f32 {
        match self.args.get(index) {
            Some(ResolvedArg::F32(v)) => *v,
            other => {
                let kind = describe(other);
                self.fail(format!("argument {index}: expected f32, got {kind}"));
                0.0
            }
        }
    }

    fn slot(&mut self, index: usize) -> Option<usize> {
        match self.args.get(index) {
            Some(ResolvedArg::Buffer(slot)) => Some(*slot),
            other => {
                let kind = describe(other);
                self.fail(format!("argument {index}: expected buffer, got {kind}"));
                None
            }
        }
    }

    pub fn buffer_len(&mut self, index: usize) -> usize {
        match self.slot(index) {
            Some(slot) => self.storage[slot].len(),
            None => 0,
        }
    }

    pub fn load(&mut self, index: usize, offset: usize) -> f32 {
        let Some(slot) = self.slot(index) else {
            return 0.0;
        };
        match self.storage[slot].get(offset) {
            Some(v) => *v,
            None => {
                self.violation = true;
                0.0
            }
        }
    }

    pub fn store(&mut self, index: usize, offset: usize, value: f32) {
        let Some(slot) = self.slot(index) else {
            return;
        };
        match self.storage[slot].get_mut(offset) {
            Some(dst) => *dst = value,
            None => self.violation = true,
        }
    }

    /// Report a logical out-of-range condition detected by the kernel itself.
    pub fn flag_violation(&mut self) {
        self.violation = true;
    }

    pub(crate) fn violation(&self) -> bool {
        self.violation
    }

    /// Set the trailing guard buffer.
    pub(crate) fn raise_guard(&mut self) {
        if let Some(ResolvedArg::Buffer(slot)) = self.args.last() {
            if let Some(flag) = self.storage[*slot].get_mut(0) {
                *flag = 1.0;
            }
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }
}

fn describe(arg: Option<&ResolvedArg>) -> &'static str {
    match arg {
        None => "nothing",
        Some(ResolvedArg::Buffer(_)) => "buffer",
        Some(ResolvedArg::U32(_)) => "u32",
        Some(ResolvedArg::I32(_)) => "i32",
        Some(ResolvedArg::F32(_)) => "f32",
    }
}
