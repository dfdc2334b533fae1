use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::types::{ActivationType, DataType};

pub const NON_UNIFORM_WORK_GROUP: &str = "NON_UNIFORM_WORK_GROUP";
pub const OUT_OF_RANGE_CHECK: &str = "OUT_OF_RANGE_CHECK";

/// Ordered set of `-DNAME[=VALUE]` kernel build options.
///
/// Ordering is lexicographic so two option sets with the same members always
/// compare, hash and print identically regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildOptions(BTreeSet<String>);

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw option; empty strings are ignored.
    pub fn insert(&mut self, option: impl Into<String>) -> &mut Self {
        let option = option.into();
        let trimmed = option.trim();
        if !trimmed.is_empty() {
            self.0.insert(trimmed.to_string());
        }
        self
    }

    pub fn define(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.insert(format!("-D{name}={value}"))
    }

    pub fn flag(&mut self, name: &str) -> &mut Self {
        self.insert(format!("-D{name}"))
    }

    /// Rename `symbol` to `replacement` at build time.
    pub fn define_symbol(&mut self, symbol: &str, replacement: &str) -> &mut Self {
        self.define(symbol, replacement)
    }

    pub fn data_type(&mut self, dtype: DataType) -> &mut Self {
        self.define("DATA_TYPE", dtype.kernel_type());
        self.define("CMD_DATA_TYPE", dtype.command_type())
    }

    pub fn activation(&mut self, kind: ActivationType) -> &mut Self {
        if let Some(name) = kind.build_macro() {
            self.flag(name);
        }
        self
    }

    pub fn bias(&mut self, enabled: bool) -> &mut Self {
        if enabled {
            self.flag("BIAS");
        }
        self
    }

    pub fn non_uniform_work_group(&mut self, enabled: bool) -> &mut Self {
        if enabled {
            self.flag(NON_UNIFORM_WORK_GROUP);
        }
        self
    }

    pub fn out_of_range_check(&mut self, enabled: bool) -> &mut Self {
        if enabled {
            self.flag(OUT_OF_RANGE_CHECK);
        }
        self
    }

    pub fn contains_flag(&self, name: &str) -> bool {
        self.defines().contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `-D` options into a name -> value map (flags map to an empty value).
    pub fn defines(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|opt| opt.strip_prefix("-D"))
            .map(|body| match body.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (body.to_string(), String::new()),
            })
            .collect()
    }
}

impl fmt::Display for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(" "))
    }
}

impl<S: Into<String>> FromIterator<S> for BuildOptions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut opts = BuildOptions::new();
        for opt in iter {
            opts.insert(opt);
        }
        opts
    }
}

/// Identity of a specialized kernel: program, (possibly obfuscated) kernel name, option set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelIdentity {
    pub program: String,
    pub kernel_name: String,
    pub options: BuildOptions,
}

impl KernelIdentity {
    pub fn new(program: impl Into<String>, kernel_name: impl Into<String>, options: BuildOptions) -> Self {
        Self {
            program: program.into(),
            kernel_name: kernel_name.into(),
            options,
        }
    }
}

impl fmt::Display for KernelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} [{}]", self.program, self.kernel_name, self.options)
    }
}

/// Deterministic obfuscated symbol for a kernel entry point.
pub fn obfuscate_symbol(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("k{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_order_does_not_affect_identity() {
        let mut a = BuildOptions::new();
        a.flag("BIAS").data_type(DataType::F32);
        let b: BuildOptions = ["-DCMD_DATA_TYPE=f", "", "-DDATA_TYPE=float", "-DBIAS"]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn defines_split_name_and_value() {
        let mut opts = BuildOptions::new();
        opts.define_symbol("matmul", "k00ff")
            .activation(ActivationType::Relu)
            .non_uniform_work_group(false);
        let defines = opts.defines();
        assert_eq!(defines.get("matmul").map(String::as_str), Some("k00ff"));
        assert_eq!(defines.get("USE_RELU").map(String::as_str), Some(""));
        assert!(!opts.contains_flag(NON_UNIFORM_WORK_GROUP));
    }

    #[test]
    fn obfuscated_names_are_stable() {
        let a = obfuscate_symbol("winograd_transform_2x2");
        assert_eq!(a, obfuscate_symbol("winograd_transform_2x2"));
        assert_ne!(a, obfuscate_symbol("winograd_transform_4x4"));
        assert_eq!(a.len(), 17);
        assert!(a.starts_with('k'));
    }
}
