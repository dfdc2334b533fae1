use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    pub fn size_of(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }

    /// Value of the `DATA_TYPE` build macro.
    pub fn kernel_type(self) -> &'static str {
        match self {
            DataType::F32 => "float",
            DataType::F16 => "half",
        }
    }

    /// Value of the `CMD_DATA_TYPE` build macro.
    pub fn command_type(self) -> &'static str {
        match self {
            DataType::F32 => "f",
            DataType::F16 => "h",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Image,
    Buffer,
}

/// Layout convention of a tensor's device storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferContentType {
    /// NHWC activations.
    InOutChannel,
    /// Height-major intermediates such as Winograd transform planes.
    InOutHeight,
    /// OIHW convolution weights.
    ConvFilter,
    /// Pre-transformed Winograd weights `(blk_sqr, out, in)`.
    WinogradFilter,
    /// One-dimensional parameters such as bias or scale.
    Argument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    NoOp,
    Relu,
    ReluX,
    LeakyRelu,
    Tanh,
    Sigmoid,
    Elu,
}

impl ActivationType {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "NOOP" => Ok(ActivationType::NoOp),
            "RELU" => Ok(ActivationType::Relu),
            "RELUX" => Ok(ActivationType::ReluX),
            "LEAKYRELU" => Ok(ActivationType::LeakyRelu),
            "TANH" => Ok(ActivationType::Tanh),
            "SIGMOID" => Ok(ActivationType::Sigmoid),
            "ELU" => Ok(ActivationType::Elu),
            other => Err(DispatchError::config(
                "activation",
                format!("unknown activation type '{other}'"),
            )),
        }
    }

    /// Build macro selecting this activation, if any.
    pub fn build_macro(self) -> Option<&'static str> {
        match self {
            ActivationType::NoOp => None,
            ActivationType::Relu => Some("USE_RELU"),
            ActivationType::ReluX => Some("USE_RELUX"),
            ActivationType::LeakyRelu => Some("USE_LEAKYRELU"),
            ActivationType::Tanh => Some("USE_TANH"),
            ActivationType::Sigmoid => Some("USE_SIGMOID"),
            ActivationType::Elu => Some("USE_ELU"),
        }
    }

    pub fn from_build_macro(name: &str) -> Option<Self> {
        match name {
            "USE_RELU" => Some(ActivationType::Relu),
            "USE_RELUX" => Some(ActivationType::ReluX),
            "USE_LEAKYRELU" => Some(ActivationType::LeakyRelu),
            "USE_TANH" => Some(ActivationType::Tanh),
            "USE_SIGMOID" => Some(ActivationType::Sigmoid),
            "USE_ELU" => Some(ActivationType::Elu),
            _ => None,
        }
    }

    /// Numeric code used by shader backends that select the activation at runtime.
    pub fn code(self) -> u32 {
        match self {
            ActivationType::NoOp => 0,
            ActivationType::Relu => 1,
            ActivationType::ReluX => 2,
            ActivationType::LeakyRelu => 3,
            ActivationType::Tanh => 4,
            ActivationType::Sigmoid => 5,
            ActivationType::Elu => 6,
        }
    }
}

/// Activation type plus its two coefficients (clamp limit, auxiliary coefficient).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub kind: ActivationType,
    pub relux_max_limit: f32,
    pub coefficient: f32,
}

impl Default for Activation {
    fn default() -> Self {
        Self {
            kind: ActivationType::NoOp,
            relux_max_limit: 0.0,
            coefficient: 0.0,
        }
    }
}

impl Activation {
    pub fn new(kind: ActivationType, relux_max_limit: f32, coefficient: f32) -> Self {
        Self {
            kind,
            relux_max_limit,
            coefficient,
        }
    }

    pub fn apply(&self, value: f32) -> f32 {
        apply_activation(self.kind, value, self.relux_max_limit, self.coefficient)
    }
}

pub fn apply_activation(kind: ActivationType, value: f32, limit: f32, coefficient: f32) -> f32 {
    match kind {
        ActivationType::NoOp => value,
        ActivationType::Relu => value.max(0.0),
        ActivationType::ReluX => value.max(0.0).min(limit),
        ActivationType::LeakyRelu => {
            if value < 0.0 {
                value * coefficient
            } else {
                value
            }
        }
        ActivationType::Tanh => value.tanh(),
        ActivationType::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        ActivationType::Elu => {
            if value < 0.0 {
                coefficient * (value.exp() - 1.0)
            } else {
                value
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: String,
    pub max_work_group_size: u32,
    pub max_work_item_sizes: [u32; 3],
    /// Devices with non-uniform work-group support launch the exact global size.
    pub non_uniform_work_groups: bool,
    pub supports_f16: bool,
    pub memory_bytes: Option<u64>,
}

impl DeviceInfo {
    /// Short tag used to key persisted tuning results per device.
    pub fn tag(&self) -> String {
        let mut tag: String = format!("{}-{}", self.backend, self.name)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        while tag.contains("--") {
            tag = tag.replace("--", "-");
        }
        tag.trim_matches('-').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_names_round_trip_through_build_macros() {
        for name in ["RELU", "relux", "LeakyRelu", "TANH", "sigmoid", "ELU"] {
            let kind = ActivationType::parse(name).expect("parse");
            let mac = kind.build_macro().expect("macro");
            assert_eq!(ActivationType::from_build_macro(mac), Some(kind));
        }
        assert_eq!(ActivationType::parse("NOOP").unwrap().build_macro(), None);
        assert!(ActivationType::parse("PRELU").is_err());
    }

    #[test]
    fn relux_clamps_to_limit() {
        let act = Activation::new(ActivationType::ReluX, 6.0, 0.0);
        assert_eq!(act.apply(-1.0), 0.0);
        assert_eq!(act.apply(3.0), 3.0);
        assert_eq!(act.apply(9.0), 6.0);
    }

    #[test]
    fn device_tag_is_filesystem_friendly() {
        let info = DeviceInfo {
            name: "Mali G78 (r1p0)".to_string(),
            backend: "wgpu".to_string(),
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            non_uniform_work_groups: false,
            supports_f16: false,
            memory_bytes: None,
        };
        assert_eq!(info.tag(), "wgpu-mali-g78-r1p0");
    }
}
