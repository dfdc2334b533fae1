use std::collections::{BTreeMap, HashMap};

use kestrel_accelerate_api::{Activation, ActivationType, DispatchError, Result};
use serde::{Deserialize, Serialize};

/// Named operator argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl Argument {
    fn kind(&self) -> &'static str {
        match self {
            Argument::Int(_) => "int",
            Argument::Float(_) => "float",
            Argument::Str(_) => "string",
            Argument::Ints(_) => "int list",
            Argument::Floats(_) => "float list",
        }
    }
}

impl From<i64> for Argument {
    fn from(v: i64) -> Self {
        Argument::Int(v)
    }
}

impl From<i32> for Argument {
    fn from(v: i32) -> Self {
        Argument::Int(v as i64)
    }
}

impl From<f32> for Argument {
    fn from(v: f32) -> Self {
        Argument::Float(v)
    }
}

impl From<&str> for Argument {
    fn from(v: &str) -> Self {
        Argument::Str(v.to_string())
    }
}

impl From<String> for Argument {
    fn from(v: String) -> Self {
        Argument::Str(v)
    }
}

impl From<Vec<i64>> for Argument {
    fn from(v: Vec<i64>) -> Self {
        Argument::Ints(v)
    }
}

impl From<Vec<i32>> for Argument {
    fn from(v: Vec<i32>) -> Self {
        Argument::Ints(v.into_iter().map(i64::from).collect())
    }
}

impl From<Vec<f32>> for Argument {
    fn from(v: Vec<f32>) -> Self {
        Argument::Floats(v)
    }
}

/// Serialized operator definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub args: BTreeMap<String, Argument>,
    /// Declared output shapes, parallel to `outputs` when present.
    #[serde(default)]
    pub output_shapes: Vec<Vec<usize>>,
}

impl OpDef {
    pub fn has_arg(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }

    fn mismatch(&self, name: &str, expected: &str, found: &Argument) -> DispatchError {
        DispatchError::config(
            format!("{} '{}'", self.op_type, self.name),
            format!("argument '{name}' must be {expected}, got {}", found.kind()),
        )
    }

    pub fn arg_int(&self, name: &str, default: i64) -> Result<i64> {
        match self.args.get(name) {
            None => Ok(default),
            Some(Argument::Int(v)) => Ok(*v),
            Some(other) => Err(self.mismatch(name, "an int", other)),
        }
    }

    /// Ints are accepted where floats are expected.
    pub fn arg_float(&self, name: &str, default: f32) -> Result<f32> {
        match self.args.get(name) {
            None => Ok(default),
            Some(Argument::Float(v)) => Ok(*v),
            Some(Argument::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.mismatch(name, "a float", other)),
        }
    }

    pub fn arg_str(&self, name: &str, default: &str) -> Result<String> {
        match self.args.get(name) {
            None => Ok(default.to_string()),
            Some(Argument::Str(v)) => Ok(v.clone()),
            Some(other) => Err(self.mismatch(name, "a string", other)),
        }
    }

    /// A single int is accepted as a one-element list.
    pub fn arg_ints(&self, name: &str) -> Result<Option<Vec<i64>>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(Argument::Ints(v)) => Ok(Some(v.clone())),
            Some(Argument::Int(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(self.mismatch(name, "an int list", other)),
        }
    }

    pub fn arg_ints_or(&self, name: &str, default: &[i64]) -> Result<Vec<i64>> {
        Ok(self.arg_ints(name)?.unwrap_or_else(|| default.to_vec()))
    }

    pub fn arg_floats(&self, name: &str) -> Result<Option<Vec<f32>>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(Argument::Floats(v)) => Ok(Some(v.clone())),
            Some(Argument::Float(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(self.mismatch(name, "a float list", other)),
        }
    }

    /// `activation`, `max_limit` and `activation_coefficient`
    /// (`leakyrelu_coefficient` is read as a fallback).
    pub fn activation(&self) -> Result<Activation> {
        let kind = ActivationType::parse(&self.arg_str("activation", "NOOP")?)?;
        let limit = self.arg_float("max_limit", 0.0)?;
        let coefficient = if self.has_arg("activation_coefficient") {
            self.arg_float("activation_coefficient", 0.0)?
        } else {
            self.arg_float("leakyrelu_coefficient", 0.0)?
        };
        Ok(Activation::new(kind, limit, coefficient))
    }

    pub fn input(&self, index: usize) -> Result<&str> {
        self.inputs.get(index).map(String::as_str).ok_or_else(|| {
            DispatchError::config(
                format!("{} '{}'", self.op_type, self.name),
                format!("missing input #{index}"),
            )
        })
    }

    pub fn output_shape(&self, index: usize) -> Option<&[usize]> {
        self.output_shapes.get(index).map(Vec::as_slice)
    }

    /// Context string for errors raised while building or running this op.
    pub fn context(&self) -> String {
        format!("{} '{}'", self.op_type, self.name)
    }
}

/// Fluent construction of [`OpDef`]s.
#[derive(Debug, Clone)]
pub struct OpDefBuilder {
    def: OpDef,
}

impl OpDefBuilder {
    pub fn new(op_type: &str, name: &str) -> Self {
        Self {
            def: OpDef {
                name: name.to_string(),
                op_type: op_type.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.def.inputs.push(name.to_string());
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.def.outputs.push(name.to_string());
        self
    }

    pub fn output_shape(mut self, shape: &[usize]) -> Self {
        self.def.output_shapes.push(shape.to_vec());
        self
    }

    pub fn arg(mut self, name: &str, value: impl Into<Argument>) -> Self {
        self.def.args.insert(name.to_string(), value.into());
        self
    }

    pub fn build(self) -> OpDef {
        self.def
    }
}

/// Tensor shapes known while building operators.
pub trait ShapeLookup {
    fn shape(&self, name: &str) -> Option<Vec<usize>>;
}

impl ShapeLookup for HashMap<String, Vec<usize>> {
    fn shape(&self, name: &str) -> Option<Vec<usize>> {
        self.get(name).cloned()
    }
}

/// Lookup with no known shapes.
pub struct NoShapes;

impl ShapeLookup for NoShapes {
    fn shape(&self, _name: &str) -> Option<Vec<usize>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let def = OpDefBuilder::new("Slice", "s")
            .arg("axes", vec![-1i64])
            .arg("epsilon", 1)
            .build();
        assert_eq!(def.arg_ints("axes").unwrap(), Some(vec![-1]));
        assert_eq!(def.arg_ints_or("steps", &[1]).unwrap(), vec![1]);
        assert_eq!(def.arg_float("epsilon", 0.5).unwrap(), 1.0);
        assert_eq!(def.arg_int("axis", 3).unwrap(), 3);
    }

    #[test]
    fn wrong_argument_kind_is_config_error() {
        let def = OpDefBuilder::new("Stack", "pack").arg("axis", "zero").build();
        let err = def.arg_int("axis", 0).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("axis"));
    }

    #[test]
    fn activation_arguments() {
        let def = OpDefBuilder::new("Conv2D", "c")
            .arg("activation", "RELUX")
            .arg("max_limit", 6.0f32)
            .build();
        let act = def.activation().unwrap();
        assert_eq!(act.kind, ActivationType::ReluX);
        assert_eq!(act.relux_max_limit, 6.0);

        let bad = OpDefBuilder::new("Conv2D", "c").arg("activation", "SWISH").build();
        assert!(bad.activation().is_err());
    }

    #[test]
    fn op_def_json_uses_type_field() {
        let def = OpDefBuilder::new("Stack", "pack")
            .input("a")
            .output("y")
            .arg("axis", 0)
            .build();
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "Stack");
        assert_eq!(json["args"]["axis"]["int"], 0);
        let back: OpDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }
}
