//! Named tensors and a sequential operator runner on top of the registry.

use std::collections::HashMap;

use kestrel_accelerate_api::{DataType, DeviceRef, DispatchError, Result, Tensor};

use crate::context::OpContext;
use crate::ops::{OpDef, OpRegistry, Operation, ShapeLookup};

/// Tensors by name, all on one device.
pub struct Workspace {
    device: DeviceRef,
    tensors: HashMap<String, Tensor>,
}

impl Workspace {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            tensors: HashMap::new(),
        }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Insert `tensor` under its own name, replacing any previous tensor.
    pub fn insert(&mut self, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(tensor.name().to_string(), tensor)
    }

    /// Upload host data as a new tensor.
    pub fn feed(&mut self, name: &str, shape: &[usize], data: &[f32]) -> Result<()> {
        let tensor = Tensor::from_host(&self.device, name, shape, data)?;
        self.insert(tensor);
        Ok(())
    }

    /// Read a tensor back to the host.
    pub fn fetch(&self, name: &str) -> Result<Vec<f32>> {
        self.tensor(name)?.to_host()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| DispatchError::config(name, "no such tensor in workspace"))
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Run one operator: outputs are created on first use and keep their
    /// buffers across runs.
    pub fn run_op(&mut self, ctx: &mut OpContext, def: &OpDef, op: &mut dyn Operation) -> Result<()> {
        if let Some(name) = def.outputs.iter().find(|o| def.inputs.contains(o)) {
            return Err(DispatchError::config(
                def.context(),
                format!("'{name}' is both an input and an output"),
            ));
        }
        for name in &def.inputs {
            if !self.tensors.contains_key(name) {
                return Err(DispatchError::config(
                    def.context(),
                    format!("missing input tensor '{name}'"),
                ));
            }
        }
        let mut outputs: Vec<Tensor> = def
            .outputs
            .iter()
            .map(|name| {
                self.tensors
                    .remove(name)
                    .unwrap_or_else(|| Tensor::new(&self.device, name.as_str(), DataType::F32))
            })
            .collect();
        let inputs: Vec<&Tensor> = def
            .inputs
            .iter()
            .filter_map(|name| self.tensors.get(name))
            .collect();
        let result = op.run(ctx, &inputs, &mut outputs);
        for tensor in outputs {
            self.insert(tensor);
        }
        result
    }
}

impl ShapeLookup for Workspace {
    fn shape(&self, name: &str) -> Option<Vec<usize>> {
        self.tensors.get(name).map(|t| t.shape().to_vec())
    }
}

/// Built operators run in definition order. Instances persist across runs,
/// so compiled kernels and bound arguments are reused.
pub struct Net {
    ops: Vec<(OpDef, Box<dyn Operation>)>,
}

impl Net {
    /// Build every definition. Shapes come from the workspace and from the
    /// declared output shapes of earlier operators.
    pub fn build(registry: &OpRegistry, defs: &[OpDef], workspace: &Workspace) -> Result<Self> {
        let mut shapes: HashMap<String, Vec<usize>> = HashMap::new();
        for def in defs {
            for name in &def.inputs {
                if let Some(shape) = workspace.shape(name) {
                    shapes.entry(name.clone()).or_insert(shape);
                }
            }
        }
        let mut ops = Vec::with_capacity(defs.len());
        for def in defs {
            let op = registry.build(def, &shapes)?;
            for (name, shape) in def.outputs.iter().zip(&def.output_shapes) {
                shapes.insert(name.clone(), shape.clone());
            }
            ops.push((def.clone(), op));
        }
        log::debug!("net: built {} operators", ops.len());
        Ok(Self { ops })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op(&self, index: usize) -> Option<&dyn Operation> {
        self.ops.get(index).map(|(_, op)| op.as_ref())
    }

    /// Enqueue every operator. Their futures are merged into `ctx`.
    pub fn run(&mut self, ctx: &mut OpContext, workspace: &mut Workspace) -> Result<()> {
        for (def, op) in &mut self.ops {
            let span = tracing::debug_span!("net.op", op = %def.name, kind = %def.op_type);
            let _enter = span.enter();
            workspace.run_op(ctx, def, op.as_mut())?;
        }
        Ok(())
    }
}
