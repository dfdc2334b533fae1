//! Operators built on the shared dispatch pattern and the registry that
//! builds them from serialized definitions.

mod batch_norm;
mod conv2d;
mod def;
mod lrn;
mod registry;
mod slice;
mod stack;

pub use batch_norm::{BatchNormBuilder, BatchNormOp};
pub use conv2d::{conv_output_size, Conv2dBuilder, Conv2dOp, Padding};
pub use def::{Argument, NoShapes, OpDef, OpDefBuilder, ShapeLookup};
pub use lrn::{LrnBuilder, LrnOp};
pub use registry::{BuilderFactory, OpRegistry};
pub use slice::{resolve_slice, SliceBuilder, SliceOp, SliceParams};
pub use stack::{normalize_stack_axis, StackBuilder, StackOp};

use kestrel_accelerate_api::{DispatchError, Result, Tensor};

use crate::context::OpContext;

/// A built operator instance. Instances own their kernel slots, so kernels
/// and bound arguments persist across runs.
pub trait Operation: Send {
    fn op_type(&self) -> &str;

    /// Enqueue the operator; its future is attached to `ctx`.
    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()>;
}

pub trait OpBuilder: Send + Sync {
    fn build_op(&self, def: &OpDef, shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>>;
}

pub(crate) fn expect_io(
    context: &str,
    inputs: &[&Tensor],
    min_inputs: usize,
    outputs: &[Tensor],
) -> Result<()> {
    if inputs.len() < min_inputs {
        return Err(DispatchError::config(
            context,
            format!("expected at least {min_inputs} inputs, got {}", inputs.len()),
        ));
    }
    if outputs.is_empty() {
        return Err(DispatchError::config(context, "expected an output tensor"));
    }
    Ok(())
}

pub(crate) fn to_u32(context: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| DispatchError::config(context, format!("dimension {value} exceeds u32")))
}

/// `name_d0_d1_...`, the tuning-key convention shared by all operators.
pub(crate) fn tuning_key(name: &str, dims: &[usize]) -> String {
    let mut key = name.to_string();
    for d in dims {
        key.push('_');
        key.push_str(&d.to_string());
    }
    key
}
