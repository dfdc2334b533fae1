use kestrel_accelerate_api::{BuildOptions, DispatchError, KernelArg, KernelFuture, Result, Tensor};

use super::{expect_io, to_u32, tuning_key, OpBuilder, OpDef, Operation, ShapeLookup};
use crate::autotune::default_lws_2d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};

pub const DEFAULT_STACK_AXIS: i64 = 3;

/// Map `axis` into `[0, rank]` for stacking rank-`rank` inputs.
pub fn normalize_stack_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    if axis < -rank - 1 || axis > rank {
        return Err(DispatchError::config(
            "stack",
            format!(
                "Expected Packing axis in the range [{}, {}], but got {}",
                -rank - 1,
                rank,
                axis
            ),
        ));
    }
    let axis = if axis < 0 { axis + rank + 1 } else { axis };
    Ok(axis as usize)
}

#[derive(Default)]
pub struct StackBuilder;

impl OpBuilder for StackBuilder {
    fn build_op(&self, def: &OpDef, shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        let axis = def.arg_int("axis", DEFAULT_STACK_AXIS)?;
        let input_shape = match def.inputs.first() {
            Some(name) => shapes.shape(name),
            None => None,
        };
        if let (Some(shape), Some(declared)) = (&input_shape, def.output_shape(0)) {
            if declared.len() != shape.len() + 1 {
                return Err(DispatchError::config(
                    def.context(),
                    format!(
                        "output rank {} must be input rank {} + 1",
                        declared.len(),
                        shape.len()
                    ),
                ));
            }
            normalize_stack_axis(axis, shape.len())?;
        }
        Ok(Box::new(StackOp {
            context: def.context(),
            axis,
            slots: Vec::new(),
        }))
    }
}

/// Stacks N same-shaped inputs along a new axis, one copy kernel per input.
pub struct StackOp {
    context: String,
    axis: i64,
    slots: Vec<KernelSlot>,
}

impl StackOp {
    pub fn axis(&self) -> i64 {
        self.axis
    }

    pub fn slots(&self) -> &[KernelSlot] {
        &self.slots
    }
}

impl Operation for StackOp {
    fn op_type(&self) -> &str {
        "Stack"
    }

    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_io(&self.context, inputs, 1, outputs)?;
        let shape = inputs[0].shape().to_vec();
        if let Some(other) = inputs.iter().find(|t| t.shape() != shape.as_slice()) {
            return Err(DispatchError::config(
                &self.context,
                format!(
                    "all inputs must have shape {:?}, '{}' has {:?}",
                    shape,
                    other.name(),
                    other.shape()
                ),
            ));
        }
        let axis = normalize_stack_axis(self.axis, shape.len())?;
        let count = inputs.len();
        let mut out_shape = shape.clone();
        out_shape.insert(axis, count);
        let output = &mut outputs[0];
        output.resize(&out_shape)?;

        let outer: usize = shape[..axis].iter().product();
        let inner: usize = shape[axis..].iter().product();
        if outer * inner == 0 {
            return Ok(());
        }
        let global = [to_u32(&self.context, inner)?, to_u32(&self.context, outer)?];
        let key = tuning_key("stack_kernel", &[outer, count, inner]);
        let output_buf = output.mutable_memory()?.clone();
        let count_arg = to_u32(&self.context, count)?;

        if self.slots.len() < count {
            self.slots.resize_with(count, KernelSlot::new);
        }
        let mut futures = Vec::with_capacity(count);
        for (index, input) in inputs.iter().enumerate() {
            let slot = &mut self.slots[index];
            let mut options = BuildOptions::new();
            options.data_type(input.dtype());
            let request = KernelRequest::new(program::STACK, "stack_copy").with_options(options);
            let handle = slot.ensure(ctx, request)?;
            let input_buf = input.memory()?.clone();
            let signature = BindingSignature::new(
                &out_shape,
                vec![input_buf.id(), output_buf.id()],
                &global,
            );
            let index_arg = to_u32(&self.context, index)?;
            slot.bind(signature, || {
                Ok(vec![
                    KernelArg::read(&input_buf),
                    KernelArg::write(&output_buf),
                    KernelArg::U32(count_arg),
                    KernelArg::U32(index_arg),
                ])
            })?;
            let lws = default_lws_2d(handle.max_work_group_size, 4);
            futures.push(slot.run(ctx, &key, lws)?);
        }
        ctx.set_future(KernelFuture::merge(futures));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpDefBuilder;
    use std::collections::HashMap;

    #[test]
    fn axis_range_includes_new_dimension() {
        assert_eq!(normalize_stack_axis(0, 2).unwrap(), 0);
        assert_eq!(normalize_stack_axis(2, 2).unwrap(), 2);
        assert_eq!(normalize_stack_axis(-1, 2).unwrap(), 2);
        assert_eq!(normalize_stack_axis(-3, 2).unwrap(), 0);
        let err = normalize_stack_axis(3, 2).unwrap_err();
        assert!(err
            .to_string()
            .contains("Expected Packing axis in the range [-3, 2], but got 3"));
    }

    #[test]
    fn declared_output_rank_is_checked() {
        let mut shapes = HashMap::new();
        shapes.insert("a".to_string(), vec![2, 3, 4]);
        let ok = OpDefBuilder::new("Stack", "pack")
            .input("a")
            .output("y")
            .output_shape(&[2, 3, 4, 1])
            .build();
        assert!(StackBuilder.build_op(&ok, &shapes).is_ok());

        let bad = OpDefBuilder::new("Stack", "pack")
            .input("a")
            .output("y")
            .output_shape(&[2, 3, 4])
            .build();
        assert!(StackBuilder.build_op(&bad, &shapes).err().unwrap().is_config());
    }
}
