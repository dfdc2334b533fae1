use kestrel_accelerate_api::{BuildOptions, DispatchError, KernelArg, Result, Tensor};

use super::{expect_io, to_u32, tuning_key, OpBuilder, OpDef, Operation, ShapeLookup};
use crate::autotune::default_lws_2d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};

#[derive(Default)]
pub struct LrnBuilder;

impl OpBuilder for LrnBuilder {
    fn build_op(&self, def: &OpDef, _shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        let depth_radius = def.arg_int("depth_radius", 5)?;
        if depth_radius < 0 {
            return Err(DispatchError::config(
                def.context(),
                format!("depth_radius must be non-negative, got {depth_radius}"),
            ));
        }
        Ok(Box::new(LrnOp {
            context: def.context(),
            depth_radius: depth_radius as u32,
            bias: def.arg_float("bias", 1.0)?,
            alpha: def.arg_float("alpha", 1.0)?,
            beta: def.arg_float("beta", 0.5)?,
            slot: KernelSlot::new(),
        }))
    }
}

/// Cross-channel local response normalization over NHWC input.
pub struct LrnOp {
    context: String,
    depth_radius: u32,
    bias: f32,
    alpha: f32,
    beta: f32,
    slot: KernelSlot,
}

impl Operation for LrnOp {
    fn op_type(&self) -> &str {
        "LocalResponseNorm"
    }

    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_io(&self.context, inputs, 1, outputs)?;
        let input = inputs[0];
        if input.dim_size() != 4 {
            return Err(DispatchError::config(
                &self.context,
                format!("expected NHWC input, got {:?}", input.shape()),
            ));
        }
        let output = &mut outputs[0];
        output.resize(input.shape())?;
        let channels = input.dim(3);
        let pixels = input.dim(0) * input.dim(1) * input.dim(2);
        if channels * pixels == 0 {
            return Ok(());
        }

        let mut options = BuildOptions::new();
        options.data_type(input.dtype());
        let request = KernelRequest::new(program::LRN, "lrn").with_options(options);
        let handle = self.slot.ensure(ctx, request)?;
        let context = self.context.as_str();
        let global = [to_u32(context, channels)?, to_u32(context, pixels)?];
        let input_buf = input.memory()?.clone();
        let output_buf = output.mutable_memory()?.clone();
        let signature = BindingSignature::new(
            input.shape(),
            vec![input_buf.id(), output_buf.id()],
            &global,
        );
        let (radius, bias, alpha, beta) = (self.depth_radius, self.bias, self.alpha, self.beta);
        self.slot.bind(signature, || {
            Ok(vec![
                KernelArg::read(&input_buf),
                KernelArg::write(&output_buf),
                KernelArg::U32(radius),
                KernelArg::F32(bias),
                KernelArg::F32(alpha),
                KernelArg::F32(beta),
            ])
        })?;
        let lws = default_lws_2d(handle.max_work_group_size, 16);
        let future = self
            .slot
            .run(ctx, &tuning_key("lrn_kernel", input.shape()), lws)?;
        ctx.set_future(future);
        Ok(())
    }
}
