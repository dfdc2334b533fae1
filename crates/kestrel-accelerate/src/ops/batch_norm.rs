use kestrel_accelerate_api::{
    Activation, BufferContentType, BuildOptions, DispatchError, KernelArg, Result, Tensor,
};

use super::{expect_io, to_u32, tuning_key, OpBuilder, OpDef, Operation, ShapeLookup};
use crate::autotune::default_lws_2d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};

pub const DEFAULT_EPSILON: f32 = 1e-3;

#[derive(Default)]
pub struct BatchNormBuilder;

impl OpBuilder for BatchNormBuilder {
    fn build_op(&self, def: &OpDef, _shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        match def.inputs.len() {
            0 | 3 | 5 => {}
            n => {
                return Err(DispatchError::config(
                    def.context(),
                    format!("expected 3 (folded) or 5 inputs, got {n}"),
                ))
            }
        }
        Ok(Box::new(BatchNormOp {
            context: def.context(),
            epsilon: def.arg_float("epsilon", DEFAULT_EPSILON)?,
            activation: def.activation()?,
            folded: None,
            slot: KernelSlot::new(),
        }))
    }
}

/// Scale and offset folded from (scale, offset, mean, variance), keyed by
/// the source buffer ids and their write generations.
struct FoldedParams {
    sources: Vec<(u64, u64)>,
    scale: Tensor,
    offset: Tensor,
}

/// Per-channel `x * scale + offset` followed by the activation. With five
/// inputs the mean and variance are folded into scale and offset once.
pub struct BatchNormOp {
    context: String,
    epsilon: f32,
    activation: Activation,
    folded: Option<FoldedParams>,
    slot: KernelSlot,
}

impl BatchNormOp {
    fn fold(&mut self, ctx: &OpContext, params: &[&Tensor]) -> Result<()> {
        let mut sources = Vec::with_capacity(params.len());
        for tensor in params {
            sources.push(tensor.contents_key()?);
        }
        if self
            .folded
            .as_ref()
            .is_some_and(|folded| folded.sources == sources)
        {
            return Ok(());
        }
        let scale = params[0].to_host()?;
        let offset = params[1].to_host()?;
        let mean = params[2].to_host()?;
        let var = params[3].to_host()?;
        let mut new_scale = Vec::with_capacity(scale.len());
        let mut new_offset = Vec::with_capacity(scale.len());
        for c in 0..scale.len() {
            let s = scale[c] / (var[c] + self.epsilon).sqrt();
            new_scale.push(s);
            new_offset.push(offset[c] - mean[c] * s);
        }
        let channels = [scale.len()];
        self.folded = Some(FoldedParams {
            sources,
            scale: Tensor::from_host(ctx.device(), "bn_folded_scale", &channels, &new_scale)?
                .with_content_type(BufferContentType::Argument),
            offset: Tensor::from_host(ctx.device(), "bn_folded_offset", &channels, &new_offset)?
                .with_content_type(BufferContentType::Argument),
        });
        log::debug!("{}: folded mean and variance into scale", self.context);
        Ok(())
    }
}

impl Operation for BatchNormOp {
    fn op_type(&self) -> &str {
        "BatchNorm"
    }

    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_io(&self.context, inputs, 3, outputs)?;
        let input = inputs[0];
        let channels = input.shape().last().copied().unwrap_or(1);
        if let Some(bad) = inputs[1..].iter().find(|t| t.size() != channels) {
            return Err(DispatchError::config(
                &self.context,
                format!(
                    "'{}' has {} values for {} channels",
                    bad.name(),
                    bad.size(),
                    channels
                ),
            ));
        }
        let (scale_buf, offset_buf) = match inputs.len() {
            3 => (inputs[1].memory()?.clone(), inputs[2].memory()?.clone()),
            5 => {
                self.fold(ctx, &inputs[1..])?;
                match &self.folded {
                    Some(folded) => (folded.scale.memory()?.clone(), folded.offset.memory()?.clone()),
                    None => return Err(DispatchError::config(&self.context, "folding failed")),
                }
            }
            n => {
                return Err(DispatchError::config(
                    &self.context,
                    format!("expected 3 or 5 inputs, got {n}"),
                ))
            }
        };
        let output = &mut outputs[0];
        output.resize(input.shape())?;
        let pixels = input.size() / channels.max(1);
        if pixels * channels == 0 {
            return Ok(());
        }

        let mut options = BuildOptions::new();
        options
            .data_type(input.dtype())
            .activation(self.activation.kind);
        let request = KernelRequest::new(program::BATCH_NORM, "batch_norm").with_options(options);
        let handle = self.slot.ensure(ctx, request)?;
        let context = self.context.as_str();
        let global = [to_u32(context, channels)?, to_u32(context, pixels)?];
        let input_buf = input.memory()?.clone();
        let output_buf = output.mutable_memory()?.clone();
        let signature = BindingSignature::new(
            input.shape(),
            vec![input_buf.id(), scale_buf.id(), offset_buf.id(), output_buf.id()],
            &global,
        );
        let activation = self.activation;
        self.slot.bind(signature, || {
            Ok(vec![
                KernelArg::read(&input_buf),
                KernelArg::read(&scale_buf),
                KernelArg::read(&offset_buf),
                KernelArg::write(&output_buf),
                KernelArg::F32(activation.relux_max_limit),
                KernelArg::F32(activation.coefficient),
            ])
        })?;
        let lws = default_lws_2d(handle.max_work_group_size, 16);
        let future = self
            .slot
            .run(ctx, &tuning_key("batch_norm_kernel", input.shape()), lws)?;
        ctx.set_future(future);
        Ok(())
    }
}
