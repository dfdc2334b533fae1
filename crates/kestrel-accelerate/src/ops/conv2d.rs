use kestrel_accelerate_api::{Activation, BuildOptions, DispatchError, KernelArg, Result, Tensor};

use super::{expect_io, to_u32, tuning_key, Argument, OpBuilder, OpDef, Operation, ShapeLookup};
use crate::autotune::default_lws_3d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};
use crate::winograd::WinogradConv;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Padding {
    Valid,
    Same,
    Full,
}

impl Padding {
    fn from_arg(def: &OpDef) -> Result<Self> {
        let invalid = |what: String| {
            DispatchError::config(def.context(), format!("unknown padding {what}"))
        };
        match def.args.get("padding") {
            None => Ok(Padding::Same),
            Some(Argument::Int(0)) => Ok(Padding::Valid),
            Some(Argument::Int(1)) => Ok(Padding::Same),
            Some(Argument::Int(2)) => Ok(Padding::Full),
            Some(Argument::Int(other)) => Err(invalid(other.to_string())),
            Some(Argument::Str(name)) => match name.to_ascii_uppercase().as_str() {
                "VALID" => Ok(Padding::Valid),
                "SAME" => Ok(Padding::Same),
                "FULL" => Ok(Padding::Full),
                _ => Err(invalid(format!("'{name}'"))),
            },
            Some(other) => Err(invalid(format!("{other:?}"))),
        }
    }
}

/// NHWC output shape and total paddings per spatial axis for an OIHW filter.
/// Explicit paddings win over the padding mode.
pub fn conv_output_size(
    input: &[usize],
    filter: &[usize],
    strides: [usize; 2],
    dilations: [usize; 2],
    padding: Padding,
    explicit: Option<[usize; 2]>,
) -> Result<([usize; 4], [usize; 2])> {
    let ctx = "conv2d";
    if input.len() != 4 || filter.len() != 4 {
        return Err(DispatchError::config(
            ctx,
            format!("expected NHWC input and OIHW filter, got {input:?} and {filter:?}"),
        ));
    }
    if strides.contains(&0) || dilations.contains(&0) {
        return Err(DispatchError::config(
            ctx,
            format!("strides {strides:?} and dilations {dilations:?} must be positive"),
        ));
    }
    let mut out = [input[0], 0, 0, filter[0]];
    let mut paddings = [0usize; 2];
    for axis in 0..2 {
        let size = input[1 + axis];
        let extent = (filter[2 + axis].max(1) - 1) * dilations[axis] + 1;
        let stride = strides[axis];
        let out_size = match explicit {
            Some(explicit) => {
                paddings[axis] = explicit[axis];
                let padded = size + explicit[axis];
                if padded < extent {
                    return Err(DispatchError::config(
                        ctx,
                        format!("filter extent {extent} exceeds padded input {padded}"),
                    ));
                }
                (padded - extent) / stride + 1
            }
            None => {
                let out_size = match padding {
                    Padding::Valid => {
                        if size < extent {
                            return Err(DispatchError::config(
                                ctx,
                                format!("filter extent {extent} exceeds input {size}"),
                            ));
                        }
                        (size - extent) / stride + 1
                    }
                    Padding::Same => size.saturating_sub(1) / stride + 1,
                    Padding::Full => (size + extent).saturating_sub(2) / stride + 1,
                };
                paddings[axis] = ((out_size - 1) * stride + extent).saturating_sub(size);
                out_size
            }
        };
        out[1 + axis] = out_size;
    }
    Ok((out, paddings))
}

fn pair(def: &OpDef, name: &str, default: usize) -> Result<[usize; 2]> {
    let values = def.arg_ints_or(name, &[default as i64, default as i64])?;
    match values.as_slice() {
        [a, b] if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
        _ => Err(DispatchError::config(
            def.context(),
            format!("argument '{name}' must hold two non-negative values, got {values:?}"),
        )),
    }
}

#[derive(Default)]
pub struct Conv2dBuilder;

impl OpBuilder for Conv2dBuilder {
    fn build_op(&self, def: &OpDef, shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        let strides = pair(def, "strides", 1)?;
        let dilations = pair(def, "dilations", 1)?;
        let padding = Padding::from_arg(def)?;
        let explicit = if def.has_arg("padding_values") {
            Some(pair(def, "padding_values", 0)?)
        } else {
            None
        };
        let activation = def.activation()?;
        let block_size = def.arg_int("wino_block_size", 0)?;
        let winograd = if block_size != 0 {
            Some(WinogradConv::new(block_size, activation)?)
        } else {
            None
        };
        if let (Some(input), Some(filter)) = (
            def.inputs.first().and_then(|n| shapes.shape(n)),
            def.inputs.get(1).and_then(|n| shapes.shape(n)),
        ) {
            conv_output_size(&input, &filter, strides, dilations, padding, explicit)?;
        }
        Ok(Box::new(Conv2dOp {
            context: def.context(),
            strides,
            dilations,
            padding,
            explicit,
            activation,
            winograd,
            direct: KernelSlot::new(),
        }))
    }
}

/// 2D convolution, NHWC activations and OIHW weights. 3x3 unit-stride
/// convolutions go through the Winograd pipeline when a block size is set.
pub struct Conv2dOp {
    context: String,
    strides: [usize; 2],
    dilations: [usize; 2],
    padding: Padding,
    explicit: Option<[usize; 2]>,
    activation: Activation,
    winograd: Option<WinogradConv>,
    direct: KernelSlot,
}

impl Conv2dOp {
    fn winograd_eligible(&self, filter: &[usize]) -> bool {
        self.winograd.is_some()
            && filter[2] == 3
            && filter[3] == 3
            && self.strides == [1, 1]
            && self.dilations == [1, 1]
    }

    pub fn winograd(&self) -> Option<&WinogradConv> {
        self.winograd.as_ref()
    }

    pub fn direct_slot(&self) -> &KernelSlot {
        &self.direct
    }

    fn run_direct(
        &mut self,
        ctx: &mut OpContext,
        input: &Tensor,
        filter: &Tensor,
        bias: Option<&Tensor>,
        paddings: [usize; 2],
        output: &mut Tensor,
    ) -> Result<()> {
        let context = self.context.as_str();
        let [n, in_h, in_w, in_c] = [input.dim(0), input.dim(1), input.dim(2), input.dim(3)];
        let [_, out_h, out_w, out_c] = [output.dim(0), output.dim(1), output.dim(2), output.dim(3)];
        let (kernel_h, kernel_w) = (filter.dim(2), filter.dim(3));

        let mut options = BuildOptions::new();
        options
            .data_type(input.dtype())
            .activation(self.activation.kind)
            .bias(bias.is_some());
        let request = KernelRequest::new(program::CONV_2D, "conv_2d").with_options(options);
        let handle = self.direct.ensure(ctx, request)?;

        let global = [
            to_u32(context, out_c.div_ceil(4))?,
            to_u32(context, out_w)?,
            to_u32(context, n * out_h)?,
        ];
        let input_buf = input.memory()?.clone();
        let filter_buf = filter.memory()?.clone();
        let bias_buf = bias.map(|b| b.memory().cloned()).transpose()?;
        let output_buf = output.mutable_memory()?.clone();
        let mut ids = vec![input_buf.id(), filter_buf.id(), output_buf.id()];
        ids.extend(bias_buf.as_ref().map(|b| b.id()));
        let mut shape = input.shape().to_vec();
        shape.extend_from_slice(filter.shape());
        let signature = BindingSignature::new(&shape, ids, &global);

        let (strides, dilations, activation) = (self.strides, self.dilations, self.activation);
        self.direct.bind(signature, || {
            let mut args = vec![KernelArg::read(&input_buf), KernelArg::read(&filter_buf)];
            if let Some(bias) = &bias_buf {
                args.push(KernelArg::read(bias));
            }
            args.push(KernelArg::write(&output_buf));
            for value in [in_h, in_w, in_c, out_h, out_w, out_c, kernel_h, kernel_w] {
                args.push(KernelArg::U32(to_u32(context, value)?));
            }
            args.push(KernelArg::U32(to_u32(context, strides[0])?));
            args.push(KernelArg::U32(to_u32(context, strides[1])?));
            args.push(KernelArg::I32((paddings[0] / 2) as i32));
            args.push(KernelArg::I32((paddings[1] / 2) as i32));
            args.push(KernelArg::U32(to_u32(context, dilations[0])?));
            args.push(KernelArg::U32(to_u32(context, dilations[1])?));
            args.push(KernelArg::F32(activation.relux_max_limit));
            args.push(KernelArg::F32(activation.coefficient));
            Ok(args)
        })?;

        let lws = default_lws_3d(global, handle.max_work_group_size);
        let key = tuning_key(
            "conv2d_general_kernel",
            &[n, out_h, out_w, out_c, kernel_h, kernel_w],
        );
        let future = self.direct.run(ctx, &key, lws)?;
        ctx.set_future(future);
        Ok(())
    }
}

impl Operation for Conv2dOp {
    fn op_type(&self) -> &str {
        "Conv2D"
    }

    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_io(&self.context, inputs, 2, outputs)?;
        let (input, filter) = (inputs[0], inputs[1]);
        let bias = inputs.get(2).copied();
        if filter.dim_size() != 4 || input.dim_size() != 4 || filter.dim(1) != input.dim(3) {
            return Err(DispatchError::config(
                &self.context,
                format!(
                    "filter {:?} does not match input {:?}",
                    filter.shape(),
                    input.shape()
                ),
            ));
        }
        if let Some(bias) = bias {
            if bias.size() != filter.dim(0) {
                return Err(DispatchError::config(
                    &self.context,
                    format!("bias has {} values for {} filters", bias.size(), filter.dim(0)),
                ));
            }
        }
        let (out_shape, paddings) = conv_output_size(
            input.shape(),
            filter.shape(),
            self.strides,
            self.dilations,
            self.padding,
            self.explicit,
        )?;
        let output = &mut outputs[0];
        output.resize(&out_shape)?;

        if self.winograd_eligible(filter.shape()) {
            if let Some(winograd) = self.winograd.as_mut() {
                return winograd.run(ctx, input, filter, bias, paddings, output);
            }
        }
        self.run_direct(ctx, input, filter, bias, paddings, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{NoShapes, OpDefBuilder};

    #[test]
    fn same_padding_keeps_spatial_size() {
        let (out, pads) =
            conv_output_size(&[1, 7, 9, 3], &[8, 3, 3, 3], [1, 1], [1, 1], Padding::Same, None)
                .unwrap();
        assert_eq!(out, [1, 7, 9, 8]);
        assert_eq!(pads, [2, 2]);
    }

    #[test]
    fn valid_and_full_padding() {
        let (out, pads) =
            conv_output_size(&[1, 6, 6, 1], &[1, 1, 3, 3], [1, 1], [1, 1], Padding::Valid, None)
                .unwrap();
        assert_eq!(out, [1, 4, 4, 1]);
        assert_eq!(pads, [0, 0]);
        let (out, pads) =
            conv_output_size(&[1, 6, 6, 1], &[1, 1, 3, 3], [1, 1], [1, 1], Padding::Full, None)
                .unwrap();
        assert_eq!(out, [1, 8, 8, 1]);
        assert_eq!(pads, [4, 4]);
    }

    #[test]
    fn strides_dilations_and_explicit_paddings() {
        let (out, _) =
            conv_output_size(&[1, 9, 9, 1], &[1, 1, 3, 3], [2, 2], [2, 2], Padding::Valid, None)
                .unwrap();
        assert_eq!(out, [1, 3, 3, 1]);
        let (out, pads) = conv_output_size(
            &[1, 5, 5, 1],
            &[1, 1, 3, 3],
            [1, 1],
            [1, 1],
            Padding::Valid,
            Some([2, 0]),
        )
        .unwrap();
        assert_eq!(out, [1, 5, 3, 1]);
        assert_eq!(pads, [2, 0]);
    }

    #[test]
    fn unsupported_winograd_block_fails_at_build() {
        let def = OpDefBuilder::new("Conv2D", "conv")
            .input("x")
            .input("w")
            .output("y")
            .arg("wino_block_size", 3)
            .build();
        let err = Conv2dBuilder.build_op(&def, &NoShapes).err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn padding_argument_forms() {
        let def = OpDefBuilder::new("Conv2D", "c").arg("padding", "valid").build();
        assert_eq!(Padding::from_arg(&def).unwrap(), Padding::Valid);
        let def = OpDefBuilder::new("Conv2D", "c").arg("padding", 2).build();
        assert_eq!(Padding::from_arg(&def).unwrap(), Padding::Full);
        let def = OpDefBuilder::new("Conv2D", "c").build();
        assert_eq!(Padding::from_arg(&def).unwrap(), Padding::Same);
        let def = OpDefBuilder::new("Conv2D", "c").arg("padding", 7).build();
        assert!(Padding::from_arg(&def).is_err());
    }
}
