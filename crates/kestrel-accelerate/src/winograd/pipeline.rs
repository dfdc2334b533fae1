use std::sync::Arc;

use kestrel_accelerate_api::{
    Activation, BufferContentType, BuildOptions, DeviceBuffer, DispatchError, KernelArg,
    KernelFuture, Result, Tensor,
};

use super::{round_hw, transform_filter, WinogradBlock};
use crate::autotune::default_lws_2d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};
use crate::scratch::ScratchRequest;

/// Shape-derived quantities of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinogradPlan {
    pub batch: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub in_channels: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub out_channels: usize,
    pub round_h: usize,
    pub round_w: usize,
    pub tiles: usize,
    pub blk_sqr: usize,
}

impl WinogradPlan {
    pub fn new(input: &[usize], output: &[usize], block: WinogradBlock) -> Result<Self> {
        if input.len() != 4 || output.len() != 4 {
            return Err(DispatchError::config(
                "winograd",
                format!("expected NHWC input and output, got {input:?} and {output:?}"),
            ));
        }
        if input[0] != output[0] {
            return Err(DispatchError::config(
                "winograd",
                format!("batch mismatch: input {input:?}, output {output:?}"),
            ));
        }
        let (round_h, round_w) = round_hw(output[1], output[2], block);
        Ok(Self {
            batch: input[0],
            in_height: input[1],
            in_width: input[2],
            in_channels: input[3],
            out_height: output[1],
            out_width: output[2],
            out_channels: output[3],
            round_h,
            round_w,
            tiles: input[0] * round_h * round_w,
            blk_sqr: block.blk_sqr(),
        })
    }

    pub fn transform_key(&self) -> String {
        format!(
            "winograd_transform_kernel_{}_{}_{}",
            self.blk_sqr, self.in_channels, self.tiles
        )
    }

    pub fn matmul_key(&self) -> String {
        format!(
            "matmul_kernel_{}_{}_{}",
            self.blk_sqr, self.out_channels, self.tiles
        )
    }

    pub fn inverse_key(&self) -> String {
        format!(
            "winograd_inverse_transform_kernel_{}_{}_{}_{}_{}",
            self.batch, self.out_height, self.out_width, self.out_channels, self.tiles
        )
    }
}

fn as_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| DispatchError::config("winograd", format!("{what} {value} exceeds u32")))
}

fn buffer_ids(buffers: &[&Arc<DeviceBuffer>]) -> Vec<u64> {
    buffers.iter().map(|b| b.id()).collect()
}

/// Three-stage Winograd convolution: input transform, batched matmul, inverse transform.
///
/// The transformed filter is computed once per filter buffer and kept as a
/// persistent tensor. Intermediates are rented from the context's scratch pool.
pub struct WinogradConv {
    block: WinogradBlock,
    activation: Activation,
    transform: KernelSlot,
    matmul: KernelSlot,
    inverse: KernelSlot,
    filter: Option<((u64, u64), Tensor)>,
}

impl WinogradConv {
    /// Fails for block sizes other than 2 and 4, before touching any device.
    pub fn new(block_size: i64, activation: Activation) -> Result<Self> {
        let block = WinogradBlock::from_size(block_size)?;
        Ok(Self {
            block,
            activation,
            transform: KernelSlot::new(),
            matmul: KernelSlot::new(),
            inverse: KernelSlot::new(),
            filter: None,
        })
    }

    pub fn block(&self) -> WinogradBlock {
        self.block
    }

    /// Slots in stage order.
    pub fn slots(&self) -> [&KernelSlot; 3] {
        [&self.transform, &self.matmul, &self.inverse]
    }

    /// Enqueue the three stages. `output` must already carry its NHWC shape;
    /// `paddings` are the total paddings per spatial axis.
    pub fn run(
        &mut self,
        ctx: &mut OpContext,
        input: &Tensor,
        filter: &Tensor,
        bias: Option<&Tensor>,
        paddings: [usize; 2],
        output: &mut Tensor,
    ) -> Result<()> {
        let plan = WinogradPlan::new(input.shape(), output.shape(), self.block)?;
        let expected_filter = [plan.out_channels, plan.in_channels, 3, 3];
        if filter.shape() != expected_filter {
            return Err(DispatchError::config(
                "winograd filter",
                format!("expected {:?}, got {:?}", expected_filter, filter.shape()),
            ));
        }
        let filter_t = self.transformed_filter(ctx, filter, &plan)?;
        let dtype = input.dtype();
        let t_input = ctx.scratch().allocate(
            "winograd_t_input",
            ScratchRequest::rent(
                vec![plan.blk_sqr, plan.in_channels, plan.tiles],
                BufferContentType::InOutHeight,
            )
            .with_dtype(dtype),
        )?;
        let mm_output = ctx.scratch().allocate(
            "winograd_mm_output",
            ScratchRequest::rent(
                vec![plan.blk_sqr, plan.out_channels, plan.tiles],
                BufferContentType::InOutHeight,
            )
            .with_dtype(dtype),
        )?;
        let input_buf = input.memory()?.clone();
        let t_input_buf = t_input.memory()?.clone();
        let mm_buf = mm_output.memory()?.clone();
        let output_buf = output.mutable_memory()?.clone();

        let tiles = as_u32(plan.tiles, "tile count")?;
        let in_channels = as_u32(plan.in_channels, "input channels")?;
        let out_channels = as_u32(plan.out_channels, "output channels")?;
        let round_hw = as_u32(plan.round_h * plan.round_w, "tiles per image")?;
        let round_w = as_u32(plan.round_w, "tile columns")?;

        let transform_future = {
            let span = tracing::trace_span!("winograd.stage", stage = "input_transform");
            let _enter = span.enter();
            let mut options = BuildOptions::new();
            options.data_type(dtype);
            let request = KernelRequest::new(
                program::WINOGRAD_TRANSFORM,
                &format!("winograd_transform_{}", self.block.suffix()),
            )
            .with_options(options);
            let handle = self.transform.ensure(ctx, request)?;
            let global = [tiles, in_channels.div_ceil(4)];
            let signature = BindingSignature::new(
                input.shape(),
                buffer_ids(&[&input_buf, &t_input_buf]),
                &global,
            );
            self.transform.bind(signature, || {
                Ok(vec![
                    KernelArg::read(&input_buf),
                    KernelArg::write(&t_input_buf),
                    KernelArg::U32(as_u32(plan.in_height, "input height")?),
                    KernelArg::U32(as_u32(plan.in_width, "input width")?),
                    KernelArg::U32(in_channels),
                    KernelArg::U32(round_hw),
                    KernelArg::U32(round_w),
                    KernelArg::U32(as_u32(paddings[0] / 2, "top padding")?),
                    KernelArg::U32(as_u32(paddings[1] / 2, "left padding")?),
                ])
            })?;
            let lws = default_lws_2d(handle.max_work_group_size, 8);
            self.transform.run(ctx, &plan.transform_key(), lws)?
        };

        let matmul_future = {
            let span = tracing::trace_span!("winograd.stage", stage = "matmul");
            let _enter = span.enter();
            let mut options = BuildOptions::new();
            options.data_type(dtype);
            let request = KernelRequest::new(program::MATMUL, "matmul").with_options(options);
            let handle = self.matmul.ensure(ctx, request)?;
            let row_blocks = out_channels.div_ceil(4);
            let batch_rows = row_blocks
                .checked_mul(as_u32(plan.blk_sqr, "block area")?)
                .ok_or_else(|| DispatchError::config("winograd", "matmul rows exceed u32"))?;
            let global = [tiles.div_ceil(4), batch_rows];
            let filter_buf = filter_t.clone();
            let signature = BindingSignature::new(
                &[plan.blk_sqr, plan.out_channels, plan.in_channels, plan.tiles],
                buffer_ids(&[&filter_buf, &t_input_buf, &mm_buf]),
                &global,
            );
            self.matmul.bind(signature, || {
                Ok(vec![
                    KernelArg::read(&filter_buf),
                    KernelArg::read(&t_input_buf),
                    KernelArg::write(&mm_buf),
                    KernelArg::I32(out_channels as i32),
                    KernelArg::I32(tiles as i32),
                    KernelArg::I32(in_channels as i32),
                    KernelArg::I32(row_blocks as i32),
                ])
            })?;
            let lws = default_lws_2d(handle.max_work_group_size, 64);
            self.matmul.run(ctx, &plan.matmul_key(), lws)?
        };

        let inverse_future = {
            let span = tracing::trace_span!("winograd.stage", stage = "inverse_transform");
            let _enter = span.enter();
            let mut options = BuildOptions::new();
            options
                .data_type(dtype)
                .activation(self.activation.kind)
                .bias(bias.is_some());
            let request = KernelRequest::new(
                program::WINOGRAD_TRANSFORM,
                &format!("winograd_inverse_transform_{}", self.block.suffix()),
            )
            .with_options(options);
            let handle = self.inverse.ensure(ctx, request)?;
            let global = [tiles, out_channels.div_ceil(4)];
            let bias_buf = bias.map(|b| b.memory().cloned()).transpose()?;
            let mut ids = vec![mm_buf.id(), output_buf.id()];
            ids.extend(bias_buf.as_ref().map(|b| b.id()));
            let signature = BindingSignature::new(output.shape(), ids, &global);
            let activation = self.activation;
            self.inverse.bind(signature, || {
                let mut args = vec![KernelArg::read(&mm_buf)];
                if let Some(bias) = &bias_buf {
                    args.push(KernelArg::read(bias));
                }
                args.extend([
                    KernelArg::write(&output_buf),
                    KernelArg::U32(as_u32(plan.out_height, "output height")?),
                    KernelArg::U32(as_u32(plan.out_width, "output width")?),
                    KernelArg::U32(out_channels),
                    KernelArg::U32(round_hw),
                    KernelArg::U32(round_w),
                    KernelArg::F32(activation.relux_max_limit),
                    KernelArg::F32(activation.coefficient),
                ]);
                Ok(args)
            })?;
            let lws = default_lws_2d(handle.max_work_group_size, 8);
            self.inverse.run(ctx, &plan.inverse_key(), lws)?
        };

        ctx.set_future(KernelFuture::merge(vec![
            transform_future,
            matmul_future,
            inverse_future,
        ]));
        Ok(())
    }

    fn transformed_filter(
        &mut self,
        ctx: &OpContext,
        filter: &Tensor,
        plan: &WinogradPlan,
    ) -> Result<Arc<DeviceBuffer>> {
        let source = filter.contents_key()?;
        if let Some((cached, tensor)) = &self.filter {
            if *cached == source {
                return tensor.memory().cloned();
            }
        }
        let weights = filter.to_host()?;
        let data = transform_filter(&weights, plan.out_channels, plan.in_channels, self.block)?;
        let tensor = Tensor::from_host(
            ctx.device(),
            format!("{}_winograd_{}", filter.name(), self.block.suffix()),
            &[plan.blk_sqr, plan.out_channels, plan.in_channels],
            &data,
        )?
        .with_content_type(BufferContentType::WinogradFilter);
        log::debug!(
            "winograd: transformed filter '{}' for block {}",
            filter.name(),
            self.block.size()
        );
        let buffer = tensor.memory()?.clone();
        self.filter = Some((source, tensor));
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_uses_ceiling_tiles() {
        let plan = WinogradPlan::new(&[2, 7, 9, 3], &[2, 5, 7, 8], WinogradBlock::Two).unwrap();
        assert_eq!((plan.round_h, plan.round_w), (3, 4));
        assert_eq!(plan.tiles, 24);
        assert_eq!(plan.blk_sqr, 16);
        assert_eq!(plan.transform_key(), "winograd_transform_kernel_16_3_24");
        assert_eq!(plan.matmul_key(), "matmul_kernel_16_8_24");
        assert_eq!(
            plan.inverse_key(),
            "winograd_inverse_transform_kernel_2_5_7_8_24"
        );
    }

    #[test]
    fn plan_rejects_batch_mismatch() {
        let err = WinogradPlan::new(&[1, 4, 4, 1], &[2, 2, 2, 1], WinogradBlock::Four).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unsupported_block_size_fails_early() {
        let err = WinogradConv::new(3, Activation::default())
            .err()
            .expect("block size 3 must be rejected");
        assert!(err.is_config());
        assert!(err.to_string().contains('3'));
    }
}
