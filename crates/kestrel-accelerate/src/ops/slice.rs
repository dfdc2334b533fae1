use kestrel_accelerate_api::{BuildOptions, DispatchError, KernelArg, Result, Tensor};

use super::{expect_io, to_u32, tuning_key, OpBuilder, OpDef, Operation, ShapeLookup};
use crate::autotune::default_lws_3d;
use crate::backend::program;
use crate::cache::KernelRequest;
use crate::context::OpContext;
use crate::dispatch::{BindingSignature, KernelSlot};

const MAX_RANK: usize = 4;

/// Slice parameters as given: `axes` defaults to `0..starts.len()`, `steps` to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceParams {
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
    pub axes: Option<Vec<i64>>,
    pub steps: Option<Vec<i64>>,
}

impl SliceParams {
    fn from_args(def: &OpDef) -> Result<Option<Self>> {
        let Some(starts) = def.arg_ints("starts")? else {
            return Ok(None);
        };
        let ends = def.arg_ints("ends")?.ok_or_else(|| {
            DispatchError::config(def.context(), "argument 'starts' given without 'ends'")
        })?;
        Ok(Some(Self {
            starts,
            ends,
            axes: def.arg_ints("axes")?,
            steps: def.arg_ints("steps")?,
        }))
    }

    /// Parameters passed as tensors: starts, ends, then optional axes and steps.
    fn from_inputs(context: &str, tensors: &[&Tensor]) -> Result<Self> {
        if tensors.len() < 2 {
            return Err(DispatchError::config(
                context,
                "slice needs 'starts' and 'ends' as arguments or inputs",
            ));
        }
        let read = |t: &Tensor| -> Result<Vec<i64>> {
            Ok(t.to_host()?.into_iter().map(|v| v.round() as i64).collect())
        };
        Ok(Self {
            starts: read(tensors[0])?,
            ends: read(tensors[1])?,
            axes: tensors.get(2).map(|t| read(*t)).transpose()?,
            steps: tensors.get(3).map(|t| read(*t)).transpose()?,
        })
    }
}

/// Per-axis start and step over the full input rank plus the output shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlice {
    pub out_shape: Vec<usize>,
    pub starts: Vec<usize>,
    pub steps: Vec<usize>,
}

/// Normalize slice parameters against `shape`. Negative axes and bounds
/// count from the end; bounds are clamped to the dimension.
pub fn resolve_slice(shape: &[usize], params: &SliceParams) -> Result<ResolvedSlice> {
    let ctx = "slice";
    let rank = shape.len();
    let count = params.starts.len();
    if params.ends.len() != count {
        return Err(DispatchError::config(
            ctx,
            format!("{} starts but {} ends", count, params.ends.len()),
        ));
    }
    let axes = match &params.axes {
        Some(axes) if axes.len() != count => {
            return Err(DispatchError::config(
                ctx,
                format!("{} axes for {} starts", axes.len(), count),
            ))
        }
        Some(axes) => axes.clone(),
        None => (0..count as i64).collect(),
    };
    let steps = match &params.steps {
        Some(steps) if steps.len() != count => {
            return Err(DispatchError::config(
                ctx,
                format!("{} steps for {} starts", steps.len(), count),
            ))
        }
        Some(steps) => steps.clone(),
        None => vec![1; count],
    };

    let mut resolved = ResolvedSlice {
        out_shape: shape.to_vec(),
        starts: vec![0; rank],
        steps: vec![1; rank],
    };
    let mut seen = vec![false; rank];
    for i in 0..count {
        let axis = if axes[i] < 0 { axes[i] + rank as i64 } else { axes[i] };
        if axis < 0 || axis >= rank as i64 {
            return Err(DispatchError::config(
                ctx,
                format!("axis {} out of range for rank {rank}", axes[i]),
            ));
        }
        let axis = axis as usize;
        if std::mem::replace(&mut seen[axis], true) {
            return Err(DispatchError::config(ctx, format!("axis {axis} sliced twice")));
        }
        let step = steps[i];
        if step <= 0 {
            return Err(DispatchError::config(
                ctx,
                format!("step must be positive, got {step}"),
            ));
        }
        let dim = shape[axis] as i64;
        let clamp = |v: i64| if v < 0 { (v + dim).max(0) } else { v.min(dim) };
        let start = clamp(params.starts[i]);
        let end = clamp(params.ends[i]);
        let len = if end > start { (end - start - 1) / step + 1 } else { 0 };
        resolved.out_shape[axis] = len as usize;
        resolved.starts[axis] = start as usize;
        resolved.steps[axis] = step as usize;
    }
    Ok(resolved)
}

fn pad4(values: &[usize], fill: usize) -> [usize; MAX_RANK] {
    let mut out = [fill; MAX_RANK];
    let offset = MAX_RANK - values.len();
    out[offset..].copy_from_slice(values);
    out
}

#[derive(Default)]
pub struct SliceBuilder;

impl OpBuilder for SliceBuilder {
    fn build_op(&self, def: &OpDef, shapes: &dyn ShapeLookup) -> Result<Box<dyn Operation>> {
        let params = SliceParams::from_args(def)?;
        if params.is_none() && def.inputs.len() < 3 {
            return Err(DispatchError::config(
                def.context(),
                "slice needs 'starts' and 'ends' as arguments or inputs",
            ));
        }
        if let (Some(params), Some(shape)) = (&params, shapes.shape(def.input(0)?)) {
            let resolved = resolve_slice(&shape, params)?;
            if let Some(declared) = def.output_shape(0) {
                if declared != resolved.out_shape.as_slice() {
                    return Err(DispatchError::config(
                        def.context(),
                        format!(
                            "declared output {:?} differs from sliced shape {:?}",
                            declared, resolved.out_shape
                        ),
                    ));
                }
            }
        }
        Ok(Box::new(SliceOp {
            context: def.context(),
            params,
            slot: KernelSlot::new(),
        }))
    }
}

pub struct SliceOp {
    context: String,
    params: Option<SliceParams>,
    slot: KernelSlot,
}

impl SliceOp {
    pub fn slot(&self) -> &KernelSlot {
        &self.slot
    }
}

impl Operation for SliceOp {
    fn op_type(&self) -> &str {
        "Slice"
    }

    fn run(&mut self, ctx: &mut OpContext, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_io(&self.context, inputs, 1, outputs)?;
        let input = inputs[0];
        if input.dim_size() > MAX_RANK {
            return Err(DispatchError::config(
                &self.context,
                format!("rank {} exceeds {MAX_RANK}", input.dim_size()),
            ));
        }
        let params = match &self.params {
            Some(params) => params.clone(),
            None => SliceParams::from_inputs(&self.context, &inputs[1..])?,
        };
        let resolved = resolve_slice(input.shape(), &params)?;
        let output = &mut outputs[0];
        output.resize(&resolved.out_shape)?;
        if output.size() == 0 {
            log::debug!("{}: empty slice, nothing to launch", self.context);
            return Ok(());
        }

        let in4 = pad4(input.shape(), 1);
        let out4 = pad4(&resolved.out_shape, 1);
        let starts4 = pad4(&resolved.starts, 0);
        let steps4 = pad4(&resolved.steps, 1);

        let mut options = BuildOptions::new();
        options.data_type(input.dtype());
        let request = KernelRequest::new(program::SLICE, "slice").with_options(options);
        let handle = self.slot.ensure(ctx, request)?;

        let global = [
            to_u32(&self.context, out4[3])?,
            to_u32(&self.context, out4[2])?,
            to_u32(&self.context, out4[0] * out4[1])?,
        ];
        let input_buf = input.memory()?.clone();
        let output_buf = output.mutable_memory()?.clone();
        let mut shape_params = Vec::with_capacity(4 * MAX_RANK);
        shape_params.extend_from_slice(&in4);
        shape_params.extend_from_slice(&out4);
        shape_params.extend_from_slice(&starts4);
        shape_params.extend_from_slice(&steps4);
        let signature = BindingSignature::new(
            &shape_params,
            vec![input_buf.id(), output_buf.id()],
            &global,
        );
        let context = self.context.as_str();
        self.slot.bind(signature, || {
            let mut args = vec![KernelArg::read(&input_buf), KernelArg::write(&output_buf)];
            for value in in4.iter().chain(&out4).chain(&starts4).chain(&steps4) {
                args.push(KernelArg::U32(to_u32(context, *value)?));
            }
            Ok(args)
        })?;

        let lws = default_lws_3d(global, handle.max_work_group_size);
        let future = self
            .slot
            .run(ctx, &tuning_key("slice_kernel", &out4), lws)?;
        ctx.set_future(future);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(starts: &[i64], ends: &[i64], axes: Option<&[i64]>, steps: Option<&[i64]>) -> SliceParams {
        SliceParams {
            starts: starts.to_vec(),
            ends: ends.to_vec(),
            axes: axes.map(<[i64]>::to_vec),
            steps: steps.map(<[i64]>::to_vec),
        }
    }

    #[test]
    fn negative_axis_wraps() {
        let r = resolve_slice(&[3, 5], &params(&[2], &[5], Some(&[-1]), None)).unwrap();
        assert_eq!(r.out_shape, vec![3, 3]);
        assert_eq!(r.starts, vec![0, 2]);
        assert_eq!(r.steps, vec![1, 1]);
    }

    #[test]
    fn axes_default_to_leading_dimensions() {
        let r = resolve_slice(&[4, 6], &params(&[1, 0], &[3, 6], None, Some(&[1, 2]))).unwrap();
        assert_eq!(r.out_shape, vec![2, 3]);
        assert_eq!(r.steps, vec![1, 2]);
    }

    #[test]
    fn huge_step_takes_one_element() {
        let r = resolve_slice(&[5], &params(&[0], &[5], None, Some(&[i64::MAX]))).unwrap();
        assert_eq!(r.out_shape, vec![1]);
        assert_eq!(r.starts, vec![0]);
        let r = resolve_slice(&[5], &params(&[2], &[i64::MAX], None, Some(&[i64::MAX]))).unwrap();
        assert_eq!(r.out_shape, vec![1]);
        assert_eq!(r.starts, vec![2]);
    }

    #[test]
    fn bounds_are_clamped() {
        let r = resolve_slice(&[5], &params(&[-100], &[i64::MAX], None, None)).unwrap();
        assert_eq!(r.out_shape, vec![5]);
        let r = resolve_slice(&[5], &params(&[4], &[2], None, None)).unwrap();
        assert_eq!(r.out_shape, vec![0]);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(resolve_slice(&[5], &params(&[0], &[5], None, Some(&[0]))).is_err());
        assert!(resolve_slice(&[5], &params(&[0], &[5], Some(&[1]), None)).is_err());
        assert!(resolve_slice(&[5, 5], &params(&[0, 0], &[5, 5], Some(&[1, -1]), None)).is_err());
        assert!(resolve_slice(&[5], &params(&[0, 1], &[5], None, None)).is_err());
    }

    #[test]
    fn pad_to_rank_four() {
        assert_eq!(pad4(&[3, 5], 1), [1, 1, 3, 5]);
        assert_eq!(pad4(&[2], 0), [0, 0, 0, 2]);
    }
}
