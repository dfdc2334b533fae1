mod common;

use common::{assert_close, host_context, pseudo_random, reference_conv};
use kestrel_accelerate::ops::{Conv2dBuilder, NoShapes, OpBuilder, OpDefBuilder, Operation};
use kestrel_accelerate::{OpContext, RuntimeOptions, WinogradBlock, WinogradConv};
use kestrel_accelerate_api::{Activation, DeviceRef, Tensor};

fn conv_op(block: i64, activation: Option<&str>) -> Box<dyn Operation> {
    let mut builder = OpDefBuilder::new("Conv2D", "conv")
        .input("x")
        .input("w")
        .output("y")
        .arg("wino_block_size", block);
    if let Some(kind) = activation {
        builder = builder.arg("activation", kind);
    }
    Conv2dBuilder
        .build_op(&builder.build(), &NoShapes)
        .expect("build conv")
}

fn run_conv(
    ctx: &mut OpContext,
    device: &DeviceRef,
    op: &mut dyn Operation,
    inputs: &[&Tensor],
) -> (Vec<usize>, Vec<f32>) {
    let mut outputs = vec![Tensor::new(device, "y", inputs[0].dtype())];
    op.run(ctx, inputs, &mut outputs).expect("run conv");
    ctx.wait().expect("wait");
    (outputs[0].shape().to_vec(), outputs[0].to_host().expect("read"))
}

fn identity_filter(channels: usize) -> Vec<f32> {
    let mut filter = vec![0.0f32; channels * channels * 9];
    for c in 0..channels {
        filter[((c * channels + c) * 3 + 1) * 3 + 1] = 1.0;
    }
    filter
}

#[test]
fn identity_filter_reproduces_input_for_both_block_sizes() {
    for block in [2, 4] {
        let (device, mut ctx) = host_context(RuntimeOptions::default());
        let shape = [2, 7, 9, 3];
        let data = pseudo_random(shape.iter().product(), 11);
        let x = Tensor::from_host(&device, "x", &shape, &data).expect("x");
        let w = Tensor::from_host(&device, "w", &[3, 3, 3, 3], &identity_filter(3)).expect("w");

        let mut op = conv_op(block, None);
        let (out_shape, out) = run_conv(&mut ctx, &device, op.as_mut(), &[&x, &w]);
        assert_eq!(out_shape, shape.to_vec());
        assert_close(&out, &data, 1e-3);
    }
}

#[test]
fn winograd_matches_direct_convolution_with_bias_and_relu() {
    let in_shape = [1, 10, 6, 5];
    let filter_shape = [6, 5, 3, 3];
    let input = pseudo_random(in_shape.iter().product(), 3);
    let filter = pseudo_random(filter_shape.iter().product(), 5);
    let bias = pseudo_random(6, 7);
    let expected: Vec<f32> = reference_conv(
        &input,
        in_shape,
        &filter,
        filter_shape,
        Some(&bias),
        [10, 6],
        [1, 1],
        [1, 1],
    )
    .into_iter()
    .map(|v| v.max(0.0))
    .collect();

    for block in [0, 2, 4] {
        let (device, mut ctx) = host_context(RuntimeOptions::default());
        let x = Tensor::from_host(&device, "x", &in_shape, &input).expect("x");
        let w = Tensor::from_host(&device, "w", &filter_shape, &filter).expect("w");
        let b = Tensor::from_host(&device, "b", &[6], &bias).expect("b");
        let mut op = conv_op(block, Some("RELU"));
        let (out_shape, out) = run_conv(&mut ctx, &device, op.as_mut(), &[&x, &w, &b]);
        assert_eq!(out_shape, vec![1, 10, 6, 6]);
        assert_close(&out, &expected, 1e-3);
    }
}

#[test]
fn strided_convolution_skips_winograd() {
    let in_shape = [1, 9, 9, 2];
    let filter_shape = [4, 2, 3, 3];
    let input = pseudo_random(in_shape.iter().product(), 21);
    let filter = pseudo_random(filter_shape.iter().product(), 23);
    let (device, mut ctx) = host_context(RuntimeOptions::default());
    let x = Tensor::from_host(&device, "x", &in_shape, &input).expect("x");
    let w = Tensor::from_host(&device, "w", &filter_shape, &filter).expect("w");

    let def = OpDefBuilder::new("Conv2D", "conv")
        .input("x")
        .input("w")
        .output("y")
        .arg("wino_block_size", 4)
        .arg("strides", vec![2i64, 2])
        .arg("padding", "valid")
        .build();
    let mut op = Conv2dBuilder.build_op(&def, &NoShapes).expect("build");
    let (out_shape, out) = run_conv(&mut ctx, &device, op.as_mut(), &[&x, &w]);
    assert_eq!(out_shape, vec![1, 4, 4, 4]);
    let expected = reference_conv(&input, in_shape, &filter, filter_shape, None, [4, 4], [0, 0], [2, 2]);
    assert_close(&out, &expected, 1e-4);
}

#[test]
fn repeated_runs_reuse_kernels_and_transformed_filter() {
    let (device, mut ctx) = host_context(RuntimeOptions::default());
    let x = Tensor::from_host(&device, "x", &[1, 6, 6, 3], &pseudo_random(108, 1)).expect("x");
    let w = Tensor::from_host(&device, "w", &[8, 3, 3, 3], &pseudo_random(216, 2)).expect("w");
    let mut output = Tensor::new(&device, "y", x.dtype());
    output.resize(&[1, 6, 6, 8]).expect("resize");

    let mut conv = WinogradConv::new(2, Activation::default()).expect("winograd");
    assert_eq!(conv.block(), WinogradBlock::Two);
    conv.run(&mut ctx, &x, &w, None, [2, 2], &mut output).expect("first run");
    ctx.wait().expect("wait");
    let first = output.to_host().expect("read");
    conv.run(&mut ctx, &x, &w, None, [2, 2], &mut output).expect("second run");
    ctx.wait().expect("wait");
    assert_eq!(output.to_host().expect("read"), first);

    for slot in conv.slots() {
        assert_eq!(slot.cache().builds(), 1);
    }
}

#[test]
fn rewritten_filter_weights_are_picked_up() {
    let (device, mut ctx) = host_context(RuntimeOptions::default());
    let shape = [1, 6, 5, 2];
    let data = pseudo_random(shape.iter().product(), 13);
    let x = Tensor::from_host(&device, "x", &shape, &data).expect("x");
    let mut w = Tensor::from_host(&device, "w", &[2, 2, 3, 3], &identity_filter(2)).expect("w");
    let filter_id = w.buffer_id();

    let mut op = conv_op(2, None);
    let (_, out) = run_conv(&mut ctx, &device, op.as_mut(), &[&x, &w]);
    assert_close(&out, &data, 1e-3);

    let doubled: Vec<f32> = identity_filter(2).iter().map(|v| v * 2.0).collect();
    w.copy_from_host(&doubled).expect("rewrite");
    assert_eq!(w.buffer_id(), filter_id);
    let (_, out) = run_conv(&mut ctx, &device, op.as_mut(), &[&x, &w]);
    let expected: Vec<f32> = data.iter().map(|v| v * 2.0).collect();
    assert_close(&out, &expected, 1e-3);
}

#[test]
fn filter_shape_mismatch_is_rejected() {
    let (device, mut ctx) = host_context(RuntimeOptions::default());
    let x = Tensor::from_host(&device, "x", &[1, 4, 4, 2], &[0.0; 32]).expect("x");
    let w = Tensor::from_host(&device, "w", &[1, 3, 3, 3], &[0.0; 27]).expect("w");
    let mut output = Tensor::new(&device, "y", x.dtype());
    output.resize(&[1, 4, 4, 1]).expect("resize");
    let mut conv = WinogradConv::new(4, Activation::default()).expect("winograd");
    let err = conv
        .run(&mut ctx, &x, &w, None, [2, 2], &mut output)
        .unwrap_err();
    assert!(err.is_config());
}
