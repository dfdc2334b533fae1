#![cfg(feature = "wgpu")]

mod common;

use std::sync::Arc;

use anyhow::Result;
use kestrel_accelerate::backend::wgpu::{WgpuDevice, WgpuDeviceOptions};
use kestrel_accelerate::ops::{Conv2dBuilder, NoShapes, OpBuilder, OpDefBuilder, StackBuilder};
use kestrel_accelerate::{OpContext, RuntimeOptions, TuningStore};
use kestrel_accelerate_api::{DeviceRef, Tensor};
use kestrel_logging::{init_logging, LoggingOptions};

fn wgpu_context() -> Option<(DeviceRef, OpContext)> {
    let device = match WgpuDevice::shared_with(WgpuDeviceOptions::default()) {
        Ok(device) => device,
        Err(err) => {
            eprintln!("skipping wgpu smoke test: {err}");
            return None;
        }
    };
    let ctx = OpContext::with_store(
        device.clone(),
        RuntimeOptions::default(),
        Arc::new(TuningStore::new()),
    );
    Some((device, ctx))
}

#[test]
fn stack_matches_host_results() -> Result<()> {
    let _guard = init_logging(LoggingOptions::default());
    let Some((device, mut ctx)) = wgpu_context() else {
        return Ok(());
    };
    let a = Tensor::from_host(&device, "a", &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    let b = Tensor::from_host(&device, "b", &[2, 3], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0])?;
    let def = OpDefBuilder::new("Stack", "stack")
        .input("a")
        .input("b")
        .output("y")
        .arg("axis", 1)
        .build();
    let mut op = StackBuilder.build_op(&def, &NoShapes)?;
    let mut outputs = vec![Tensor::new(&device, "y", a.dtype())];
    op.run(&mut ctx, &[&a, &b], &mut outputs)?;
    ctx.wait()?;
    assert_eq!(outputs[0].shape(), &[2, 2, 3]);
    assert_eq!(
        outputs[0].to_host()?,
        vec![1.0, 2.0, 3.0, 7.0, 8.0, 9.0, 4.0, 5.0, 6.0, 10.0, 11.0, 12.0]
    );
    Ok(())
}

#[test]
fn winograd_conv_matches_reference() -> Result<()> {
    let Some((device, mut ctx)) = wgpu_context() else {
        return Ok(());
    };
    let in_shape = [1, 8, 8, 4];
    let filter_shape = [4, 4, 3, 3];
    let input = common::pseudo_random(in_shape.iter().product(), 31);
    let filter = common::pseudo_random(filter_shape.iter().product(), 37);
    let x = Tensor::from_host(&device, "x", &in_shape, &input)?;
    let w = Tensor::from_host(&device, "w", &filter_shape, &filter)?;
    let def = OpDefBuilder::new("Conv2D", "conv")
        .input("x")
        .input("w")
        .output("y")
        .arg("wino_block_size", 2)
        .build();
    let mut op = Conv2dBuilder.build_op(&def, &NoShapes)?;
    let mut outputs = vec![Tensor::new(&device, "y", x.dtype())];
    op.run(&mut ctx, &[&x, &w], &mut outputs)?;
    ctx.wait()?;
    let expected =
        common::reference_conv(&input, in_shape, &filter, filter_shape, None, [8, 8], [1, 1], [1, 1]);
    common::assert_close(&outputs[0].to_host()?, &expected, 1e-3);
    Ok(())
}
