mod common;

use kestrel_accelerate::backend::program;
use kestrel_accelerate::ops::{NoShapes, OpBuilder, OpDefBuilder, StackBuilder};
use kestrel_accelerate::{BindingSignature, KernelRequest, KernelSlot, RuntimeOptions};
use kestrel_accelerate_api::{DispatchError, KernelArg, LocalWorkSize, Tensor};

fn guarded() -> RuntimeOptions {
    RuntimeOptions {
        out_of_range_check: true,
        ..Default::default()
    }
}

/// Copies eight values into a four-element output.
fn overflowing_copy(options: RuntimeOptions) -> (Result<(), DispatchError>, Vec<f32>, bool) {
    let (device, ctx) = common::host_context(options);
    let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
    let input = Tensor::from_host(&device, "x", &[8], &data).expect("x");
    let output = Tensor::from_host(&device, "y", &[4], &[-1.0; 4]).expect("y");
    let input_buf = input.memory().expect("x mem").clone();
    let output_buf = output.memory().expect("y mem").clone();

    let mut slot = KernelSlot::new();
    slot.ensure(&ctx, KernelRequest::new(program::STACK, "stack_copy"))
        .expect("build");
    let global = [8u32, 1];
    let signature = BindingSignature::new(&[8], vec![input_buf.id(), output_buf.id()], &global);
    slot.bind(signature, || {
        Ok(vec![
            KernelArg::read(&input_buf),
            KernelArg::write(&output_buf),
            KernelArg::U32(1),
            KernelArg::U32(0),
        ])
    })
    .expect("bind");
    let result = slot
        .run(&ctx, "stack_kernel_1_1_8", LocalWorkSize::new_2d(4, 1))
        .and_then(|future| future.wait().map(|_| ()));
    (result, output.to_host().expect("read"), slot.guard_enabled())
}

#[test]
fn guarded_launch_reports_out_of_range_access() {
    let (result, written, enabled) = overflowing_copy(guarded());
    assert!(enabled);
    match result {
        Err(DispatchError::OutOfRange { kernel }) => assert!(!kernel.is_empty()),
        other => panic!("expected an out-of-range error, got {other:?}"),
    }
    // in-range stores still land
    assert_eq!(written, vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn unguarded_launch_drops_stray_stores_silently() {
    let (result, written, enabled) = overflowing_copy(RuntimeOptions::default());
    assert!(!enabled);
    assert!(result.is_ok());
    assert_eq!(written, vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn guard_passes_well_behaved_operators() {
    let (device, mut ctx) = common::host_context(guarded());
    let a = Tensor::from_host(&device, "a", &[3], &[1.0, 2.0, 3.0]).expect("a");
    let b = Tensor::from_host(&device, "b", &[3], &[4.0, 5.0, 6.0]).expect("b");
    let def = OpDefBuilder::new("Stack", "stack")
        .input("a")
        .input("b")
        .output("y")
        .arg("axis", 0)
        .build();
    let mut op = StackBuilder.build_op(&def, &NoShapes).expect("build");
    let mut outputs = vec![Tensor::new(&device, "y", a.dtype())];
    op.run(&mut ctx, &[&a, &b], &mut outputs).expect("run");
    ctx.wait().expect("wait");
    assert_eq!(
        outputs[0].to_host().expect("read"),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
}
