mod common;

use std::sync::Arc;

use kestrel_accelerate::autotune::TuneRequest;
use kestrel_accelerate::backend::program;
use kestrel_accelerate::config;
use kestrel_accelerate::ops::{BatchNormBuilder, NoShapes, OpBuilder, OpDefBuilder};
use kestrel_accelerate::{
    HostDevice, KernelRequest, KernelSlot, OpContext, RuntimeOptions, TuningStore,
};
use kestrel_accelerate_api::{KernelArg, LocalWorkSize, Tensor};
use serial_test::serial;

fn run_batch_norm(ctx: &mut OpContext) -> Vec<f32> {
    let device = ctx.device().clone();
    let def = OpDefBuilder::new("BatchNorm", "bn")
        .input("x")
        .input("scale")
        .input("offset")
        .output("y")
        .build();
    let mut op = BatchNormBuilder.build_op(&def, &NoShapes).expect("build");
    let data: Vec<f32> = (0..2 * 3 * 4).map(|v| v as f32).collect();
    let x = Tensor::from_host(&device, "x", &[2, 3, 4], &data).expect("x");
    let scale = Tensor::from_host(&device, "scale", &[4], &[1.0, 2.0, 0.5, -1.0]).expect("scale");
    let offset = Tensor::from_host(&device, "offset", &[4], &[0.0, 1.0, 0.0, 2.0]).expect("offset");
    let mut outputs = vec![Tensor::new(&device, "y", x.dtype())];
    op.run(ctx, &[&x, &scale, &offset], &mut outputs).expect("run");
    ctx.wait().expect("wait");
    outputs[0].to_host().expect("read")
}

#[test]
#[serial]
fn tuning_pass_persists_best_and_replay_reuses_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("autotune").join("host.json");
    let device = HostDevice::shared().expect("host device");

    let store = Arc::new(TuningStore::with_path(&path).expect("store"));
    let tuning = RuntimeOptions {
        tuning: true,
        tuning_repetitions: 1,
        ..Default::default()
    };
    let mut ctx = OpContext::with_store(device.clone(), tuning, store.clone());
    let tuned = run_batch_norm(&mut ctx);

    let key = "batch_norm_kernel_2_3_4";
    let best = store.get(key).expect("tuned entry");
    assert!(path.exists(), "tuning table should be written");

    let reloaded = Arc::new(TuningStore::with_path(&path).expect("reload"));
    assert_eq!(reloaded.get(key), Some(best));
    let mut replay = OpContext::with_store(device, RuntimeOptions::default(), reloaded.clone());
    let replayed = run_batch_norm(&mut replay);
    assert_eq!(tuned, replayed);
    assert_eq!(reloaded.len(), 1);

    // scale/offset applied per channel
    assert_eq!(&tuned[..4], &[0.0, 3.0, 1.0, -1.0]);
}

#[test]
#[serial]
fn process_wide_tuning_flag_enables_tuning() {
    let (device, _) = common::host_context(RuntimeOptions::default());
    let store = Arc::new(TuningStore::new());
    let mut ctx = OpContext::with_store(device, RuntimeOptions::default(), store.clone());
    assert!(!ctx.tuner().options().tuning_enabled());

    config::set_tuning_mode(true);
    let tuning_enabled = ctx.tuner().options().tuning_enabled();
    run_batch_norm(&mut ctx);
    config::set_tuning_mode(false);

    assert!(tuning_enabled);
    assert!(store.get("batch_norm_kernel_2_3_4").is_some());
}

#[test]
#[serial]
fn replay_outside_tuning_mode_is_deterministic() {
    let (device, ctx) = common::host_context(RuntimeOptions::default());
    let input = Tensor::from_host(&device, "x", &[6], &[1.0; 6]).expect("x");
    let output = Tensor::from_host(&device, "y", &[6], &[0.0; 6]).expect("y");
    let input_buf = input.memory().expect("x mem").clone();
    let output_buf = output.memory().expect("y mem").clone();

    let mut slot = KernelSlot::new();
    let handle = slot
        .ensure(&ctx, KernelRequest::new(program::STACK, "stack_copy"))
        .expect("build");
    let global = [6u32, 1];

    let args = vec![
        KernelArg::U32(6),
        KernelArg::U32(1),
        KernelArg::read(&input_buf),
        KernelArg::write(&output_buf),
        KernelArg::U32(1),
        KernelArg::U32(0),
    ];
    let request = TuneRequest {
        key: "stack_kernel_1_1_6",
        kernel: &handle,
        args: &args,
        global: &global,
        default_lws: LocalWorkSize::new_2d(2, 1),
    };
    let (first, future) = ctx.tuner().resolve(&request).expect("first");
    future.wait().expect("first launch");
    let (second, future) = ctx.tuner().resolve(&request).expect("second");
    future.wait().expect("second launch");
    assert_eq!(first, second);
    assert_eq!(first.local.size, [2, 1, 1]);
    assert!(ctx.tuner().store().is_empty());
    assert_eq!(output.to_host().expect("read"), vec![1.0; 6]);
}

#[test]
#[serial]
fn tuning_env_is_applied_when_a_context_is_created() {
    let device = HostDevice::shared().expect("host device");
    config::set_tuning_mode(false);
    std::env::set_var(config::TUNING_ENV, "1");
    let ctx = OpContext::new(device.clone(), RuntimeOptions::default());
    let enabled = ctx.tuner().options().tuning_enabled();

    std::env::set_var(config::TUNING_ENV, "false");
    let ctx = OpContext::new(device, RuntimeOptions::default());
    let disabled = !ctx.tuner().options().tuning_enabled();
    std::env::remove_var(config::TUNING_ENV);
    config::set_tuning_mode(false);

    assert!(enabled);
    assert!(disabled);
}
