use std::sync::Arc;

use kestrel_accelerate::backend::program;
use kestrel_accelerate::{HostDevice, KernelCache, KernelRequest};
use kestrel_accelerate_api::BuildOptions;

#[test]
fn second_ensure_returns_same_handle_without_rebuilding() {
    let device = HostDevice::shared().expect("host device");
    let mut cache = KernelCache::new();
    let request = KernelRequest::new(program::MATMUL, "matmul");

    let first = cache.ensure(&device, &request).expect("build");
    let second = cache.ensure(&device, &request).expect("cached");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.builds(), 1);
    assert_eq!(cache.len(), 1);
    assert_ne!(first.kernel.name, "matmul", "entry point should be renamed");
    assert!(first.max_work_group_size > 0);
}

#[test]
fn option_order_shares_a_kernel_but_new_options_rebuild() {
    let device = HostDevice::shared().expect("host device");
    let mut cache = KernelCache::new();

    let mut a = BuildOptions::new();
    a.flag("BIAS").flag("USE_RELU");
    let mut b = BuildOptions::new();
    b.flag("USE_RELU").flag("BIAS");
    let first = cache
        .ensure(&device, &KernelRequest::new(program::CONV_2D, "conv_2d").with_options(a))
        .expect("build");
    let same = cache
        .ensure(&device, &KernelRequest::new(program::CONV_2D, "conv_2d").with_options(b))
        .expect("cached");
    assert!(Arc::ptr_eq(&first, &same));

    let mut guarded = BuildOptions::new();
    guarded.flag("BIAS").flag("USE_RELU").out_of_range_check(true);
    let other = cache
        .ensure(
            &device,
            &KernelRequest::new(program::CONV_2D, "conv_2d").with_options(guarded),
        )
        .expect("build");
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(cache.builds(), 2);
}

#[test]
fn unknown_entry_point_is_a_build_error() {
    let device = HostDevice::shared().expect("host device");
    let mut cache = KernelCache::new();
    let err = cache
        .ensure(&device, &KernelRequest::new(program::MATMUL, "no_such_kernel"))
        .unwrap_err();
    assert!(err.is_build());
    assert!(cache.is_empty());

    let err = cache
        .ensure(&device, &KernelRequest::new("missing_program", "matmul"))
        .unwrap_err();
    assert!(err.is_build());
}

#[test]
fn half_precision_is_rejected_by_the_host_device() {
    let device = HostDevice::shared().expect("host device");
    let mut cache = KernelCache::new();
    let mut options = BuildOptions::new();
    options.data_type(kestrel_accelerate_api::DataType::F16);
    let err = cache
        .ensure(
            &device,
            &KernelRequest::new(program::MATMUL, "matmul").with_options(options),
        )
        .unwrap_err();
    assert!(err.is_build());
}
