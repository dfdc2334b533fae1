use kestrel_accelerate::{metrics, HostDevice, ScratchAllocator, ScratchRequest};
use kestrel_accelerate_api::{BufferContentType, MemoryType};

fn rent(len: usize) -> ScratchRequest {
    ScratchRequest::rent(vec![len], BufferContentType::InOutHeight)
}

#[test]
fn overlapping_leases_never_share_an_address() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 8);

    let a = scratch.allocate("a", rent(64)).expect("a");
    let b = scratch.allocate("b", rent(64)).expect("b");
    assert_ne!(a.base_address(), b.base_address());
    assert!(a.is_rented() && b.is_rented());
}

#[test]
fn released_region_is_reused_by_a_later_lease() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 8);

    let first = scratch.allocate("first", rent(128)).expect("first");
    let address = first.base_address();
    drop(first);
    assert_eq!(scratch.pooled(MemoryType::Buffer), 1);
    let reuses = metrics::global().snapshot().scratch_reuses;

    // a smaller request fits into the pooled region
    let second = scratch.allocate("second", rent(32)).expect("second");
    assert_eq!(second.base_address(), address);
    assert_eq!(second.shape(), &[32]);
    assert_eq!(scratch.pooled(MemoryType::Buffer), 0);
    assert!(metrics::global().snapshot().scratch_reuses > reuses);
}

#[test]
fn best_fit_prefers_the_smallest_sufficient_region() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 8);

    let big = scratch.allocate("big", rent(1024)).expect("big");
    let small = scratch.allocate("small", rent(64)).expect("small");
    let (big_addr, small_addr) = (big.base_address(), small.base_address());
    drop(big);
    drop(small);

    let lease = scratch.allocate("fit", rent(48)).expect("fit");
    assert_eq!(lease.base_address(), small_addr);
    let lease2 = scratch.allocate("fit2", rent(256)).expect("fit2");
    assert_eq!(lease2.base_address(), big_addr);
}

#[test]
fn memory_types_are_pooled_separately() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 8);

    drop(scratch.allocate("buf", rent(16)).expect("buf"));
    let image = scratch
        .allocate("img", rent(16).with_memory_type(MemoryType::Image))
        .expect("img");
    assert_eq!(scratch.pooled(MemoryType::Buffer), 1);
    assert_eq!(image.memory_type(), MemoryType::Image);
}

#[test]
fn promoted_and_persistent_regions_leave_the_pool_alone() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 8);

    let lease = scratch.allocate("kept", rent(16)).expect("kept");
    let kept = lease.promote();
    assert_eq!(kept.shape(), &[16]);
    assert_eq!(scratch.pooled(MemoryType::Buffer), 0);

    let mut persistent = rent(16);
    persistent.rent = false;
    let tensor = scratch.allocate("persistent", persistent).expect("persistent");
    assert!(!tensor.is_rented());
    drop(tensor);
    assert_eq!(scratch.pooled(MemoryType::Buffer), 0);
}

#[test]
fn pool_limit_drops_excess_regions() {
    let device = HostDevice::shared().expect("host device");
    let scratch = ScratchAllocator::new(device, 1);

    let a = scratch.allocate("a", rent(8)).expect("a");
    let b = scratch.allocate("b", rent(8)).expect("b");
    drop(a);
    drop(b);
    assert_eq!(scratch.pooled(MemoryType::Buffer), 1);
    scratch.trim();
    assert_eq!(scratch.pooled(MemoryType::Buffer), 0);
}
