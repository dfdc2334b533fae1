//! Kernel tables of the host backend, one per program.
//!
//! Every kernel receives its true global size as the leading `u32`
//! arguments and returns early for work items beyond it, so launches with a
//! rounded-up global size are safe.

mod conv2d;
mod matmul;
mod norm;
mod slice;
mod stack;
mod winograd;

use super::HostInvocation;
use crate::backend::program;

pub type KernelEntry = fn(&mut HostInvocation<'_>, [u32; 3]);

pub struct HostKernelDef {
    pub name: &'static str,
    pub entry: KernelEntry,
    pub max_work_group_size: u32,
}

pub fn lookup(name: &str) -> Option<&'static [HostKernelDef]> {
    match name {
        program::WINOGRAD_TRANSFORM => Some(winograd::KERNELS),
        program::MATMUL => Some(matmul::KERNELS),
        program::CONV_2D => Some(conv2d::KERNELS),
        program::SLICE => Some(slice::KERNELS),
        program::STACK => Some(stack::KERNELS),
        program::BATCH_NORM => Some(norm::BATCH_NORM_KERNELS),
        program::LRN => Some(norm::LRN_KERNELS),
        _ => None,
    }
}

/// Channels `[block * 4, min(block * 4 + 4, channels))`.
pub(crate) fn channel_block(block: u32, channels: u32) -> std::ops::Range<u32> {
    let start = block * 4;
    start..(start + 4).min(channels)
}
