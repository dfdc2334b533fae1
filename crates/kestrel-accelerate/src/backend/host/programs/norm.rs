use super::HostKernelDef;
use crate::backend::host::HostInvocation;

pub(super) static BATCH_NORM_KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "batch_norm",
    entry: batch_norm,
    max_work_group_size: 256,
}];

pub(super) static LRN_KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "lrn",
    entry: lrn,
    max_work_group_size: 256,
}];

/// Args: channels, pixels, input, scale, offset, output, relux limit, coefficient.
fn batch_norm(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (channels, pixels) = (inv.u32(0), inv.u32(1));
    let [c, p, _] = gid;
    if c >= channels || p >= pixels {
        return;
    }
    let limit = inv.f32(6);
    let coefficient = inv.f32(7);
    let offset = p as usize * channels as usize + c as usize;
    let x = inv.load(2, offset);
    let scale = inv.load(3, c as usize);
    let shift = inv.load(4, c as usize);
    let value = inv.activate(x * scale + shift, limit, coefficient);
    inv.store(5, offset, value);
}

/// Cross-channel local response normalization.
///
/// Args: channels, pixels, input, output, depth radius, bias, alpha, beta.
fn lrn(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (channels, pixels) = (inv.u32(0), inv.u32(1));
    let [c, p, _] = gid;
    if c >= channels || p >= pixels {
        return;
    }
    let radius = inv.u32(4);
    let bias = inv.f32(5);
    let alpha = inv.f32(6);
    let beta = inv.f32(7);
    let base = p as usize * channels as usize;
    let lo = c.saturating_sub(radius);
    let hi = (c + radius).min(channels - 1);
    let mut sum = 0.0f32;
    for k in lo..=hi {
        let v = inv.load(2, base + k as usize);
        sum += v * v;
    }
    let x = inv.load(2, base + c as usize);
    inv.store(3, base + c as usize, x / (bias + alpha * sum).powf(beta));
}
