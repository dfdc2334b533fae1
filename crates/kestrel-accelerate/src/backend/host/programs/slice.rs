use super::HostKernelDef;
use crate::backend::host::HostInvocation;

pub(super) static KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "slice",
    entry: slice,
    max_work_group_size: 256,
}];

/// Strided slice of a rank-4 (leading-one padded) tensor.
///
/// Args: out_d3, out_d2, out_d0 * out_d1, input, output, in dims (4),
/// out dims (4), starts (4), steps (4).
fn slice(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (g0, g1, g2) = (inv.u32(0), inv.u32(1), inv.u32(2));
    let [d3, d2, z] = gid;
    if d3 >= g0 || d2 >= g1 || z >= g2 {
        return;
    }
    let mut in_dims = [0usize; 4];
    let mut out_dims = [0usize; 4];
    let mut starts = [0usize; 4];
    let mut steps = [0usize; 4];
    for axis in 0..4 {
        in_dims[axis] = inv.u32(5 + axis) as usize;
        out_dims[axis] = inv.u32(9 + axis) as usize;
        starts[axis] = inv.u32(13 + axis) as usize;
        steps[axis] = inv.u32(17 + axis) as usize;
    }
    let out1 = out_dims[1].max(1) as u32;
    let coords = [(z / out1) as usize, (z % out1) as usize, d2 as usize, d3 as usize];

    let mut src = 0usize;
    let mut dst = 0usize;
    for axis in 0..4 {
        src = src * in_dims[axis] + starts[axis] + coords[axis] * steps[axis];
        dst = dst * out_dims[axis] + coords[axis];
    }
    let value = inv.load(3, src);
    inv.store(4, dst, value);
}
