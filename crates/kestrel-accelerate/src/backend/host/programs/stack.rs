use super::HostKernelDef;
use crate::backend::host::HostInvocation;

pub(super) static KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "stack_copy",
    entry: stack_copy,
    max_work_group_size: 256,
}];

/// Copy one `(outer, inner)` input into slot `index` of an `(outer, count, inner)` output.
///
/// Args: inner, outer, input, output, count, index.
fn stack_copy(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (inner, outer) = (inv.u32(0), inv.u32(1));
    let [x, o, _] = gid;
    if x >= inner || o >= outer {
        return;
    }
    let count = inv.u32(4) as usize;
    let index = inv.u32(5) as usize;
    let (x, o, inner) = (x as usize, o as usize, inner as usize);
    let value = inv.load(2, o * inner + x);
    inv.store(3, (o * count + index) * inner + x, value);
}
