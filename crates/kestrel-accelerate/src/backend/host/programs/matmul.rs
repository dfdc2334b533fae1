use super::HostKernelDef;
use crate::backend::host::HostInvocation;

pub(super) static KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "matmul",
    entry: matmul,
    max_work_group_size: 256,
}];

/// Batched `(k, rows, depth) x (k, depth, cols) -> (k, rows, cols)`, 4x4 outputs per item.
///
/// Args: column blocks, k * row blocks, lhs, rhs, output, rows, cols, depth, row blocks.
fn matmul(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (col_blocks, batch_row_blocks) = (inv.u32(0), inv.u32(1));
    let [x, y, _] = gid;
    if x >= col_blocks || y >= batch_row_blocks {
        return;
    }
    let rows = inv.i32(5).max(0) as usize;
    let cols = inv.i32(6).max(0) as usize;
    let depth = inv.i32(7).max(0) as usize;
    let row_blocks = inv.i32(8).max(1) as u32;

    let k = (y / row_blocks) as usize;
    let rb = (y % row_blocks) as usize;
    let row_range = rb * 4..(rb * 4 + 4).min(rows);
    let col_range = x as usize * 4..(x as usize * 4 + 4).min(cols);
    for r in row_range {
        for c in col_range.clone() {
            let mut acc = 0.0f32;
            for d in 0..depth {
                let lhs = inv.load(2, (k * rows + r) * depth + d);
                let rhs = inv.load(3, (k * depth + d) * cols + c);
                acc += lhs * rhs;
            }
            inv.store(4, (k * rows + r) * cols + c, acc);
        }
    }
}
