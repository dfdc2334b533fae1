use super::{channel_block, HostKernelDef};
use crate::backend::host::HostInvocation;
use crate::winograd::WinogradBlock;

pub(super) static KERNELS: &[HostKernelDef] = &[
    HostKernelDef {
        name: "winograd_transform_2x2",
        entry: input_transform_2x2,
        max_work_group_size: 256,
    },
    HostKernelDef {
        name: "winograd_transform_4x4",
        entry: input_transform_4x4,
        max_work_group_size: 256,
    },
    HostKernelDef {
        name: "winograd_inverse_transform_2x2",
        entry: inverse_transform_2x2,
        max_work_group_size: 256,
    },
    HostKernelDef {
        name: "winograd_inverse_transform_4x4",
        entry: inverse_transform_4x4,
        max_work_group_size: 256,
    },
];

fn input_transform_2x2(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    input_transform(inv, gid, WinogradBlock::Two);
}

fn input_transform_4x4(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    input_transform(inv, gid, WinogradBlock::Four);
}

fn inverse_transform_2x2(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    inverse_transform(inv, gid, WinogradBlock::Two);
}

fn inverse_transform_4x4(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    inverse_transform(inv, gid, WinogradBlock::Four);
}

/// Args: tiles, channel blocks, input (NHWC), output (blk_sqr, C, tiles),
/// height, width, channels, round_h * round_w, round_w, pad_top, pad_left.
fn input_transform(inv: &mut HostInvocation<'_>, gid: [u32; 3], block: WinogradBlock) {
    let (tiles, channel_blocks) = (inv.u32(0), inv.u32(1));
    let [t, cb, _] = gid;
    if t >= tiles || cb >= channel_blocks {
        return;
    }
    let height = inv.u32(4) as i64;
    let width = inv.u32(5) as i64;
    let channels = inv.u32(6);
    let round_hw = inv.u32(7).max(1);
    let round_w = inv.u32(8).max(1);
    let pad_top = inv.u32(9) as i64;
    let pad_left = inv.u32(10) as i64;

    let batch = (t / round_hw) as i64;
    let rem = t % round_hw;
    let tile_h = (rem / round_w) as i64;
    let tile_w = (rem % round_w) as i64;
    let b = block.size() as i64;
    let edge = block.tile();
    let y0 = tile_h * b - pad_top;
    let x0 = tile_w * b - pad_left;

    let mut patch = vec![0.0f32; edge * edge];
    for c in channel_block(cb, channels) {
        for i in 0..edge {
            for j in 0..edge {
                let y = y0 + i as i64;
                let x = x0 + j as i64;
                patch[i * edge + j] = if y >= 0 && y < height && x >= 0 && x < width {
                    let offset = ((batch * height + y) * width + x) * channels as i64 + c as i64;
                    inv.load(2, offset as usize)
                } else {
                    0.0
                };
            }
        }
        let v = block.transform_input(&patch);
        for (k, value) in v.into_iter().enumerate() {
            let offset = (k * channels as usize + c as usize) * tiles as usize + t as usize;
            inv.store(3, offset, value);
        }
    }
}

/// Args: tiles, channel blocks, input (blk_sqr, C, tiles), [bias], output (NHWC),
/// out_height, out_width, channels, round_h * round_w, round_w, relux limit, coefficient.
fn inverse_transform(inv: &mut HostInvocation<'_>, gid: [u32; 3], block: WinogradBlock) {
    let (tiles, channel_blocks) = (inv.u32(0), inv.u32(1));
    let [t, cb, _] = gid;
    if t >= tiles || cb >= channel_blocks {
        return;
    }
    let mut idx = 3;
    let bias = if inv.has("BIAS") {
        idx += 1;
        Some(idx - 1)
    } else {
        None
    };
    let output = idx;
    let out_height = inv.u32(idx + 1) as usize;
    let out_width = inv.u32(idx + 2) as usize;
    let channels = inv.u32(idx + 3);
    let round_hw = inv.u32(idx + 4).max(1);
    let round_w = inv.u32(idx + 5).max(1);
    let limit = inv.f32(idx + 6);
    let coefficient = inv.f32(idx + 7);

    let batch = (t / round_hw) as usize;
    let rem = t % round_hw;
    let tile_h = (rem / round_w) as usize;
    let tile_w = (rem % round_w) as usize;
    let b = block.size();
    let blk_sqr = block.blk_sqr();

    let mut m = vec![0.0f32; blk_sqr];
    for c in channel_block(cb, channels) {
        for (k, slot) in m.iter_mut().enumerate() {
            let offset = (k * channels as usize + c as usize) * tiles as usize + t as usize;
            *slot = inv.load(2, offset);
        }
        let y = block.inverse_transform(&m);
        let bias_value = match bias {
            Some(index) => inv.load(index, c as usize),
            None => 0.0,
        };
        for i in 0..b {
            for j in 0..b {
                let oh = tile_h * b + i;
                let ow = tile_w * b + j;
                if oh >= out_height || ow >= out_width {
                    continue;
                }
                let value = inv.activate(y[i * b + j] + bias_value, limit, coefficient);
                let offset = ((batch * out_height + oh) * out_width + ow) * channels as usize
                    + c as usize;
                inv.store(output, offset, value);
            }
        }
    }
}
