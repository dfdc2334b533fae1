use super::{channel_block, HostKernelDef};
use crate::backend::host::HostInvocation;

pub(super) static KERNELS: &[HostKernelDef] = &[HostKernelDef {
    name: "conv_2d",
    entry: conv_2d,
    max_work_group_size: 128,
}];

/// Direct NHWC convolution with OIHW weights, four output channels per item.
///
/// Args: out channel blocks, out width, batch * out height, input, filter,
/// [bias], output, in_h, in_w, in_c, out_h, out_w, out_c, kernel_h, kernel_w,
/// stride_h, stride_w, pad_top, pad_left, dilation_h, dilation_w, relux limit,
/// coefficient.
fn conv_2d(inv: &mut HostInvocation<'_>, gid: [u32; 3]) {
    let (channel_blocks, gws_w, gws_bh) = (inv.u32(0), inv.u32(1), inv.u32(2));
    let [cb, ow, bh] = gid;
    if cb >= channel_blocks || ow >= gws_w || bh >= gws_bh {
        return;
    }
    let mut idx = 5;
    let bias = if inv.has("BIAS") {
        idx += 1;
        Some(idx - 1)
    } else {
        None
    };
    let output = idx;
    let in_h = inv.u32(idx + 1) as i64;
    let in_w = inv.u32(idx + 2) as i64;
    let in_c = inv.u32(idx + 3) as usize;
    let out_h = inv.u32(idx + 4);
    let out_w = inv.u32(idx + 5) as usize;
    let out_c = inv.u32(idx + 6);
    let kernel_h = inv.u32(idx + 7) as usize;
    let kernel_w = inv.u32(idx + 8) as usize;
    let stride_h = inv.u32(idx + 9) as i64;
    let stride_w = inv.u32(idx + 10) as i64;
    let pad_top = inv.i32(idx + 11) as i64;
    let pad_left = inv.i32(idx + 12) as i64;
    let dilation_h = inv.u32(idx + 13) as i64;
    let dilation_w = inv.u32(idx + 14) as i64;
    let limit = inv.f32(idx + 15);
    let coefficient = inv.f32(idx + 16);

    let batch = (bh / out_h.max(1)) as i64;
    let oh = (bh % out_h.max(1)) as i64;
    for o in channel_block(cb, out_c) {
        let mut acc = match bias {
            Some(index) => inv.load(index, o as usize),
            None => 0.0,
        };
        for kh in 0..kernel_h {
            let y = oh * stride_h - pad_top + kh as i64 * dilation_h;
            if y < 0 || y >= in_h {
                continue;
            }
            for kw in 0..kernel_w {
                let x = ow as i64 * stride_w - pad_left + kw as i64 * dilation_w;
                if x < 0 || x >= in_w {
                    continue;
                }
                let in_base = (((batch * in_h + y) * in_w + x) as usize) * in_c;
                for c in 0..in_c {
                    let w = inv.load(
                        4,
                        ((o as usize * in_c + c) * kernel_h + kh) * kernel_w + kw,
                    );
                    acc += inv.load(3, in_base + c) * w;
                }
            }
        }
        let value = inv.activate(acc, limit, coefficient);
        let offset =
            ((batch as usize * out_h as usize + oh as usize) * out_w + ow as usize) * out_c as usize
                + o as usize;
        inv.store(output, offset, value);
    }
}
