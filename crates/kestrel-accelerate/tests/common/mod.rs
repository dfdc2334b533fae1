#![allow(dead_code)]

use std::sync::Arc;

use kestrel_accelerate::{HostDevice, OpContext, RuntimeOptions, TuningStore};
use kestrel_accelerate_api::DeviceRef;

/// Host device plus a context with a private tuning table.
pub fn host_context(options: RuntimeOptions) -> (DeviceRef, OpContext) {
    let device = HostDevice::shared().expect("host device");
    let ctx = OpContext::with_store(device.clone(), options, Arc::new(TuningStore::new()));
    (device, ctx)
}

/// Deterministic pseudo-random values in [-1, 1).
pub fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 23) as f32 - 1.0
        })
        .collect()
}

/// Plain NHWC x OIHW correlation with symmetric-start padding.
#[allow(clippy::too_many_arguments)]
pub fn reference_conv(
    input: &[f32],
    in_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: Option<&[f32]>,
    out_hw: [usize; 2],
    pad: [usize; 2],
    stride: [usize; 2],
) -> Vec<f32> {
    let [n, h, w, c] = in_shape;
    let [oc, _, kh, kw] = filter_shape;
    let [oh, ow] = out_hw;
    let mut out = vec![0.0f32; n * oh * ow * oc];
    for b in 0..n {
        for y in 0..oh {
            for x in 0..ow {
                for o in 0..oc {
                    let mut acc = bias.map(|v| v[o]).unwrap_or(0.0);
                    for i in 0..kh {
                        for j in 0..kw {
                            let iy = (y * stride[0] + i) as isize - pad[0] as isize;
                            let ix = (x * stride[1] + j) as isize - pad[1] as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            for ch in 0..c {
                                let v = input[((b * h + iy as usize) * w + ix as usize) * c + ch];
                                let f = filter[((o * c + ch) * kh + i) * kw + j];
                                acc += v * f;
                            }
                        }
                    }
                    out[((b * oh + y) * ow + x) * oc + o] = acc;
                }
            }
        }
    }
    out
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "index {i}: got {a}, expected {e}"
        );
    }
}
