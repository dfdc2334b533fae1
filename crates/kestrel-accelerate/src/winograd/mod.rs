//! Winograd minimal filtering F(2x2, 3x3) and F(4x4, 3x3).

mod pipeline;

pub use pipeline::{WinogradConv, WinogradPlan};

use kestrel_accelerate_api::{DispatchError, Result};

const BT_2: [f32; 16] = [
    1.0, 0.0, -1.0, 0.0, //
    0.0, 1.0, 1.0, 0.0, //
    0.0, -1.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, -1.0,
];

const G_2: [f32; 12] = [
    1.0, 0.0, 0.0, //
    0.5, 0.5, 0.5, //
    0.5, -0.5, 0.5, //
    0.0, 0.0, 1.0,
];

const AT_2: [f32; 8] = [
    1.0, 1.0, 1.0, 0.0, //
    0.0, 1.0, -1.0, -1.0,
];

const BT_4: [f32; 36] = [
    4.0, 0.0, -5.0, 0.0, 1.0, 0.0, //
    0.0, -4.0, -4.0, 1.0, 1.0, 0.0, //
    0.0, 4.0, -4.0, -1.0, 1.0, 0.0, //
    0.0, -2.0, -1.0, 2.0, 1.0, 0.0, //
    0.0, 2.0, -1.0, -2.0, 1.0, 0.0, //
    0.0, 4.0, 0.0, -5.0, 0.0, 1.0,
];

const G_4: [f32; 18] = [
    1.0 / 4.0, 0.0, 0.0, //
    -1.0 / 6.0, -1.0 / 6.0, -1.0 / 6.0, //
    -1.0 / 6.0, 1.0 / 6.0, -1.0 / 6.0, //
    1.0 / 24.0, 1.0 / 12.0, 1.0 / 6.0, //
    1.0 / 24.0, -1.0 / 12.0, 1.0 / 6.0, //
    0.0, 0.0, 1.0,
];

const AT_4: [f32; 24] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 0.0, //
    0.0, 1.0, -1.0, 2.0, -2.0, 0.0, //
    0.0, 1.0, 1.0, 4.0, 4.0, 0.0, //
    0.0, 1.0, -1.0, 8.0, -8.0, 1.0,
];

/// Output tile size of the transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WinogradBlock {
    Two,
    Four,
}

impl WinogradBlock {
    /// Only 2 and 4 are supported; anything else is a configuration error.
    pub fn from_size(size: i64) -> Result<Self> {
        match size {
            2 => Ok(WinogradBlock::Two),
            4 => Ok(WinogradBlock::Four),
            other => Err(DispatchError::config(
                "winograd",
                format!("unsupported block size {other}; only 2 and 4 are supported"),
            )),
        }
    }

    pub fn size(self) -> usize {
        match self {
            WinogradBlock::Two => 2,
            WinogradBlock::Four => 4,
        }
    }

    /// Input tile edge, `size + 2`.
    pub fn tile(self) -> usize {
        self.size() + 2
    }

    pub fn blk_sqr(self) -> usize {
        self.tile() * self.tile()
    }

    pub fn suffix(self) -> &'static str {
        match self {
            WinogradBlock::Two => "2x2",
            WinogradBlock::Four => "4x4",
        }
    }

    pub(crate) fn bt(self) -> &'static [f32] {
        match self {
            WinogradBlock::Two => &BT_2,
            WinogradBlock::Four => &BT_4,
        }
    }

    fn g(self) -> &'static [f32] {
        match self {
            WinogradBlock::Two => &G_2,
            WinogradBlock::Four => &G_4,
        }
    }

    pub(crate) fn at(self) -> &'static [f32] {
        match self {
            WinogradBlock::Two => &AT_2,
            WinogradBlock::Four => &AT_4,
        }
    }

    /// `Bt d B` for a `tile x tile` input patch.
    pub fn transform_input(self, patch: &[f32]) -> Vec<f32> {
        sandwich(self.bt(), self.tile(), self.tile(), patch)
    }

    /// `G g Gt` for a 3x3 filter.
    pub fn transform_filter(self, filter: &[f32]) -> Vec<f32> {
        sandwich(self.g(), self.tile(), 3, filter)
    }

    /// `At m A` for a `tile x tile` product, yielding a `size x size` output tile.
    pub fn inverse_transform(self, product: &[f32]) -> Vec<f32> {
        sandwich(self.at(), self.size(), self.tile(), product)
    }
}

/// `L X Lt` with `L` of shape `(rows, n)` and `X` of shape `(n, n)`.
fn sandwich(l: &[f32], rows: usize, n: usize, x: &[f32]) -> Vec<f32> {
    let mut tmp = vec![0.0f32; rows * n];
    for r in 0..rows {
        for c in 0..n {
            let mut acc = 0.0;
            for k in 0..n {
                acc += l[r * n + k] * x[k * n + c];
            }
            tmp[r * n + c] = acc;
        }
    }
    let mut out = vec![0.0f32; rows * rows];
    for r in 0..rows {
        for c in 0..rows {
            let mut acc = 0.0;
            for k in 0..n {
                acc += tmp[r * n + k] * l[c * n + k];
            }
            out[r * rows + c] = acc;
        }
    }
    out
}

/// `ceil(out_h / b)`, `ceil(out_w / b)`.
pub fn round_hw(out_h: usize, out_w: usize, block: WinogradBlock) -> (usize, usize) {
    let b = block.size();
    (out_h.div_ceil(b), out_w.div_ceil(b))
}

/// Transform OIHW 3x3 weights into the `(blk_sqr, out_channels, in_channels)` layout.
pub fn transform_filter(
    filter: &[f32],
    out_channels: usize,
    in_channels: usize,
    block: WinogradBlock,
) -> Result<Vec<f32>> {
    let expected = out_channels * in_channels * 9;
    if filter.len() != expected {
        return Err(DispatchError::config(
            "winograd filter",
            format!("expected {expected} weights for a 3x3 filter, got {}", filter.len()),
        ));
    }
    let blk_sqr = block.blk_sqr();
    let mut out = vec![0.0f32; blk_sqr * out_channels * in_channels];
    for o in 0..out_channels {
        for i in 0..in_channels {
            let base = (o * in_channels + i) * 9;
            let u = block.transform_filter(&filter[base..base + 9]);
            for (k, value) in u.iter().enumerate() {
                out[(k * out_channels + o) * in_channels + i] = *value;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlate(patch: &[f32], tile: usize, filter: &[f32], out: usize) -> Vec<f32> {
        let mut y = vec![0.0; out * out];
        for i in 0..out {
            for j in 0..out {
                let mut acc = 0.0;
                for a in 0..3 {
                    for b in 0..3 {
                        acc += patch[(i + a) * tile + j + b] * filter[a * 3 + b];
                    }
                }
                y[i * out + j] = acc;
            }
        }
        y
    }

    #[test]
    fn single_tile_matches_direct_correlation() {
        for block in [WinogradBlock::Two, WinogradBlock::Four] {
            let tile = block.tile();
            let patch: Vec<f32> = (0..tile * tile).map(|v| (v as f32 * 0.37).sin()).collect();
            let filter: Vec<f32> = (0..9).map(|v| (v as f32 * 0.71).cos()).collect();
            let u = block.transform_filter(&filter);
            let v = block.transform_input(&patch);
            let m: Vec<f32> = u.iter().zip(&v).map(|(a, b)| a * b).collect();
            let y = block.inverse_transform(&m);
            let expected = correlate(&patch, tile, &filter, block.size());
            for (got, want) in y.iter().zip(&expected) {
                assert!((got - want).abs() < 1e-4, "{block:?}: {got} vs {want}");
            }
        }
    }

    #[test]
    fn block_size_must_be_two_or_four() {
        assert_eq!(WinogradBlock::from_size(2).unwrap().blk_sqr(), 16);
        assert_eq!(WinogradBlock::from_size(4).unwrap().blk_sqr(), 36);
        for bad in [0, 1, 3, 6, 8] {
            let err = WinogradBlock::from_size(bad).unwrap_err();
            assert!(err.is_config());
            assert!(err.to_string().contains(&bad.to_string()));
        }
    }

    #[test]
    fn round_hw_is_ceiling() {
        assert_eq!(round_hw(5, 7, WinogradBlock::Two), (3, 4));
        assert_eq!(round_hw(8, 8, WinogradBlock::Four), (2, 2));
        assert_eq!(round_hw(9, 1, WinogradBlock::Four), (3, 1));
    }

    #[test]
    fn filter_layout_is_blk_sqr_out_in() {
        let filter = vec![1.0f32; 2 * 3 * 9];
        let t = transform_filter(&filter, 2, 3, WinogradBlock::Two).expect("transform");
        assert_eq!(t.len(), 16 * 2 * 3);
        assert!(transform_filter(&filter[1..], 2, 3, WinogradBlock::Two).is_err());
    }
}
