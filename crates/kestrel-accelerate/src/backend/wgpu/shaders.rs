//! WGSL sources for every program.
//!
//! Kernels read their scalar arguments from a `u32` parameter buffer at
//! binding 0 (three words of global offset, then the scalars in argument
//! order) and access tensors through `ldN`/`stN` helpers, which report
//! out-of-range indices to the guard buffer when bounds checking is built in.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use kestrel_accelerate_api::options::OUT_OF_RANGE_CHECK;
use kestrel_accelerate_api::ActivationType;

use crate::backend::program;
use crate::winograd::WinogradBlock;

/// Words at the front of the parameter buffer holding the global offset.
pub const OFFSET_WORDS: usize = 3;

/// A kernel body and the number of tensor bindings it declares.
#[derive(Clone, Debug)]
pub struct ShaderSpec {
    pub buffers: usize,
    pub guarded: bool,
    activation: ActivationType,
    body: String,
}

impl ShaderSpec {
    /// Full module text for one work-group size.
    pub fn source(&self, local: [u32; 3]) -> String {
        let mut src = String::with_capacity(self.body.len() + 2048);
        let _ = writeln!(
            src,
            "@group(0) @binding(0) var<storage, read> params: array<u32>;"
        );
        for i in 0..self.buffers {
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read_write> b{i}: array<f32>;",
                i + 1
            );
        }
        if self.guarded {
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read_write> guard_flag: array<f32>;",
                self.buffers + 1
            );
            src.push_str("fn oor() { guard_flag[0] = 1.0; }\n");
        } else {
            src.push_str("fn oor() {}\n");
        }
        src.push_str(
            "fn arg_u32(i: u32) -> u32 { return params[3u + i]; }\n\
             fn arg_i32(i: u32) -> i32 { return bitcast<i32>(params[3u + i]); }\n\
             fn arg_f32(i: u32) -> f32 { return bitcast<f32>(params[3u + i]); }\n",
        );
        for i in 0..self.buffers {
            let _ = writeln!(
                src,
                "fn ld{i}(i: u32) -> f32 {{ if (i >= arrayLength(&b{i})) {{ oor(); return 0.0; }} return b{i}[i]; }}\n\
                 fn st{i}(i: u32, v: f32) {{ if (i >= arrayLength(&b{i})) {{ oor(); return; }} b{i}[i] = v; }}"
            );
        }
        let _ = writeln!(src, "const ACTIVATION: u32 = {}u;", self.activation.code());
        src.push_str(ACTIVATE);
        let _ = writeln!(
            src,
            "@compute @workgroup_size({}, {}, {})\n\
             fn main(@builtin(global_invocation_id) raw: vec3<u32>) {{\n\
             let gid = raw + vec3<u32>(params[0], params[1], params[2]);",
            local[0].max(1),
            local[1].max(1),
            local[2].max(1)
        );
        src.push_str(&self.body);
        src.push_str("}\n");
        src
    }
}

const ACTIVATE: &str = r#"
fn activate(v: f32, limit: f32, coef: f32) -> f32 {
  switch ACTIVATION {
    case 1u: { return max(v, 0.0); }
    case 2u: { return clamp(v, 0.0, limit); }
    case 3u: { return select(v, v * coef, v < 0.0); }
    case 4u: { return tanh(v); }
    case 5u: { return 1.0 / (1.0 + exp(-v)); }
    case 6u: { return select(v, coef * (exp(v) - 1.0), v < 0.0); }
    default: { return v; }
  }
}
"#;

/// Entry points declared by each program.
pub fn entry_points(name: &str) -> Option<&'static [&'static str]> {
    match name {
        program::WINOGRAD_TRANSFORM => Some(&[
            "winograd_transform_2x2",
            "winograd_transform_4x4",
            "winograd_inverse_transform_2x2",
            "winograd_inverse_transform_4x4",
        ]),
        program::MATMUL => Some(&["matmul"]),
        program::CONV_2D => Some(&["conv_2d"]),
        program::SLICE => Some(&["slice"]),
        program::STACK => Some(&["stack_copy"]),
        program::BATCH_NORM => Some(&["batch_norm"]),
        program::LRN => Some(&["lrn"]),
        _ => None,
    }
}

/// Resolve the (possibly renamed) `kernel_name` and specialize it with the
/// build defines. `None` when the program has no such entry point.
pub fn kernel_spec(
    program_name: &str,
    kernel_name: &str,
    defines: &BTreeMap<String, String>,
) -> Option<ShaderSpec> {
    let entry = entry_points(program_name)?.iter().copied().find(|entry| {
        defines
            .get(*entry)
            .filter(|renamed| !renamed.is_empty())
            .map(String::as_str)
            .unwrap_or(entry)
            == kernel_name
    })?;
    let bias = defines.contains_key("BIAS");
    let activation = defines
        .keys()
        .find_map(|name| ActivationType::from_build_macro(name))
        .unwrap_or(ActivationType::NoOp);
    let (buffers, body) = match entry {
        "winograd_transform_2x2" => (2, winograd_transform(WinogradBlock::Two)),
        "winograd_transform_4x4" => (2, winograd_transform(WinogradBlock::Four)),
        "winograd_inverse_transform_2x2" => {
            (2 + bias as usize, winograd_inverse(WinogradBlock::Two, bias))
        }
        "winograd_inverse_transform_4x4" => {
            (2 + bias as usize, winograd_inverse(WinogradBlock::Four, bias))
        }
        "matmul" => (3, MATMUL_BODY.to_string()),
        "conv_2d" => (3 + bias as usize, conv_2d(bias)),
        "slice" => (2, SLICE_BODY.to_string()),
        "stack_copy" => (2, STACK_BODY.to_string()),
        "batch_norm" => (4, BATCH_NORM_BODY.to_string()),
        "lrn" => (2, LRN_BODY.to_string()),
        _ => return None,
    };
    Some(ShaderSpec {
        buffers,
        guarded: defines.contains_key(OUT_OF_RANGE_CHECK),
        activation,
        body,
    })
}

fn matrix_literal(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.9}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn winograd_transform(block: WinogradBlock) -> String {
    let tile = block.tile();
    WINOGRAD_TRANSFORM_BODY
        .replace("%AREA%", &block.blk_sqr().to_string())
        .replace("%TILE%", &tile.to_string())
        .replace("%BLOCK%", &block.size().to_string())
        .replace("%BT%", &matrix_literal(block.bt()))
}

fn winograd_inverse(block: WinogradBlock, bias: bool) -> String {
    let (bias_expr, store) = if bias { ("ld1(c)", "st2") } else { ("0.0", "st1") };
    WINOGRAD_INVERSE_BODY
        .replace("%AREA%", &block.blk_sqr().to_string())
        .replace("%AT_LEN%", &(block.size() * block.tile()).to_string())
        .replace("%TILE%", &block.tile().to_string())
        .replace("%BLOCK%", &block.size().to_string())
        .replace("%AT%", &matrix_literal(block.at()))
        .replace("%BIAS%", bias_expr)
        .replace("%OUT%", store)
}

fn conv_2d(bias: bool) -> String {
    let (bias_expr, store) = if bias { ("ld2(o)", "st3") } else { ("0.0", "st2") };
    CONV_2D_BODY
        .replace("%BIAS%", bias_expr)
        .replace("%OUT%", store)
}

const WINOGRAD_TRANSFORM_BODY: &str = r#"
  let tiles = arg_u32(0u);
  let cblocks = arg_u32(1u);
  let t = gid.x;
  let cb = gid.y;
  if (t >= tiles || cb >= cblocks) { return; }
  let h = i32(arg_u32(2u));
  let w = i32(arg_u32(3u));
  let c_in = arg_u32(4u);
  let round_hw = max(arg_u32(5u), 1u);
  let round_w = max(arg_u32(6u), 1u);
  let pad_top = i32(arg_u32(7u));
  let pad_left = i32(arg_u32(8u));
  let batch = t / round_hw;
  let rem = t % round_hw;
  let y0 = i32(rem / round_w) * %BLOCK% - pad_top;
  let x0 = i32(rem % round_w) * %BLOCK% - pad_left;
  var bmat = array<f32, %AREA%>(%BT%);
  let c_end = min(cb * 4u + 4u, c_in);
  for (var c = cb * 4u; c < c_end; c = c + 1u) {
    var d: array<f32, %AREA%>;
    for (var i = 0; i < %TILE%; i = i + 1) {
      for (var j = 0; j < %TILE%; j = j + 1) {
        let y = y0 + i;
        let x = x0 + j;
        var v = 0.0;
        if (y >= 0 && y < h && x >= 0 && x < w) {
          v = ld0(((batch * u32(h) + u32(y)) * u32(w) + u32(x)) * c_in + c);
        }
        d[i * %TILE% + j] = v;
      }
    }
    var tmp: array<f32, %AREA%>;
    for (var r = 0; r < %TILE%; r = r + 1) {
      for (var col = 0; col < %TILE%; col = col + 1) {
        var acc = 0.0;
        for (var k = 0; k < %TILE%; k = k + 1) {
          acc = acc + bmat[r * %TILE% + k] * d[k * %TILE% + col];
        }
        tmp[r * %TILE% + col] = acc;
      }
    }
    for (var r = 0; r < %TILE%; r = r + 1) {
      for (var col = 0; col < %TILE%; col = col + 1) {
        var acc = 0.0;
        for (var k = 0; k < %TILE%; k = k + 1) {
          acc = acc + tmp[r * %TILE% + k] * bmat[col * %TILE% + k];
        }
        st1((u32(r * %TILE% + col) * c_in + c) * tiles + t, acc);
      }
    }
  }
"#;

const WINOGRAD_INVERSE_BODY: &str = r#"
  let tiles = arg_u32(0u);
  let cblocks = arg_u32(1u);
  let t = gid.x;
  let cb = gid.y;
  if (t >= tiles || cb >= cblocks) { return; }
  let out_h = arg_u32(2u);
  let out_w = arg_u32(3u);
  let c_out = arg_u32(4u);
  let round_hw = max(arg_u32(5u), 1u);
  let round_w = max(arg_u32(6u), 1u);
  let limit = arg_f32(7u);
  let coef = arg_f32(8u);
  let batch = t / round_hw;
  let rem = t % round_hw;
  let tile_h = rem / round_w;
  let tile_w = rem % round_w;
  var amat = array<f32, %AT_LEN%>(%AT%);
  let c_end = min(cb * 4u + 4u, c_out);
  for (var c = cb * 4u; c < c_end; c = c + 1u) {
    var m: array<f32, %AREA%>;
    for (var k = 0u; k < %AREA%u; k = k + 1u) {
      m[k] = ld0((k * c_out + c) * tiles + t);
    }
    var tmp: array<f32, %AT_LEN%>;
    for (var r = 0; r < %BLOCK%; r = r + 1) {
      for (var col = 0; col < %TILE%; col = col + 1) {
        var acc = 0.0;
        for (var k = 0; k < %TILE%; k = k + 1) {
          acc = acc + amat[r * %TILE% + k] * m[k * %TILE% + col];
        }
        tmp[r * %TILE% + col] = acc;
      }
    }
    let bias = %BIAS%;
    for (var i = 0; i < %BLOCK%; i = i + 1) {
      for (var j = 0; j < %BLOCK%; j = j + 1) {
        let oh = tile_h * %BLOCK%u + u32(i);
        let ow = tile_w * %BLOCK%u + u32(j);
        if (oh < out_h && ow < out_w) {
          var acc = 0.0;
          for (var k = 0; k < %TILE%; k = k + 1) {
            acc = acc + tmp[i * %TILE% + k] * amat[j * %TILE% + k];
          }
          %OUT%(((batch * out_h + oh) * out_w + ow) * c_out + c, activate(acc + bias, limit, coef));
        }
      }
    }
  }
"#;

const MATMUL_BODY: &str = r#"
  let col_blocks = arg_u32(0u);
  let batch_rows = arg_u32(1u);
  if (gid.x >= col_blocks || gid.y >= batch_rows) { return; }
  let rows = u32(max(arg_i32(2u), 0));
  let cols = u32(max(arg_i32(3u), 0));
  let depth = u32(max(arg_i32(4u), 0));
  let row_blocks = u32(max(arg_i32(5u), 1));
  let k = gid.y / row_blocks;
  let rb = gid.y % row_blocks;
  let r_end = min(rb * 4u + 4u, rows);
  let c_end = min(gid.x * 4u + 4u, cols);
  for (var r = rb * 4u; r < r_end; r = r + 1u) {
    for (var c = gid.x * 4u; c < c_end; c = c + 1u) {
      var acc = 0.0;
      for (var d = 0u; d < depth; d = d + 1u) {
        acc = acc + ld0((k * rows + r) * depth + d) * ld1((k * depth + d) * cols + c);
      }
      st2((k * rows + r) * cols + c, acc);
    }
  }
"#;

const CONV_2D_BODY: &str = r#"
  if (gid.x >= arg_u32(0u) || gid.y >= arg_u32(1u) || gid.z >= arg_u32(2u)) { return; }
  let in_h = i32(arg_u32(3u));
  let in_w = i32(arg_u32(4u));
  let in_c = arg_u32(5u);
  let out_h = max(arg_u32(6u), 1u);
  let out_w = arg_u32(7u);
  let out_c = arg_u32(8u);
  let kernel_h = arg_u32(9u);
  let kernel_w = arg_u32(10u);
  let stride_h = i32(arg_u32(11u));
  let stride_w = i32(arg_u32(12u));
  let pad_top = arg_i32(13u);
  let pad_left = arg_i32(14u);
  let dilation_h = i32(arg_u32(15u));
  let dilation_w = i32(arg_u32(16u));
  let limit = arg_f32(17u);
  let coef = arg_f32(18u);
  let ow = gid.y;
  let batch = gid.z / out_h;
  let oh = gid.z % out_h;
  let o_end = min(gid.x * 4u + 4u, out_c);
  for (var o = gid.x * 4u; o < o_end; o = o + 1u) {
    var acc = %BIAS%;
    for (var kh = 0u; kh < kernel_h; kh = kh + 1u) {
      let y = i32(oh) * stride_h - pad_top + i32(kh) * dilation_h;
      if (y < 0 || y >= in_h) { continue; }
      for (var kw = 0u; kw < kernel_w; kw = kw + 1u) {
        let x = i32(ow) * stride_w - pad_left + i32(kw) * dilation_w;
        if (x < 0 || x >= in_w) { continue; }
        let base = ((batch * u32(in_h) + u32(y)) * u32(in_w) + u32(x)) * in_c;
        for (var c = 0u; c < in_c; c = c + 1u) {
          acc = acc + ld0(base + c) * ld1(((o * in_c + c) * kernel_h + kh) * kernel_w + kw);
        }
      }
    }
    %OUT%(((batch * out_h + oh) * out_w + ow) * out_c + o, activate(acc, limit, coef));
  }
"#;

const SLICE_BODY: &str = r#"
  if (gid.x >= arg_u32(0u) || gid.y >= arg_u32(1u) || gid.z >= arg_u32(2u)) { return; }
  let out1 = max(arg_u32(8u), 1u);
  var coords = array<u32, 4>(gid.z / out1, gid.z % out1, gid.y, gid.x);
  var src = 0u;
  var dst = 0u;
  for (var a = 0u; a < 4u; a = a + 1u) {
    src = src * arg_u32(3u + a) + arg_u32(11u + a) + coords[a] * arg_u32(15u + a);
    dst = dst * arg_u32(7u + a) + coords[a];
  }
  st1(dst, ld0(src));
"#;

const STACK_BODY: &str = r#"
  let inner = arg_u32(0u);
  let outer = arg_u32(1u);
  if (gid.x >= inner || gid.y >= outer) { return; }
  let count = arg_u32(2u);
  let slot = arg_u32(3u);
  st1((gid.y * count + slot) * inner + gid.x, ld0(gid.y * inner + gid.x));
"#;

const BATCH_NORM_BODY: &str = r#"
  let channels = arg_u32(0u);
  if (gid.x >= channels || gid.y >= arg_u32(1u)) { return; }
  let i = gid.y * channels + gid.x;
  st3(i, activate(ld0(i) * ld1(gid.x) + ld2(gid.x), arg_f32(2u), arg_f32(3u)));
"#;

const LRN_BODY: &str = r#"
  let channels = arg_u32(0u);
  if (gid.x >= channels || gid.y >= arg_u32(1u)) { return; }
  let radius = arg_u32(2u);
  let base = gid.y * channels;
  let lo = select(gid.x - radius, 0u, radius > gid.x);
  let hi = min(gid.x + radius, channels - 1u);
  var total = 0.0;
  for (var k = lo; k <= hi; k = k + 1u) {
    let v = ld0(base + k);
    total = total + v * v;
  }
  st1(base + gid.x, ld0(base + gid.x) / pow(arg_f32(3u) + arg_f32(4u) * total, arg_f32(5u)));
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_accelerate_api::BuildOptions;

    #[test]
    fn renamed_entry_points_resolve() {
        let mut options = BuildOptions::new();
        options.define_symbol("matmul", "k_00ab");
        let spec = kernel_spec(program::MATMUL, "k_00ab", &options.defines()).unwrap();
        assert_eq!(spec.buffers, 3);
        assert!(kernel_spec(program::MATMUL, "matmul", &options.defines()).is_none());
    }

    #[test]
    fn bias_adds_a_binding_and_guard_is_last() {
        let mut options = BuildOptions::new();
        options.bias(true).out_of_range_check(true);
        let spec = kernel_spec(program::CONV_2D, "conv_2d", &options.defines()).unwrap();
        assert_eq!(spec.buffers, 4);
        assert!(spec.guarded);
        let src = spec.source([8, 4, 1]);
        assert!(src.contains("@binding(5) var<storage, read_write> guard_flag"));
        assert!(src.contains("@workgroup_size(8, 4, 1)"));
        assert!(src.contains("var acc = ld2(o);"));
    }

    #[test]
    fn winograd_sources_are_fully_substituted() {
        for name in ["winograd_transform_4x4", "winograd_inverse_transform_2x2"] {
            let spec = kernel_spec(program::WINOGRAD_TRANSFORM, name, &BTreeMap::new()).unwrap();
            let src = spec.source([16, 4, 1]);
            for token in ["%AREA%", "%TILE%", "%BLOCK%", "%BT%", "%AT%", "%AT_LEN%", "%BIAS%", "%OUT%"] {
                assert!(!src.contains(token), "{name} still contains {token}");
            }
        }
    }
}
