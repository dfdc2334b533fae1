pub mod host;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Program names shared by every backend.
pub mod program {
    pub const WINOGRAD_TRANSFORM: &str = "winograd_transform";
    pub const MATMUL: &str = "matmul";
    pub const CONV_2D: &str = "conv_2d";
    pub const SLICE: &str = "slice";
    pub const STACK: &str = "stack";
    pub const BATCH_NORM: &str = "batch_norm";
    pub const LRN: &str = "lrn";
}
