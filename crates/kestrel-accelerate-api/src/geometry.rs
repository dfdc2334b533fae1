use serde::{Deserialize, Serialize};

/// Local work size as persisted in the tuning table.
///
/// `blocks` is the "compute on the fly" dimension: `0` lets the dispatcher
/// decide at launch time how many submissions the last global dimension is
/// split into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalWorkSize {
    pub size: [u32; 3],
    pub blocks: u32,
}

impl LocalWorkSize {
    pub fn new_2d(x: u32, y: u32) -> Self {
        Self {
            size: [x.max(1), y.max(1), 1],
            blocks: 0,
        }
    }

    pub fn new_3d(x: u32, y: u32, z: u32) -> Self {
        Self {
            size: [x.max(1), y.max(1), z.max(1)],
            blocks: 0,
        }
    }

    pub fn with_blocks(mut self, blocks: u32) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn total(&self) -> u64 {
        self.size.iter().map(|&v| v as u64).product()
    }
}

pub fn round_up(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Resolved global/local partition of a kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchGeometry {
    pub dims: u8,
    pub global: [u32; 3],
    pub local: LocalWorkSize,
}

impl LaunchGeometry {
    pub fn new(global: &[u32], local: LocalWorkSize) -> Self {
        let mut g = [1u32; 3];
        for (slot, value) in g.iter_mut().zip(global.iter()) {
            *slot = *value;
        }
        Self {
            dims: global.len().clamp(1, 3) as u8,
            global: g,
            local,
        }
    }

    /// Global size rounded up to a multiple of the local size on every axis.
    pub fn rounded_global(&self) -> [u32; 3] {
        let mut out = self.global;
        for (axis, value) in out.iter_mut().enumerate() {
            *value = round_up(*value, self.local.size[axis]);
        }
        out
    }

    pub fn total_items(&self) -> u64 {
        self.global.iter().map(|&v| v as u64).product()
    }
}

/// One device submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Launch {
    /// Global size actually enqueued (possibly rounded).
    pub global: [u32; 3],
    pub local: [u32; 3],
    /// Global id of the first work item.
    pub offset: [u32; 3],
    pub dims: u8,
}

impl Launch {
    pub fn work_groups(&self) -> [u32; 3] {
        let mut groups = [1u32; 3];
        for axis in 0..3 {
            groups[axis] = self.global[axis].div_ceil(self.local[axis].max(1));
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounded_global_is_multiple_of_local() {
        let geom = LaunchGeometry::new(&[30, 7], LocalWorkSize::new_2d(8, 4));
        assert_eq!(geom.dims, 2);
        assert_eq!(geom.rounded_global(), [32, 8, 1]);
        assert_eq!(geom.total_items(), 210);
    }

    #[test]
    fn work_groups_ceil_divide() {
        let launch = Launch {
            global: [33, 8, 1],
            local: [16, 8, 1],
            offset: [0; 3],
            dims: 2,
        };
        assert_eq!(launch.work_groups(), [3, 1, 1]);
    }
}
