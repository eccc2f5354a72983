use tracing::debug;

use crate::header::{ASTC_BLOCK_BYTE_SIZE, ASTC_HEADER_SIZE};

/// Threads per compression workgroup, laid out as an 8x8 tile.
pub const GROUP_THREADS: u32 = 8 * 8;

/// Block grid and workgroup counts for one compression dispatch.
///
/// Every thread of a workgroup compresses one block. Blocks are assigned
/// linearly: `(group_y * group_num_x + group_x) * 64 + local_index`.
///
/// The X group count is tied to the block column count rather than derived
/// from the thread capacity, so the Y count is whatever is left of
/// `ceil(total_blocks / 64)` after spreading it over `group_num_x` columns.
/// This over-allocates groups for wide images, but always covers every block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DispatchGeometry {
    pub block_columns: u32,
    pub block_rows: u32,
    pub total_blocks: u32,
    pub group_num_x: u32,
    pub group_num_y: u32,
}

impl DispatchGeometry {
    /// Computes the geometry for an image of `width` x `height` texels and a
    /// square block footprint of `edge` texels.
    ///
    /// Partial blocks at the right and bottom border count as full blocks.
    /// All inputs must be positive.
    pub fn new(width: u32, height: u32, edge: u32) -> Self {
        debug_assert!(width > 0 && height > 0 && edge > 0);

        let block_columns = width.div_ceil(edge);
        let block_rows = height.div_ceil(edge);
        let total_blocks = block_columns * block_rows;

        let group_count = total_blocks.div_ceil(GROUP_THREADS);
        let group_num_x = block_columns;
        let group_num_y = group_count.div_ceil(group_num_x);

        let geometry = Self {
            block_columns,
            block_rows,
            total_blocks,
            group_num_x,
            group_num_y,
        };

        debug!(
            width,
            height,
            edge,
            block_columns,
            block_rows,
            total_blocks,
            group_num_x,
            group_num_y,
            "computed dispatch geometry"
        );

        geometry
    }

    /// Workgroup counts to pass to the dispatch call.
    pub const fn workgroups(&self) -> [u32; 3] {
        [self.group_num_x, self.group_num_y, 1]
    }

    /// Number of threads the dispatch launches.
    pub const fn thread_count(&self) -> u64 {
        self.group_num_x as u64 * self.group_num_y as u64 * GROUP_THREADS as u64
    }

    /// Byte size of the raw block stream.
    pub const fn blocks_byte_size(&self) -> usize {
        self.total_blocks as usize * ASTC_BLOCK_BYTE_SIZE
    }

    /// Byte size of the container header plus the block stream.
    pub const fn artifact_byte_size(&self) -> usize {
        ASTC_HEADER_SIZE + self.blocks_byte_size()
    }
}
