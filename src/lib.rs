//! # astc_compression
//!
//! ASTC texture block compression and quality measurement using WGPU compute shader.
//!
//! The crate drives an externally supplied ASTC compression kernel and wraps its block
//! stream into an `.astc` container. The quality loss is measured as PSNR with a
//! multi-pass GPU reduction, so only four floats travel back to the host. A CPU
//! reference implementation of the metric is provided for cross-validation.
//!
//! ## Supported block footprints
//!
//!  * 4x4 RGB
//!  * 4x4 RGBA
//!  * 6x6 RGB
//!  * 6x6 RGBA
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use astc_compression::{
//!     AstcCompressor, BlockFootprint, Image, PsnrEvaluator, Settings, SoftwareQueue,
//!     VoidExtentKernel,
//! };
//!
//! let queue = Arc::new(SoftwareQueue::new(VoidExtentKernel));
//! let compressor = AstcCompressor::new(queue.clone(), Settings::default());
//!
//! let image = Image::from_rgba8(16, 16, vec![128; 16 * 16 * 4]).unwrap();
//! let compressed = compressor.run(&image, BlockFootprint::Rgba4x4).unwrap();
//! assert_eq!(compressed.data().len(), 272);
//!
//! let evaluator = PsnrEvaluator::new(queue, Settings::default());
//! let psnr = evaluator.evaluate(&image, &compressed).unwrap();
//! assert!(psnr.psnr().is_some());
//! ```
mod block_compressor;
mod error;
mod geometry;
mod header;
mod image;
mod kernel;
mod psnr;
pub mod queue;
mod settings;

pub use block_compressor::AstcCompressor;
pub use error::{AstcError, Result};
pub use geometry::{DispatchGeometry, GROUP_THREADS};
pub use header::{
    AstcHeader, ASTC_BLOCK_BYTE_SIZE, ASTC_HEADER_SIZE, ASTC_MAGIC, ASTC_MAX_DIMENSION,
};
pub use image::{Image, PixelFormat};
pub use kernel::{BlockDecoder, BlockKernel, TexelWindow, VoidExtentKernel};
pub use psnr::{
    reference_psnr, PsnrEvaluator, PsnrOutcome, PsnrReport, ReductionPass, ReductionPlan,
    REDUCTION_GROUP_SIZE,
};
pub use queue::{ComputeQueue, SoftwareQueue};
#[cfg(feature = "wgpu")]
#[cfg_attr(docsrs, doc(cfg(feature = "wgpu")))]
pub use queue::WgpuQueue;
pub use settings::{ChannelSum, Settings};

/// Block footprints supported by this crate.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum BlockFootprint {
    /// 4x4 blocks, RGB channels (8.00 bpp)
    Rgb4x4,
    /// 4x4 blocks, RGBA channels (8.00 bpp)
    Rgba4x4,
    /// 6x6 blocks, RGB channels (3.56 bpp)
    Rgb6x6,
    /// 6x6 blocks, RGBA channels (3.56 bpp)
    Rgba6x6,
}

impl BlockFootprint {
    pub const ALL: [BlockFootprint; 4] = [
        BlockFootprint::Rgb4x4,
        BlockFootprint::Rgba4x4,
        BlockFootprint::Rgb6x6,
        BlockFootprint::Rgba6x6,
    ];

    /// Edge length of the square block in texels.
    pub const fn edge_length(self) -> u32 {
        match self {
            BlockFootprint::Rgb4x4 | BlockFootprint::Rgba4x4 => 4,
            BlockFootprint::Rgb6x6 | BlockFootprint::Rgba6x6 => 6,
        }
    }

    /// Bit mask of the encoded channels, red in bit 0 to alpha in bit 3.
    pub const fn channel_mask(self) -> u32 {
        match self {
            BlockFootprint::Rgb4x4 | BlockFootprint::Rgb6x6 => 0b0111,
            BlockFootprint::Rgba4x4 | BlockFootprint::Rgba6x6 => 0b1111,
        }
    }

    pub const fn has_alpha(self) -> bool {
        self.channel_mask() & 0b1000 != 0
    }

    /// Index of the kernel inside the compression shader module.
    pub const fn kernel_index(self) -> u32 {
        match self {
            BlockFootprint::Rgb4x4 => 0,
            BlockFootprint::Rgba4x4 => 1,
            BlockFootprint::Rgb6x6 => 2,
            BlockFootprint::Rgba6x6 => 3,
        }
    }

    /// Returns the byte size of the raw block stream for the given dimensions.
    ///
    /// Width and height are rounded up to the next multiple of the block edge.
    pub const fn blocks_byte_size(self, width: u32, height: u32) -> usize {
        let edge = self.edge_length() as usize;
        let block_width = (width as usize).div_ceil(edge);
        let block_height = (height as usize).div_ceil(edge);
        block_width * block_height * ASTC_BLOCK_BYTE_SIZE
    }

    const fn name(self) -> &'static str {
        match self {
            BlockFootprint::Rgb4x4 => "astc rgb 4x4",
            BlockFootprint::Rgba4x4 => "astc rgba 4x4",
            BlockFootprint::Rgb6x6 => "astc rgb 6x6",
            BlockFootprint::Rgba6x6 => "astc rgba 6x6",
        }
    }

    /// Name of the compute shader entry point compressing this footprint.
    pub const fn entry_point(self) -> &'static str {
        match self {
            BlockFootprint::Rgb4x4 => "compress_astc_rgb_4x4",
            BlockFootprint::Rgba4x4 => "compress_astc_rgba_4x4",
            BlockFootprint::Rgb6x6 => "compress_astc_rgb_6x6",
            BlockFootprint::Rgba6x6 => "compress_astc_rgba_6x6",
        }
    }
}

impl std::fmt::Display for BlockFootprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BlockFootprint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let name = s.to_lowercase();
        let name = name.strip_prefix("compress_").unwrap_or(&name);

        match name {
            "rgb4x4" | "rgb_4x4" | "astc_rgb_4x4" => Ok(BlockFootprint::Rgb4x4),
            "rgba4x4" | "rgba_4x4" | "astc_rgba_4x4" => Ok(BlockFootprint::Rgba4x4),
            "rgb6x6" | "rgb_6x6" | "astc_rgb_6x6" => Ok(BlockFootprint::Rgb6x6),
            "rgba6x6" | "rgba_6x6" | "astc_rgba_6x6" => Ok(BlockFootprint::Rgba6x6),
            _ => Err(format!("unknown block footprint '{s}'")),
        }
    }
}
