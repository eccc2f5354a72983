//! The compute queue both kernels are submitted to.
//!
//! A queue owns the compiled kernels and hands out image and buffer handles.
//! Work submitted to it executes asynchronously and in submission order; the
//! only call that blocks the host is [`ComputeQueue::read_buffer`].

mod software;
#[cfg(feature = "wgpu")]
mod wgpu_queue;

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::{BlockFootprint, Image, Result};

pub use self::software::{SoftwareBuffer, SoftwareQueue, SoftwareTexture};
#[cfg(feature = "wgpu")]
#[cfg_attr(docsrs, doc(cfg(feature = "wgpu")))]
pub use self::wgpu_queue::{WgpuBuffer, WgpuQueue, WgpuTexture};

/// Uniforms of the compression kernels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct CompressionParams {
    pub texel_width: u32,
    pub texel_height: u32,
    pub group_num_x: u32,
    pub channel_mask: u32,
}

/// Uniforms of the squared error reduction kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ReductionParams {
    pub texel_width: u32,
    pub texel_height: u32,
    /// Number of active input elements of this pass.
    pub thread_count: u32,
    /// Non-zero if the pass reads the two images instead of partial sums.
    pub first_step: u32,
}

/// An asynchronous command queue executing the compression and reduction kernels.
pub trait ComputeQueue: Send + Sync {
    /// An image resident on the device.
    type Texture;

    /// A device buffer. Dropping it releases the device memory.
    type Buffer;

    fn name(&self) -> &'static str;

    /// Uploads an image. ASTC images are decoded by the device when read.
    fn upload_image(&self, image: &Image) -> Result<Self::Texture>;

    /// Allocates a zeroed storage buffer of `size` bytes.
    fn create_buffer(&self, label: &str, size: u64) -> Result<Self::Buffer>;

    /// Submits the compression kernel of `footprint`, one thread per block.
    fn dispatch_compression(
        &self,
        footprint: BlockFootprint,
        source: &Self::Texture,
        output: &mut Self::Buffer,
        params: CompressionParams,
        workgroups: [u32; 3],
    ) -> Result<()>;

    /// Submits one pass of the squared error reduction.
    ///
    /// The first pass reads `source` and `target` and ignores `partials`. Later
    /// passes read `partials`, the output of the previous pass.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_reduction(
        &self,
        source: &Self::Texture,
        target: &Self::Texture,
        partials: Option<&Self::Buffer>,
        output: &mut Self::Buffer,
        params: ReductionParams,
        workgroups: [u32; 3],
    ) -> Result<()>;

    /// Blocks until all submitted work writing `buffer` has retired, then
    /// copies its first `size` bytes to the host.
    fn read_buffer(&self, buffer: &Self::Buffer, size: u64, timeout: Duration) -> Result<Vec<u8>>;
}
