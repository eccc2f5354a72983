//! CPU emulation of the compute queue.
//!
//! Kernels run with the same thread and workgroup indexing as the shaders, so
//! a dispatch geometry that fails to cover the image leaves zeroed blocks here
//! just as it would on a GPU. Workgroups run in parallel with the `rayon` feature.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
#[cfg(feature = "rayon")]
use strength_reduce::StrengthReducedUsize;
use tracing::trace;

use super::{CompressionParams, ComputeQueue, ReductionParams};
use crate::{
    AstcError, BlockDecoder, BlockFootprint, BlockKernel, Image, Result, TexelWindow,
    ASTC_BLOCK_BYTE_SIZE, GROUP_THREADS, REDUCTION_GROUP_SIZE,
};

const ACCUMULATOR_BYTE_SIZE: usize = 16;

/// A decoded RGBA8 image held in host memory.
#[derive(Clone, Debug)]
pub struct SoftwareTexture {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl SoftwareTexture {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// A byte buffer held in host memory.
#[derive(Clone, Debug)]
pub struct SoftwareBuffer {
    label: String,
    data: Vec<u8>,
}

impl SoftwareBuffer {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl Drop for SoftwareBuffer {
    fn drop(&mut self) {
        trace!(label = %self.label, size = self.data.len(), "released buffer");
    }
}

/// Executes the compression and reduction kernels on the CPU.
#[derive(Clone, Default)]
pub struct SoftwareQueue {
    kernel: Option<Arc<dyn BlockKernel>>,
    decoder: Option<Arc<dyn BlockDecoder>>,
}

impl SoftwareQueue {
    /// Creates a queue compressing with `kernel` and decoding ASTC uploads with it.
    pub fn new<K>(kernel: K) -> Self
    where
        K: BlockKernel + BlockDecoder + 'static,
    {
        let kernel = Arc::new(kernel);
        Self {
            kernel: Some(kernel.clone()),
            decoder: Some(kernel),
        }
    }

    /// Creates a queue from separate parts. Missing parts make the operations
    /// that need them fail with [`AstcError::PreconditionMissing`].
    pub fn from_parts(
        kernel: Option<Arc<dyn BlockKernel>>,
        decoder: Option<Arc<dyn BlockDecoder>>,
    ) -> Self {
        Self { kernel, decoder }
    }
}

impl std::fmt::Debug for SoftwareQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareQueue")
            .field("kernel", &self.kernel.is_some())
            .field("decoder", &self.decoder.is_some())
            .finish()
    }
}

/// Splits a linear index into grid coordinates.
#[derive(Copy, Clone)]
struct GridIndexer {
    #[cfg(feature = "rayon")]
    columns: StrengthReducedUsize,
    #[cfg(not(feature = "rayon"))]
    columns: usize,
}

impl GridIndexer {
    fn new(columns: u32) -> Self {
        Self {
            #[cfg(feature = "rayon")]
            columns: StrengthReducedUsize::new(columns as usize),
            #[cfg(not(feature = "rayon"))]
            columns: columns as usize,
        }
    }

    #[inline(always)]
    fn split(&self, index: usize) -> (usize, usize) {
        (index % self.columns, index / self.columns)
    }
}

fn check_workgroups(workgroups: [u32; 3]) -> Result<usize> {
    if workgroups.contains(&0) {
        return Err(AstcError::DispatchFailed(format!(
            "empty dispatch {workgroups:?}"
        )));
    }
    if workgroups[2] != 1 {
        return Err(AstcError::DispatchFailed(format!(
            "kernels are two dimensional, got {workgroups:?}"
        )));
    }
    Ok(workgroups[0] as usize * workgroups[1] as usize)
}

fn read_accumulator(data: &[u8], index: usize) -> [f32; 4] {
    let offset = index * ACCUMULATOR_BYTE_SIZE;
    let mut value = [0.0; 4];
    for (channel, chunk) in data[offset..offset + ACCUMULATOR_BYTE_SIZE]
        .chunks_exact(4)
        .enumerate()
    {
        value[channel] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    value
}

impl ComputeQueue for SoftwareQueue {
    type Texture = SoftwareTexture;
    type Buffer = SoftwareBuffer;

    fn name(&self) -> &'static str {
        "software"
    }

    fn upload_image(&self, image: &Image) -> Result<Self::Texture> {
        let rgba = image.to_rgba8(self.decoder.as_deref())?.into_owned();

        Ok(SoftwareTexture {
            width: image.width(),
            height: image.height(),
            rgba,
        })
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<Self::Buffer> {
        let size = usize::try_from(size).map_err(|_| {
            AstcError::PreconditionMissing(format!("host memory for {size} byte buffer"))
        })?;

        trace!(label, size, "allocated buffer");

        Ok(SoftwareBuffer {
            label: label.to_string(),
            data: vec![0; size],
        })
    }

    fn dispatch_compression(
        &self,
        footprint: BlockFootprint,
        source: &Self::Texture,
        output: &mut Self::Buffer,
        params: CompressionParams,
        workgroups: [u32; 3],
    ) -> Result<()> {
        let kernel = self.kernel.as_deref().ok_or_else(|| {
            AstcError::PreconditionMissing(format!("compression kernel for {footprint}"))
        })?;
        let group_count = check_workgroups(workgroups)?;

        let edge = footprint.edge_length();
        let block_columns = params.texel_width.div_ceil(edge);
        let block_rows = params.texel_height.div_ceil(edge);
        let total_blocks = block_columns as usize * block_rows as usize;

        let expected = total_blocks * ASTC_BLOCK_BYTE_SIZE;
        if output.data.len() < expected {
            return Err(AstcError::DispatchFailed(format!(
                "output buffer '{}' holds {} bytes, kernel writes {expected}",
                output.label,
                output.data.len()
            )));
        }

        let indexer = GridIndexer::new(block_columns);
        let group_byte_size = GROUP_THREADS as usize * ASTC_BLOCK_BYTE_SIZE;
        let blocks = &mut output.data[..expected];

        #[cfg(feature = "rayon")]
        let groups = blocks.par_chunks_mut(group_byte_size);
        #[cfg(not(feature = "rayon"))]
        let groups = blocks.chunks_mut(group_byte_size);

        groups
            .enumerate()
            .take(group_count)
            .for_each(|(group_index, group)| {
                for (local_index, block) in group.chunks_exact_mut(ASTC_BLOCK_BYTE_SIZE).enumerate()
                {
                    let block_index = group_index * GROUP_THREADS as usize + local_index;
                    let (block_x, block_y) = indexer.split(block_index);

                    let window = TexelWindow::load(
                        &source.rgba,
                        source.width,
                        source.height,
                        footprint,
                        block_x as u32,
                        block_y as u32,
                    );
                    block.copy_from_slice(&kernel.compress_block(footprint, &window));
                }
            });

        Ok(())
    }

    fn dispatch_reduction(
        &self,
        source: &Self::Texture,
        target: &Self::Texture,
        partials: Option<&Self::Buffer>,
        output: &mut Self::Buffer,
        params: ReductionParams,
        workgroups: [u32; 3],
    ) -> Result<()> {
        let group_count = check_workgroups(workgroups)?;
        let first_step = params.first_step != 0;
        let active = params.thread_count as usize;
        let group_size = REDUCTION_GROUP_SIZE as usize;

        let partials = match (first_step, partials) {
            (true, _) => None,
            (false, Some(partials)) => Some(partials),
            (false, None) => {
                return Err(AstcError::DispatchFailed(
                    "reduction pass without partial sums".to_string(),
                ))
            }
        };

        if first_step {
            let texels = params.texel_width as usize * params.texel_height as usize;
            if active > texels || source.rgba.len() < texels * 4 || target.rgba.len() < texels * 4
            {
                return Err(AstcError::DispatchFailed(format!(
                    "reduction over {active} texels exceeds the bound images"
                )));
            }
        } else if let Some(partials) = partials {
            if partials.data.len() < active * ACCUMULATOR_BYTE_SIZE {
                return Err(AstcError::DispatchFailed(format!(
                    "partial sum buffer '{}' holds fewer than {active} accumulators",
                    partials.label
                )));
            }
        }

        let written_groups = active.div_ceil(group_size).min(group_count);
        let expected = written_groups * ACCUMULATOR_BYTE_SIZE;
        if output.data.len() < expected {
            return Err(AstcError::DispatchFailed(format!(
                "output buffer '{}' holds {} bytes, kernel writes {expected}",
                output.label,
                output.data.len()
            )));
        }

        let indexer = GridIndexer::new(params.texel_width);
        let load_element = |index: usize| -> [f32; 4] {
            match partials {
                Some(partials) => read_accumulator(&partials.data, index),
                None => {
                    let (x, y) = indexer.split(index);
                    let offset = (y * params.texel_width as usize + x) * 4;
                    let mut squared = [0.0; 4];
                    for (channel, value) in squared.iter_mut().enumerate() {
                        let a = source.rgba[offset + channel] as f32 / 255.0;
                        let b = target.rgba[offset + channel] as f32 / 255.0;
                        *value = (a - b) * (a - b);
                    }
                    squared
                }
            }
        };

        let sums = &mut output.data[..expected];

        #[cfg(feature = "rayon")]
        let groups = sums.par_chunks_mut(ACCUMULATOR_BYTE_SIZE);
        #[cfg(not(feature = "rayon"))]
        let groups = sums.chunks_mut(ACCUMULATOR_BYTE_SIZE);

        groups.enumerate().for_each(|(group_index, accumulator)| {
            let start = group_index * group_size;
            let end = (start + group_size).min(active);

            let mut sum = [0.0f32; 4];
            for index in start..end {
                let element = load_element(index);
                for (total, value) in sum.iter_mut().zip(element) {
                    *total += value;
                }
            }

            for (channel, total) in sum.iter().enumerate() {
                accumulator[channel * 4..channel * 4 + 4].copy_from_slice(&total.to_le_bytes());
            }
        });

        Ok(())
    }

    fn read_buffer(&self, buffer: &Self::Buffer, size: u64, _timeout: Duration) -> Result<Vec<u8>> {
        let size = size as usize;
        buffer
            .data
            .get(..size)
            .map(<[u8]>::to_vec)
            .ok_or(AstcError::BufferSizeMismatch {
                expected: size,
                actual: buffer.data.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DispatchGeometry, VoidExtentKernel};

    fn checkerboard(width: u32, height: u32) -> Image {
        let data = (0..width * height)
            .flat_map(|i| {
                let value = if (i % width + i / width) % 2 == 0 { 255 } else { 0 };
                [value, value, value, 255]
            })
            .collect();
        Image::from_rgba8(width, height, data).unwrap()
    }

    #[test]
    fn compression_without_kernel_is_a_missing_precondition() {
        let queue = SoftwareQueue::default();
        let image = checkerboard(4, 4);
        let texture = queue.upload_image(&image).unwrap();
        let mut output = queue.create_buffer("blocks", 16).unwrap();

        let params = CompressionParams {
            texel_width: 4,
            texel_height: 4,
            group_num_x: 1,
            channel_mask: 0b1111,
        };
        let result = queue.dispatch_compression(
            BlockFootprint::Rgba4x4,
            &texture,
            &mut output,
            params,
            [1, 1, 1],
        );

        assert!(matches!(result, Err(AstcError::PreconditionMissing(_))));
    }

    #[test]
    fn undersized_output_buffer_is_rejected() {
        let queue = SoftwareQueue::new(VoidExtentKernel);
        let texture = queue.upload_image(&checkerboard(8, 8)).unwrap();
        let mut output = queue.create_buffer("blocks", 48).unwrap();

        let params = CompressionParams {
            texel_width: 8,
            texel_height: 8,
            group_num_x: 2,
            channel_mask: 0b1111,
        };
        let result = queue.dispatch_compression(
            BlockFootprint::Rgba4x4,
            &texture,
            &mut output,
            params,
            [2, 1, 1],
        );

        assert!(matches!(result, Err(AstcError::DispatchFailed(_))));
    }

    #[test]
    fn uncovered_blocks_stay_zeroed() {
        // 80 blocks need two groups of 64 threads, only one is dispatched.
        let queue = SoftwareQueue::new(VoidExtentKernel);
        let texture = queue.upload_image(&checkerboard(40, 32)).unwrap();
        let geometry = DispatchGeometry::new(40, 32, 4);
        let mut output = queue
            .create_buffer("blocks", geometry.blocks_byte_size() as u64)
            .unwrap();

        let params = CompressionParams {
            texel_width: 40,
            texel_height: 32,
            group_num_x: 1,
            channel_mask: 0b1111,
        };
        queue
            .dispatch_compression(
                BlockFootprint::Rgba4x4,
                &texture,
                &mut output,
                params,
                [1, 1, 1],
            )
            .unwrap();

        let blocks = queue
            .read_buffer(&output, output.size(), Duration::from_secs(1))
            .unwrap();
        assert!(blocks[..64 * 16].chunks(16).all(|b| b[0] == 0xFC));
        assert!(blocks[64 * 16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn later_pass_requires_partials() {
        let queue = SoftwareQueue::default();
        let texture = queue.upload_image(&checkerboard(4, 4)).unwrap();
        let mut output = queue.create_buffer("sums", 16).unwrap();

        let params = ReductionParams {
            texel_width: 4,
            texel_height: 4,
            thread_count: 16,
            first_step: 0,
        };
        let result =
            queue.dispatch_reduction(&texture, &texture, None, &mut output, params, [1, 1, 1]);

        assert!(matches!(result, Err(AstcError::DispatchFailed(_))));
    }

    #[test]
    fn first_pass_sums_squared_differences_per_group() {
        let queue = SoftwareQueue::default();
        let black = Image::from_rgba8(64, 32, [0, 0, 0, 255].repeat(64 * 32)).unwrap();
        let white = Image::from_rgba8(64, 32, [255, 0, 0, 255].repeat(64 * 32)).unwrap();
        let source = queue.upload_image(&black).unwrap();
        let target = queue.upload_image(&white).unwrap();
        let mut output = queue.create_buffer("sums", 32).unwrap();

        let params = ReductionParams {
            texel_width: 64,
            texel_height: 32,
            thread_count: 2048,
            first_step: 1,
        };
        queue
            .dispatch_reduction(&source, &target, None, &mut output, params, [2, 1, 1])
            .unwrap();

        let sums = queue
            .read_buffer(&output, 32, Duration::from_secs(1))
            .unwrap();
        assert_eq!(read_accumulator(&sums, 0), [1024.0, 0.0, 0.0, 0.0]);
        assert_eq!(read_accumulator(&sums, 1), [1024.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn reading_past_the_end_fails() {
        let queue = SoftwareQueue::default();
        let buffer = queue.create_buffer("sums", 16).unwrap();

        let result = queue.read_buffer(&buffer, 32, Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(AstcError::BufferSizeMismatch {
                expected: 32,
                actual: 16
            })
        ));
    }
}
