use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::queue::{CompressionParams, ComputeQueue};
use crate::{
    AstcError, AstcHeader, BlockFootprint, DispatchGeometry, Image, PixelFormat, Result,
    Settings,
};

/// Compresses images into ASTC with a kernel running on a [`ComputeQueue`].
pub struct AstcCompressor<Q: ComputeQueue> {
    queue: Arc<Q>,
    settings: Settings,
}

impl<Q: ComputeQueue> AstcCompressor<Q> {
    pub fn new(queue: Arc<Q>, settings: Settings) -> Self {
        Self { queue, settings }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compresses `image` with `footprint` and returns the `.astc` artifact as an image.
    ///
    /// The returned image holds the 16-byte container header followed by one
    /// 16-byte block per block-grid cell. The call blocks once, while reading
    /// the blocks back from the device. On error no output is produced and the
    /// device buffer is already released.
    pub fn run(&self, image: &Image, footprint: BlockFootprint) -> Result<Image> {
        if image.format() != PixelFormat::Rgba8Unorm {
            return Err(AstcError::PreconditionMissing(format!(
                "RGBA8 source image, got {:?}",
                image.format()
            )));
        }

        let start = Instant::now();
        let width = image.width();
        let height = image.height();
        let geometry = DispatchGeometry::new(width, height, footprint.edge_length());

        let source = self.queue.upload_image(image)?;
        let mut blocks = self
            .queue
            .create_buffer("astc blocks", geometry.blocks_byte_size() as u64)?;

        let params = CompressionParams {
            texel_width: width,
            texel_height: height,
            group_num_x: geometry.group_num_x,
            channel_mask: footprint.channel_mask(),
        };
        self.queue.dispatch_compression(
            footprint,
            &source,
            &mut blocks,
            params,
            geometry.workgroups(),
        )?;

        let block_data = self.queue.read_buffer(
            &blocks,
            geometry.blocks_byte_size() as u64,
            self.settings.readback_timeout(),
        )?;
        drop(blocks);

        if block_data.len() != geometry.blocks_byte_size() {
            return Err(AstcError::BufferSizeMismatch {
                expected: geometry.blocks_byte_size(),
                actual: block_data.len(),
            });
        }

        let header = AstcHeader::new(footprint.edge_length() as u8, width, height);
        let mut artifact = Vec::with_capacity(geometry.artifact_byte_size());
        artifact.extend_from_slice(&header.encode());
        artifact.extend_from_slice(&block_data);

        let compressed = Image::from_astc(footprint, width, height, artifact)?;

        info!(
            queue = self.queue.name(),
            %footprint,
            width,
            height,
            blocks = geometry.total_blocks,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "compressed image"
        );
        debug!(bytes = compressed.data().len(), "artifact assembled");

        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ReductionParams;
    use crate::{SoftwareQueue, VoidExtentKernel};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Copy, Clone, Debug)]
    enum FailAt {
        Dispatch,
        Readback,
    }

    struct CountedBuffer(Arc<AtomicUsize>);

    impl Drop for CountedBuffer {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Fails at one step and counts the buffers that are still alive.
    struct FailingQueue {
        fail_at: FailAt,
        live_buffers: Arc<AtomicUsize>,
        created_buffers: AtomicUsize,
    }

    impl FailingQueue {
        fn new(fail_at: FailAt) -> Self {
            Self {
                fail_at,
                live_buffers: Arc::new(AtomicUsize::new(0)),
                created_buffers: AtomicUsize::new(0),
            }
        }
    }

    impl ComputeQueue for FailingQueue {
        type Texture = ();
        type Buffer = CountedBuffer;

        fn name(&self) -> &'static str {
            "failing"
        }

        fn upload_image(&self, _image: &Image) -> Result<()> {
            Ok(())
        }

        fn create_buffer(&self, _label: &str, _size: u64) -> Result<CountedBuffer> {
            self.live_buffers.fetch_add(1, Ordering::SeqCst);
            self.created_buffers.fetch_add(1, Ordering::SeqCst);
            Ok(CountedBuffer(self.live_buffers.clone()))
        }

        fn dispatch_compression(
            &self,
            _footprint: BlockFootprint,
            _source: &(),
            _output: &mut CountedBuffer,
            _params: CompressionParams,
            _workgroups: [u32; 3],
        ) -> Result<()> {
            match self.fail_at {
                FailAt::Dispatch => Err(AstcError::DispatchFailed("rejected".to_string())),
                FailAt::Readback => Ok(()),
            }
        }

        fn dispatch_reduction(
            &self,
            _source: &(),
            _target: &(),
            _partials: Option<&CountedBuffer>,
            _output: &mut CountedBuffer,
            _params: ReductionParams,
            _workgroups: [u32; 3],
        ) -> Result<()> {
            Ok(())
        }

        fn read_buffer(
            &self,
            _buffer: &CountedBuffer,
            _size: u64,
            timeout: Duration,
        ) -> Result<Vec<u8>> {
            assert_eq!(self.live_buffers.load(Ordering::SeqCst), 1);
            Err(AstcError::ReadbackTimeout(timeout))
        }
    }

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Image {
        Image::from_rgba8(width, height, rgba.repeat((width * height) as usize)).unwrap()
    }

    #[test]
    fn compresses_16x16_into_272_bytes() {
        let compressor = AstcCompressor::new(
            Arc::new(SoftwareQueue::new(VoidExtentKernel)),
            Settings::default(),
        );

        let compressed = compressor
            .run(&solid(16, 16, [10, 20, 30, 255]), BlockFootprint::Rgba4x4)
            .unwrap();

        assert_eq!(compressed.format(), PixelFormat::Astc(BlockFootprint::Rgba4x4));
        assert_eq!(compressed.dimensions(), (16, 16));
        assert_eq!(compressed.data().len(), 272);
        assert_eq!(
            &compressed.data()[..16],
            &[0x13, 0xAB, 0xA1, 0x5C, 4, 4, 1, 16, 0, 0, 16, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn border_column_gets_its_own_blocks() {
        let compressor = AstcCompressor::new(
            Arc::new(SoftwareQueue::new(VoidExtentKernel)),
            Settings::default(),
        );

        let compressed = compressor
            .run(&solid(17, 16, [0, 0, 0, 255]), BlockFootprint::Rgb4x4)
            .unwrap();

        assert_eq!(compressed.data().len(), 16 + 20 * 16);
        let blocks = compressed.block_data().unwrap();
        assert!(blocks.chunks_exact(16).all(|block| block[0] == 0xFC));
    }

    #[test]
    fn missing_kernel_aborts_without_output() {
        let compressor = AstcCompressor::new(
            Arc::new(SoftwareQueue::default()),
            Settings::default(),
        );

        let result = compressor.run(&solid(8, 8, [0; 4]), BlockFootprint::Rgba6x6);
        assert!(matches!(result, Err(AstcError::PreconditionMissing(_))));
    }

    #[test]
    fn compressed_source_is_rejected() {
        let compressor = AstcCompressor::new(
            Arc::new(SoftwareQueue::new(VoidExtentKernel)),
            Settings::default(),
        );
        let compressed = compressor
            .run(&solid(8, 8, [0; 4]), BlockFootprint::Rgba4x4)
            .unwrap();

        let result = compressor.run(&compressed, BlockFootprint::Rgba4x4);
        assert!(matches!(result, Err(AstcError::PreconditionMissing(_))));
    }

    #[rstest]
    #[case(FailAt::Dispatch)]
    #[case(FailAt::Readback)]
    fn failed_run_releases_the_block_buffer(#[case] fail_at: FailAt) {
        let queue = Arc::new(FailingQueue::new(fail_at));
        let settings = Settings::new().with_readback_timeout(Duration::from_millis(250));
        let compressor = AstcCompressor::new(queue.clone(), settings);

        let result = compressor.run(&solid(16, 16, [0; 4]), BlockFootprint::Rgba4x4);

        match fail_at {
            FailAt::Dispatch => assert!(matches!(result, Err(AstcError::DispatchFailed(_)))),
            FailAt::Readback => assert!(matches!(
                result,
                Err(AstcError::ReadbackTimeout(timeout)) if timeout == Duration::from_millis(250)
            )),
        }
        assert_eq!(queue.created_buffers.load(Ordering::SeqCst), 1);
        assert_eq!(queue.live_buffers.load(Ordering::SeqCst), 0);
    }
}
