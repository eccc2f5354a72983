use std::borrow::Cow;

use crate::{
    AstcError, AstcHeader, BlockDecoder, BlockFootprint, DispatchGeometry, Result,
    ASTC_BLOCK_BYTE_SIZE, ASTC_HEADER_SIZE, ASTC_MAX_DIMENSION,
};

/// Pixel layout of an [`Image`] buffer.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub enum PixelFormat {
    /// 8 bits per channel, normalized, RGBA order.
    Rgba8Unorm,
    /// `.astc` container: 16-byte header followed by the block stream.
    Astc(BlockFootprint),
}

/// A 2D image with a contiguous row-major buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Image {
    /// Wraps tightly packed RGBA8 texels.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        check_dimensions(width, height)?;

        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(AstcError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format: PixelFormat::Rgba8Unorm,
            data,
        })
    }

    /// Wraps a complete `.astc` artifact. The header must describe `footprint`
    /// and the dimensions, and the block stream must cover the whole image.
    pub fn from_astc(
        footprint: BlockFootprint,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        check_dimensions(width, height)?;

        let header = AstcHeader::decode(&data)?;
        let edge = footprint.edge_length();
        if header.block_dimensions() != (edge as u8, edge as u8, 1) {
            return Err(AstcError::MalformedHeader(format!(
                "header block size {:?} does not match footprint {footprint}",
                header.block_dimensions()
            )));
        }
        if header.width() != width || header.height() != height {
            return Err(AstcError::MalformedHeader(format!(
                "header size {}x{} does not match image size {width}x{height}",
                header.width(),
                header.height()
            )));
        }

        let expected = DispatchGeometry::new(width, height, edge).artifact_byte_size();
        if data.len() != expected {
            return Err(AstcError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format: PixelFormat::Astc(footprint),
            data,
        })
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    pub const fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Raw bytes. For ASTC images this includes the container header.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Block stream of an ASTC image, without the container header.
    pub fn block_data(&self) -> Option<&[u8]> {
        match self.format {
            PixelFormat::Astc(_) => Some(&self.data[ASTC_HEADER_SIZE..]),
            PixelFormat::Rgba8Unorm => None,
        }
    }

    /// Two images are comparable if their texel dimensions match exactly.
    pub fn is_comparable(&self, other: &Image) -> bool {
        self.dimensions() == other.dimensions()
    }

    /// Returns the image as tightly packed RGBA8 texels, decoding ASTC blocks with `decoder`.
    pub fn to_rgba8(&self, decoder: Option<&dyn BlockDecoder>) -> Result<Cow<'_, [u8]>> {
        let footprint = match self.format {
            PixelFormat::Rgba8Unorm => return Ok(Cow::Borrowed(&self.data)),
            PixelFormat::Astc(footprint) => footprint,
        };

        let decoder = decoder.ok_or_else(|| {
            AstcError::PreconditionMissing(format!("block decoder for {footprint}"))
        })?;

        let edge = footprint.edge_length() as usize;
        let width = self.width as usize;
        let height = self.height as usize;
        let block_columns = width.div_ceil(edge);

        let mut rgba = vec![0; width * height * 4];
        let mut texels = vec![[0u8; 4]; edge * edge];

        for (index, block) in self.data[ASTC_HEADER_SIZE..]
            .chunks_exact(ASTC_BLOCK_BYTE_SIZE)
            .enumerate()
        {
            let block: &[u8; ASTC_BLOCK_BYTE_SIZE] = block.try_into().map_err(|_| {
                AstcError::BufferSizeMismatch {
                    expected: ASTC_BLOCK_BYTE_SIZE,
                    actual: block.len(),
                }
            })?;
            decoder.decode_block(footprint, block, &mut texels)?;

            let origin_x = (index % block_columns) * edge;
            let origin_y = (index / block_columns) * edge;

            for y in 0..edge.min(height - origin_y) {
                for x in 0..edge.min(width - origin_x) {
                    let offset = ((origin_y + y) * width + origin_x + x) * 4;
                    rgba[offset..offset + 4].copy_from_slice(&texels[y * edge + x]);
                }
            }
        }

        Ok(Cow::Owned(rgba))
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(AstcError::PreconditionMissing(format!(
            "non-empty image, got {width}x{height}"
        )));
    }
    if width > ASTC_MAX_DIMENSION || height > ASTC_MAX_DIMENSION {
        return Err(AstcError::PreconditionMissing(format!(
            "image dimensions up to {ASTC_MAX_DIMENSION}, got {width}x{height}"
        )));
    }
    Ok(())
}
