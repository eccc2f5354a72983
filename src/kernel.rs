use crate::{AstcError, BlockFootprint, Result, ASTC_BLOCK_BYTE_SIZE};

/// Texel count of the largest supported footprint (6x6).
pub(crate) const MAX_BLOCK_TEXELS: usize = 36;

/// Low 64 bits of an LDR void-extent block without extent coordinates.
const VOID_EXTENT_LDR: u64 = 0xFFFF_FFFF_FFFF_FDFC;
const VOID_EXTENT_MODE_MASK: u64 = 0x1FF;
const VOID_EXTENT_MODE: u64 = 0x1FC;
const VOID_EXTENT_HDR_BIT: u64 = 1 << 9;

/// The RGBA8 texels covered by one block, row-major.
///
/// Texels outside the image are clamped to the nearest edge texel.
#[derive(Clone, Debug)]
pub struct TexelWindow {
    edge: usize,
    texels: [[u8; 4]; MAX_BLOCK_TEXELS],
}

impl TexelWindow {
    /// Loads the block at block coordinates (`block_x`, `block_y`) from tightly packed RGBA8 data.
    pub fn load(
        rgba: &[u8],
        width: u32,
        height: u32,
        footprint: BlockFootprint,
        block_x: u32,
        block_y: u32,
    ) -> Self {
        let edge = footprint.edge_length() as usize;
        let width = width as usize;
        let height = height as usize;
        let origin_x = block_x as usize * edge;
        let origin_y = block_y as usize * edge;

        let mut texels = [[0; 4]; MAX_BLOCK_TEXELS];
        for y in 0..edge {
            let source_y = (origin_y + y).min(height - 1);
            for x in 0..edge {
                let source_x = (origin_x + x).min(width - 1);
                let offset = (source_y * width + source_x) * 4;
                texels[y * edge + x].copy_from_slice(&rgba[offset..offset + 4]);
            }
        }

        Self { edge, texels }
    }

    pub const fn edge(&self) -> usize {
        self.edge
    }

    pub fn texels(&self) -> &[[u8; 4]] {
        &self.texels[..self.edge * self.edge]
    }
}

/// The opaque block compression kernel: turns one window of texels into one 16-byte block.
pub trait BlockKernel: Send + Sync {
    fn compress_block(
        &self,
        footprint: BlockFootprint,
        window: &TexelWindow,
    ) -> [u8; ASTC_BLOCK_BYTE_SIZE];
}

/// Decodes one 16-byte block into `edge * edge` RGBA8 texels.
pub trait BlockDecoder: Send + Sync {
    fn decode_block(
        &self,
        footprint: BlockFootprint,
        block: &[u8; ASTC_BLOCK_BYTE_SIZE],
        texels: &mut [[u8; 4]],
    ) -> Result<()>;
}

/// Encodes every block as an LDR void-extent block holding the mean colour of its texels.
///
/// Void-extent blocks are valid ASTC for every footprint, so the output can be
/// uploaded to any ASTC capable GPU. The decoder only understands this block mode.
#[derive(Copy, Clone, Debug, Default)]
pub struct VoidExtentKernel;

impl VoidExtentKernel {
    /// Builds a void-extent block from UNORM16 RGBA.
    pub fn encode_color(rgba: [u16; 4]) -> [u8; ASTC_BLOCK_BYTE_SIZE] {
        let mut block = [0; ASTC_BLOCK_BYTE_SIZE];
        block[..8].copy_from_slice(&VOID_EXTENT_LDR.to_le_bytes());
        for (channel, value) in rgba.iter().enumerate() {
            let offset = 8 + channel * 2;
            block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }
        block
    }

    /// Reads the UNORM16 colour of a void-extent block.
    pub fn decode_color(block: &[u8; ASTC_BLOCK_BYTE_SIZE]) -> Result<[u16; 4]> {
        let mut low = [0; 8];
        low.copy_from_slice(&block[..8]);
        let low = u64::from_le_bytes(low);

        if low & VOID_EXTENT_MODE_MASK != VOID_EXTENT_MODE {
            return Err(AstcError::UnsupportedBlock(format!(
                "block mode 0x{:03X} is not a void-extent block",
                low & 0x7FF
            )));
        }
        if low & VOID_EXTENT_HDR_BIT != 0 {
            return Err(AstcError::UnsupportedBlock(
                "HDR void-extent block".to_string(),
            ));
        }

        let mut rgba = [0; 4];
        for (channel, value) in rgba.iter_mut().enumerate() {
            let offset = 8 + channel * 2;
            *value = u16::from_le_bytes([block[offset], block[offset + 1]]);
        }
        Ok(rgba)
    }
}

impl BlockKernel for VoidExtentKernel {
    fn compress_block(
        &self,
        footprint: BlockFootprint,
        window: &TexelWindow,
    ) -> [u8; ASTC_BLOCK_BYTE_SIZE] {
        let texels = window.texels();
        let count = texels.len() as u32;

        let mut sums = [0u32; 4];
        for texel in texels {
            for (sum, &value) in sums.iter_mut().zip(texel) {
                *sum += value as u32;
            }
        }

        let mut rgba = sums.map(|sum| ((sum * 257 + count / 2) / count) as u16);
        if !footprint.has_alpha() {
            rgba[3] = u16::MAX;
        }

        Self::encode_color(rgba)
    }
}

impl BlockDecoder for VoidExtentKernel {
    fn decode_block(
        &self,
        footprint: BlockFootprint,
        block: &[u8; ASTC_BLOCK_BYTE_SIZE],
        texels: &mut [[u8; 4]],
    ) -> Result<()> {
        let edge = footprint.edge_length() as usize;
        if texels.len() < edge * edge {
            return Err(AstcError::BufferSizeMismatch {
                expected: edge * edge,
                actual: texels.len(),
            });
        }

        let color = Self::decode_color(block)?.map(|value| (value >> 8) as u8);
        texels[..edge * edge].fill(color);
        Ok(())
    }
}
