use bytemuck::{Pod, Zeroable};

use crate::{AstcError, Result};

/// Magic number identifying the `.astc` container format.
pub const ASTC_MAGIC: u32 = 0x5CA1_AB13;

/// Size of the container header in bytes.
pub const ASTC_HEADER_SIZE: usize = 16;

/// Size of a single compressed ASTC block in bytes, independent of the footprint.
pub const ASTC_BLOCK_BYTE_SIZE: usize = 16;

/// Largest image dimension a 24-bit size field can hold.
pub const ASTC_MAX_DIMENSION: u32 = (1 << 24) - 1;

/// The 16-byte header that prefixes an `.astc` file.
///
/// All fields are byte arrays, so the layout has no padding and no alignment
/// requirement. Sizes are stored as 24-bit little-endian integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AstcHeader {
    magic: [u8; 4],
    block_x: u8,
    block_y: u8,
    block_z: u8,
    size_x: [u8; 3],
    size_y: [u8; 3],
    size_z: [u8; 3],
}

const _: () = assert!(size_of::<AstcHeader>() == ASTC_HEADER_SIZE);

impl AstcHeader {
    /// Creates the header of a 2D image compressed with square blocks of
    /// `edge` texels. Depth and block depth are always 1.
    ///
    /// Dimensions above [`ASTC_MAX_DIMENSION`] are truncated to 24 bits.
    pub const fn new(edge: u8, width: u32, height: u32) -> Self {
        Self {
            magic: ASTC_MAGIC.to_le_bytes(),
            block_x: edge,
            block_y: edge,
            block_z: 1,
            size_x: encode_u24(width),
            size_y: encode_u24(height),
            size_z: encode_u24(1),
        }
    }

    pub fn encode(&self) -> [u8; ASTC_HEADER_SIZE] {
        bytemuck::cast(*self)
    }

    /// Parses the first 16 bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(bytes) = bytes.get(..ASTC_HEADER_SIZE) else {
            return Err(AstcError::MalformedHeader(format!(
                "need {ASTC_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        };

        let header: Self = bytemuck::pod_read_unaligned(bytes);

        let magic = u32::from_le_bytes(header.magic);
        if magic != ASTC_MAGIC {
            return Err(AstcError::MalformedHeader(format!(
                "bad magic 0x{magic:08X}"
            )));
        }
        if header.block_x == 0 || header.block_y == 0 || header.block_z != 1 {
            return Err(AstcError::MalformedHeader(format!(
                "unsupported block dimensions {}x{}x{}",
                header.block_x, header.block_y, header.block_z
            )));
        }
        if header.depth() != 1 {
            return Err(AstcError::MalformedHeader(format!(
                "unsupported depth {}",
                header.depth()
            )));
        }

        Ok(header)
    }

    /// Block edge length along X.
    pub const fn edge_length(&self) -> u8 {
        self.block_x
    }

    pub const fn block_dimensions(&self) -> (u8, u8, u8) {
        (self.block_x, self.block_y, self.block_z)
    }

    pub const fn width(&self) -> u32 {
        decode_u24(self.size_x)
    }

    pub const fn height(&self) -> u32 {
        decode_u24(self.size_y)
    }

    pub const fn depth(&self) -> u32 {
        decode_u24(self.size_z)
    }
}

const fn encode_u24(value: u32) -> [u8; 3] {
    let bytes = value.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

const fn decode_u24(bytes: [u8; 3]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}
