//! The legacy U-Boot image ("uImage") header, with CRC verification/computation.

use crc::{Crc, CRC_32_ISO_HDLC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use deku::{DekuError, DekuRead, DekuWrite};

pub const LEGACY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
pub const LEGACY_MAGIC: u32 = 0x2705_1956;
pub const LEGACY_HEADER_SIZE: usize = 64;

#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct LegacyHeader {
    pub magic: u32,
    pub hcrc: u32,
    pub time: u32,

    /// Payload size, excluding this header
    pub size: u32,

    pub load: u32,
    pub ep: u32,
    pub dcrc: u32,
    pub os: u8,
    pub arch: u8,
    pub image_type: u8,
    pub comp: u8,
    pub name: [u8; 32],
}

#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("header truncated")]
    Truncated,

    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("bad header checksum (stored 0x{stored:08x}, computed 0x{computed:08x})")]
    BadHeaderCrc { stored: u32, computed: u32 },

    #[error("bad data checksum (stored 0x{stored:08x}, computed 0x{computed:08x})")]
    BadDataCrc { stored: u32, computed: u32 },
}

/// Computes the header CRC, which covers the whole header with its own CRC field zeroed
pub trait ComputeCrc: DekuContainerWrite + Clone {
    fn compute_crc(&self) -> Result<u32, DekuError> {
        let mut zeroed = self.clone();
        zeroed.set_crc(0);
        Ok(LEGACY_CRC.checksum(&zeroed.to_bytes()?))
    }

    fn check_crc(&self) -> bool {
        self.compute_crc().is_ok_and(|crc| crc == self.get_crc())
    }

    fn fix_crc(&mut self) -> Result<(), DekuError> {
        let crc = self.compute_crc()?;
        self.set_crc(crc);
        Ok(())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for LegacyHeader {
    fn get_crc(&self) -> u32 {
        self.hcrc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hcrc = crc;
    }
}

impl LegacyHeader {
    /// Parse a header from the start of `buf`, verifying magic and header CRC
    pub fn parse(buf: &[u8]) -> Result<Self, LegacyError> {
        let buf = buf
            .get(..LEGACY_HEADER_SIZE)
            .ok_or(LegacyError::Truncated)?;
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| LegacyError::Truncated)?;

        if header.magic != LEGACY_MAGIC {
            return Err(LegacyError::BadMagic(header.magic));
        }

        let computed = header
            .compute_crc()
            .map_err(|_| LegacyError::Truncated)?;
        if computed != header.hcrc {
            return Err(LegacyError::BadHeaderCrc {
                stored: header.hcrc,
                computed,
            });
        }

        Ok(header)
    }

    /// The size of the whole image: header plus payload
    pub fn image_size(&self) -> u64 {
        LEGACY_HEADER_SIZE as u64 + u64::from(self.size)
    }

    /// Check the payload CRC; `payload` is the `size` bytes following the header
    pub fn check_dcrc(&self, payload: &[u8]) -> Result<(), LegacyError> {
        let computed = LEGACY_CRC.checksum(payload);
        if computed != self.dcrc {
            return Err(LegacyError::BadDataCrc {
                stored: self.dcrc,
                computed,
            });
        }
        Ok(())
    }

    /// The image name, up to the first NUL
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}
