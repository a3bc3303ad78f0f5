//! [FlashDevice] over SPI-NOR, via the `embedded-storage` NOR traits
//!
//! NOR has no bad blocks and no ECC, so offsets pass straight through and every read is
//! [ReadStatus::Clean].

use super::{align_down, align_up, check_range, effective_limit, FlashDevice, FlashError, ReadStatus};

use tracing::debug;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

/// Flash access over any `embedded-storage` NOR chip
#[derive(Debug)]
pub struct NorAdapter<F> {
    flash: F,
}

impl<F: NorFlash> NorAdapter<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    /// Access the wrapped chip directly
    pub fn chip_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

/// Convert a device offset into the chip's 32-bit address space
fn to_addr(offset: u64, len: u64, limit: u64) -> Result<u32, FlashError> {
    u32::try_from(offset).map_err(|_| FlashError::LimitExceeded { offset, len, limit })
}

fn chip_error<E: NorFlashError>(op: &str, offset: u64, e: E) -> FlashError {
    anyhow::anyhow!("NOR {op} at 0x{offset:x} failed: {:?}", e.kind()).into()
}

impl<F: NorFlash> FlashDevice for NorAdapter<F> {
    fn size(&self) -> u64 {
        self.flash.capacity() as u64
    }

    fn erase_size(&self) -> u64 {
        F::ERASE_SIZE as u64
    }

    fn erase(&mut self, offset: u64, len: u64, limit: Option<u64>) -> Result<(), FlashError> {
        let limit = effective_limit(limit, self.size());
        let start = align_down(offset, self.erase_size());
        let end = align_up(offset.saturating_add(len), self.erase_size());
        check_range(start, end - start, limit)?;

        to_addr(end, 0, limit)?;

        // One sector per call; a failure reports that sector
        let sector = self.erase_size().max(1);
        for at in (start..end).step_by(sector as usize) {
            let from = to_addr(at, sector, limit)?;
            let to = to_addr(at + sector, 0, limit)?;
            self.flash.erase(from, to).map_err(|e| {
                debug!("NOR erase at 0x{at:x} failed: {:?}", e.kind());
                FlashError::EraseIncomplete { first_bad: at }
            })?;
        }

        Ok(())
    }

    fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> Result<ReadStatus, FlashError> {
        let limit = effective_limit(limit, self.size());
        let len = buf.len() as u64;
        check_range(offset, len, limit)?;

        let read_size = F::READ_SIZE as u64;
        if offset % read_size == 0 && len % read_size == 0 {
            let addr = to_addr(offset, len, limit)?;
            self.flash
                .read(addr, buf)
                .map_err(|e| chip_error("read", offset, e))?;
        } else {
            // Widen to the chip's read granularity and copy the middle out
            let start = align_down(offset, read_size);
            let end = std::cmp::min(align_up(offset + len, read_size), self.size());
            let mut bounce = vec![0u8; (end - start) as usize];
            let addr = to_addr(start, end - start, limit)?;
            self.flash
                .read(addr, &mut bounce)
                .map_err(|e| chip_error("read", start, e))?;
            let skip = (offset - start) as usize;
            buf.copy_from_slice(&bounce[skip..skip + buf.len()]);
        }

        Ok(ReadStatus::Clean)
    }

    fn write(&mut self, offset: u64, data: &[u8], limit: Option<u64>) -> Result<(), FlashError> {
        let limit = effective_limit(limit, self.size());
        let write_size = F::WRITE_SIZE as u64;
        if offset % write_size != 0 {
            return Err(FlashError::Misaligned {
                offset,
                align: write_size,
            });
        }

        let padded_len = align_up(data.len() as u64, write_size);
        check_range(offset, padded_len, limit)?;
        let addr = to_addr(offset, padded_len, limit)?;

        let result = if padded_len == data.len() as u64 {
            self.flash.write(addr, data)
        } else {
            let mut padded = Vec::with_capacity(padded_len as usize);
            padded.extend_from_slice(data);
            padded.resize(padded_len as usize, 0xFF);
            self.flash.write(addr, &padded)
        };

        result.map_err(|e| chip_error("write", offset, e))
    }
}

/// A simulated SPI-NOR chip with 4 KiB sectors.
///
/// Like the real thing, programming can only clear bits; writing over unerased data yields the
/// bitwise AND of old and new content.
#[derive(Debug, Clone)]
pub struct SimNor {
    data: Vec<u8>,

    /// Offset of a sector whose next erase fails
    fail_erase: Option<usize>,
}

impl SimNor {
    pub const SECTOR_SIZE: usize = 4096;

    /// Create an erased chip of `size` bytes, rounded up to whole sectors
    pub fn new(size: usize) -> Self {
        let size = align_up(size as u64, Self::SECTOR_SIZE as u64) as usize;
        Self {
            data: vec![0xFF; size],
            fail_erase: None,
        }
    }

    /// Create a chip holding `data`, e.g. a dump loaded from a file
    pub fn from_vec(data: Vec<u8>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.len() % Self::SECTOR_SIZE == 0,
            "NOR image is not a multiple of the {}-byte sector size",
            Self::SECTOR_SIZE
        );
        Ok(Self {
            data,
            fail_erase: None,
        })
    }

    /// Make the next erase covering `sector` fail
    pub fn inject_erase_failure(&mut self, sector: usize) {
        self.fail_erase = Some(sector * Self::SECTOR_SIZE);
    }

    /// The raw chip contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, NorFlashErrorKind> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }
}

impl ErrorType for SimNor {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for SimNor {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for SimNor {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = Self::SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let len = (to as usize)
            .checked_sub(from as usize)
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        let range = self.range(from, len)?;
        if let Some(failing) = self.fail_erase.filter(|at| range.contains(at)) {
            self.fail_erase = None;
            self.data[range.start..failing].fill(0xFF);
            return Err(NorFlashErrorKind::Other);
        }
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        self.data[range]
            .iter_mut()
            .zip(bytes)
            .for_each(|(cell, &byte)| *cell &= byte);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sim_nor_and_semantics() -> anyhow::Result<()> {
        let mut flash = NorAdapter::new(SimNor::new(4 * SimNor::SECTOR_SIZE));
        flash.write(0, &[0xF0, 0x0F], None)?;
        flash.write(0, &[0x3C, 0x3C], None)?;

        let mut buf = [0u8; 2];
        flash.read(0, &mut buf, None)?;
        assert_eq!(buf, [0x30, 0x0C]);

        flash.erase(1, 1, None)?;
        flash.read(0, &mut buf, None)?;
        assert_eq!(buf, [0xFF, 0xFF]);

        Ok(())
    }

    #[test]
    fn test_nor_limits() {
        let mut flash = NorAdapter::new(SimNor::new(2 * SimNor::SECTOR_SIZE));
        assert_eq!(flash.erase_size(), SimNor::SECTOR_SIZE as u64);
        assert_eq!(flash.adjust_offset(4096, 100, 8192).unwrap(), 4196);

        let mut buf = [0u8; 16];
        assert!(matches!(
            flash.read(8190, &mut buf, None),
            Err(FlashError::LimitExceeded { .. })
        ));
        assert!(matches!(
            flash.write(4090, &buf, Some(4096)),
            Err(FlashError::LimitExceeded { .. })
        ));
        assert!(flash.erase(0, 4097, Some(4096)).is_err());
    }

    #[test]
    fn test_erase_failure_names_sector() -> anyhow::Result<()> {
        let mut chip = SimNor::new(8 * SimNor::SECTOR_SIZE);
        chip.inject_erase_failure(5);
        let mut flash = NorAdapter::new(chip);
        flash.write(0, &[0u8; 6 * SimNor::SECTOR_SIZE], None)?;

        assert!(matches!(
            flash.erase(0x1000, 0x6000, None),
            Err(FlashError::EraseIncomplete { first_bad: 0x5000 })
        ));

        // Sectors ahead of the failure were erased, the rest were not reached
        let mut buf = [0u8; 1];
        flash.read(0x4fff, &mut buf, None)?;
        assert_eq!(buf, [0xFF]);
        flash.read(0x5000, &mut buf, None)?;
        assert_eq!(buf, [0x00]);

        flash.erase(0x1000, 0x6000, None)?;
        flash.read(0x5000, &mut buf, None)?;
        assert_eq!(buf, [0xFF]);

        Ok(())
    }

    #[test]
    fn test_from_vec_requires_whole_sectors() {
        assert!(SimNor::from_vec(vec![0xFF; 100]).is_err());
        assert!(SimNor::from_vec(vec![0xFF; 8192]).is_ok());
    }
}
