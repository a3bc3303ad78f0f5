//! A uniform interface over raw flash media.
//!
//! Every [FlashDevice] works on *physical* device offsets, but skips blocks marked bad inside the
//! range it is asked to touch, so that data laid down by one `write` comes back from one `read` of
//! the same offset and length. Because the number of skipped blocks depends on where a range
//! starts, callers addressing data by *logical* offset (e.g. "byte N of this partition") must go
//! through [FlashDevice::adjust_offset] first. [crate::partition::PartitionIo] does exactly that.
//!
//! Every operation takes an optional `limit`: an absolute device offset that no access may reach.
//! Bad-block skipping can push an access further than its length suggests, and the limit is what
//! keeps it inside its partition.

pub mod nand;
pub mod nor;

pub use nand::SkipBadNand;
pub use nor::{NorAdapter, SimNor};

/// How a successful read went
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ReadStatus {
    /// The data came back exactly as written
    #[default]
    Clean,

    /// The data is good, but only after ECC corrected bitflips somewhere in the range
    Corrected,
}

impl ReadStatus {
    /// Combine the status of two reads, keeping the worst
    pub fn worst(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

/// Errors reported by the flash access layer
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// ECC could not correct the data at this offset
    #[error("uncorrectable ECC error at 0x{offset:x}")]
    Uncorrectable { offset: u64 },

    /// Bad blocks consumed the room needed for the request before `limit`
    #[error("no good block left at 0x{offset:x} before limit 0x{limit:x}")]
    OutOfGoodBlocks { offset: u64, limit: u64 },

    /// The request itself reaches past `limit`
    #[error("access 0x{offset:x}+0x{len:x} crosses limit 0x{limit:x}")]
    LimitExceeded { offset: u64, len: u64, limit: u64 },

    /// Some block in the range could not be erased
    #[error("erase incomplete, first failing block at 0x{first_bad:x}")]
    EraseIncomplete { first_bad: u64 },

    /// The device cannot start an access at this offset
    #[error("offset 0x{offset:x} is not aligned to 0x{align:x}")]
    Misaligned { offset: u64, align: u64 },

    /// Anything the underlying driver reported
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

/// A raw flash device, as seen by the dual-image engine
pub trait FlashDevice {
    /// Total size of the device, in bytes
    fn size(&self) -> u64;

    /// Erase granularity, in bytes
    fn erase_size(&self) -> u64;

    /// Translate `offset` bytes of data past `base` into a physical offset, skipping bad blocks.
    ///
    /// Devices without bad blocks just add the two.
    fn adjust_offset(&mut self, base: u64, offset: u64, limit: u64) -> Result<u64, FlashError> {
        let physical = base.saturating_add(offset);
        if physical > limit {
            return Err(FlashError::LimitExceeded {
                offset: base,
                len: offset,
                limit,
            });
        }
        Ok(physical)
    }

    /// Erase `len` bytes from `offset`, widened to whole eraseblocks
    fn erase(&mut self, offset: u64, len: u64, limit: Option<u64>) -> Result<(), FlashError>;

    /// Fill `buf` from `offset`
    fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> Result<ReadStatus, FlashError>;

    /// Program `data` at `offset`; the range must have been erased
    fn write(&mut self, offset: u64, data: &[u8], limit: Option<u64>) -> Result<(), FlashError>;
}

impl<F: FlashDevice + ?Sized> FlashDevice for &mut F {
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn erase_size(&self) -> u64 {
        (**self).erase_size()
    }
    fn adjust_offset(&mut self, base: u64, offset: u64, limit: u64) -> Result<u64, FlashError> {
        (**self).adjust_offset(base, offset, limit)
    }
    fn erase(&mut self, offset: u64, len: u64, limit: Option<u64>) -> Result<(), FlashError> {
        (**self).erase(offset, len, limit)
    }
    fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> Result<ReadStatus, FlashError> {
        (**self).read(offset, buf, limit)
    }
    fn write(&mut self, offset: u64, data: &[u8], limit: Option<u64>) -> Result<(), FlashError> {
        (**self).write(offset, data, limit)
    }
}

/// Round `value` down to a multiple of `align`
pub fn align_down(value: u64, align: u64) -> u64 {
    match align {
        0 => value,
        _ => value - value % align,
    }
}

/// Round `value` up to a multiple of `align`
pub fn align_up(value: u64, align: u64) -> u64 {
    match value % align.max(1) {
        0 => value,
        rem => value + (align - rem),
    }
}

/// Resolve the effective limit of an access on a device of `size` bytes
fn effective_limit(limit: Option<u64>, size: u64) -> u64 {
    limit.map_or(size, |limit| limit.min(size))
}

/// Reject `offset..offset+len` if it reaches past `limit`
fn check_range(offset: u64, len: u64, limit: u64) -> Result<(), FlashError> {
    match offset.checked_add(len) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(FlashError::LimitExceeded { offset, len, limit }),
    }
}

#[test]
fn test_align() {
    assert_eq!(align_down(0x1234, 0x1000), 0x1000);
    assert_eq!(align_up(0x1234, 0x1000), 0x2000);
    assert_eq!(align_up(0x2000, 0x1000), 0x2000);
    assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    assert_eq!(align_up(7, 0), 7);
}

#[test]
fn test_check_range() {
    assert!(check_range(0, 16, 16).is_ok());
    assert!(matches!(
        check_range(8, 16, 16),
        Err(FlashError::LimitExceeded { offset: 8, .. })
    ));
    assert!(check_range(u64::MAX, 2, u64::MAX).is_err());
}
