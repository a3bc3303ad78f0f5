//! Locating the squashfs root filesystem appended after the kernel image.
//!
//! Firmware images are a kernel image followed, possibly after padding to an eraseblock
//! boundary, by a squashfs. Nothing records where the squashfs starts, so we probe: right after
//! the kernel first, then at each following eraseblock boundary.

use crate::flash::{align_up, FlashDevice, FlashError};
use crate::partition::PartitionIo;

use tracing::debug;

/// "hsqs", little-endian
pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;

/// How much of the superblock a probe reads
pub const SQUASHFS_PROBE_SIZE: usize = 48;

const BYTES_USED_OFFSET: usize = 40;

/// Probe stride when the caller has no eraseblock size to offer
pub const DEFAULT_SCAN_ALIGN: u64 = 0x1_0000;

/// Something the locator can probe: a partition on flash, or an image in memory
pub trait ProbeSource {
    /// Bytes addressable from offset 0
    fn bound(&self) -> u64;

    fn read_probe(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl ProbeSource for &[u8] {
    fn bound(&self) -> u64 {
        self.len() as u64
    }

    fn read_probe(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| self.get(start..start.checked_add(buf.len())?))
            .ok_or(FlashError::LimitExceeded {
                offset,
                len: buf.len() as u64,
                limit: self.len() as u64,
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl<F: FlashDevice + ?Sized> ProbeSource for PartitionIo<'_, F> {
    fn bound(&self) -> u64 {
        self.partition().size
    }

    fn read_probe(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        self.read(offset, buf).map(|_| ())
    }
}

/// Where the rootfs sits, relative to the start of the image
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RootfsLocation {
    pub offset: u64,

    /// Gap between the end of the kernel image and `offset`
    pub padding: u64,

    /// `bytes_used` from the superblock
    pub size: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LocateError {
    #[error("RootFS not found")]
    NotFound,

    /// Only superblocks declaring more data than there is room for were seen
    #[error("RootFS is incomplete (superblock at 0x{offset:x} declares 0x{declared:x} bytes)")]
    Truncated { offset: u64, declared: u64 },
}

/// Search for a squashfs superblock from `start` (the end of the kernel image).
///
/// `erase_size` sets the probe stride after the first, unaligned, probe; zero selects
/// [DEFAULT_SCAN_ALIGN]. A superblock whose declared size overruns the source is passed over,
/// and the scan goes on.
pub fn locate_rootfs<S: ProbeSource + ?Sized>(
    src: &mut S,
    start: u64,
    erase_size: u64,
) -> Result<RootfsLocation, LocateError> {
    let bound = src.bound();
    let align = match erase_size {
        0 => DEFAULT_SCAN_ALIGN,
        align => align,
    };

    debug!("searching for rootfs from 0x{start:x} to 0x{bound:x}");

    let mut truncated = None;
    let mut probe = [0u8; SQUASHFS_PROBE_SIZE];
    let mut offset = start;

    while offset
        .checked_add(SQUASHFS_PROBE_SIZE as u64)
        .is_some_and(|end| end <= bound)
    {
        match src.read_probe(offset, &mut probe) {
            Ok(()) => {
                let magic = u32::from_le_bytes([probe[0], probe[1], probe[2], probe[3]]);
                let mut used = [0u8; 8];
                used.copy_from_slice(&probe[BYTES_USED_OFFSET..][..8]);
                let size = u64::from_le_bytes(used);

                debug!("checking at 0x{offset:x}, magic = 0x{magic:08x}, size = 0x{size:x}");

                if magic == SQUASHFS_MAGIC {
                    if size < SQUASHFS_PROBE_SIZE as u64 {
                        debug!("superblock at 0x{offset:x} is too small to be real");
                    } else if offset.checked_add(size).map_or(true, |end| end > bound) {
                        truncated.get_or_insert(LocateError::Truncated {
                            offset,
                            declared: size,
                        });
                    } else {
                        debug!("found rootfs at 0x{offset:x}");
                        return Ok(RootfsLocation {
                            offset,
                            padding: offset - start,
                            size,
                        });
                    }
                }
            }
            Err(e) => debug!("probe at 0x{offset:x} failed: {e}"),
        }

        offset = match offset % align {
            0 => offset.saturating_add(align),
            _ => align_up(offset, align),
        };
    }

    Err(truncated.unwrap_or(LocateError::NotFound))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::squashfs;

    use proptest::prelude::*;

    const ALIGN: u64 = 0x1000;

    /// A source that counts its probes
    struct Counting<'a> {
        data: &'a [u8],
        probes: usize,
    }

    impl ProbeSource for Counting<'_> {
        fn bound(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_probe(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
            self.probes += 1;
            self.data.read_probe(offset, buf)
        }
    }

    fn place(image: &mut [u8], offset: usize, fs: &[u8]) {
        image[offset..offset + fs.len()].copy_from_slice(fs);
    }

    #[test]
    fn test_found_right_after_kernel() {
        let mut image = vec![0u8; 0x4000];
        place(&mut image, 0x1234, &squashfs(0x800));

        let found = locate_rootfs(&mut &image[..], 0x1234, ALIGN).unwrap();
        assert_eq!(
            found,
            RootfsLocation {
                offset: 0x1234,
                padding: 0,
                size: 0x800
            }
        );
    }

    #[test]
    fn test_found_after_padding() {
        let mut image = vec![0xFFu8; 0x8000];
        place(&mut image, 0x3000, &squashfs(0x2000));

        let found = locate_rootfs(&mut &image[..], 0x1234, ALIGN).unwrap();
        assert_eq!(found.offset, 0x3000);
        assert_eq!(found.padding, 0x3000 - 0x1234);
    }

    #[test]
    fn test_oversized_candidate_skipped() {
        let mut image = vec![0u8; 0x8000];
        place(&mut image, 0x1000, &squashfs(0x10_0000));
        place(&mut image, 0x4000, &squashfs(0x1000));

        let found = locate_rootfs(&mut &image[..], 0x1000, ALIGN).unwrap();
        assert_eq!(found.offset, 0x4000);

        // And with nothing better to find, the oversized one is reported
        let mut image = vec![0u8; 0x8000];
        place(&mut image, 0x2000, &squashfs(0x7000));
        assert_eq!(
            locate_rootfs(&mut &image[..], 0x1000, ALIGN),
            Err(LocateError::Truncated {
                offset: 0x2000,
                declared: 0x7000
            })
        );
    }

    #[test]
    fn test_undersized_candidate_ignored() {
        let mut image = vec![0u8; 0x4000];
        place(&mut image, 0x1000, &squashfs(0x10));
        assert_eq!(
            locate_rootfs(&mut &image[..], 0x1000, ALIGN),
            Err(LocateError::NotFound)
        );
    }

    #[test]
    fn test_probe_must_fit() {
        // A superblock in the last 47 bytes cannot be probed
        let mut image = vec![0u8; 0x2000];
        place(&mut image, 0x2000 - 47, &squashfs(47)[..47]);
        assert_eq!(
            locate_rootfs(&mut &image[..], 0x2000 - 47, ALIGN),
            Err(LocateError::NotFound)
        );

        let mut image = vec![0u8; 0x2000];
        place(&mut image, 0x2000 - 48, &squashfs(48));
        assert_eq!(
            locate_rootfs(&mut &image[..], 0x2000 - 48, ALIGN).map(|found| found.size),
            Ok(48)
        );
    }

    #[test]
    fn test_default_align() {
        let mut image = vec![0u8; 0x30000];
        place(&mut image, 0x20000, &squashfs(0x100));
        let found = locate_rootfs(&mut &image[..], 0x100, 0).unwrap();
        assert_eq!(found.offset, 0x20000);
    }

    proptest! {
        #[test]
        fn scan_terminates_in_bounded_steps(
            data in proptest::collection::vec(any::<u8>(), 0..0x6000),
            start in 0u64..0x7000,
            align_shift in 9u32..14,
        ) {
            let align = 1u64 << align_shift;
            let mut src = Counting { data: &data, probes: 0 };
            let result = locate_rootfs(&mut src, start, align);

            prop_assert!(src.probes as u64 <= data.len() as u64 / align + 2);
            if let Ok(found) = result {
                prop_assert!(found.offset >= start);
                prop_assert!(found.offset + found.size <= data.len() as u64);
            }
        }

        #[test]
        fn oversized_never_hides_real_rootfs(
            fake_block in 1usize..4,
            gap in 1usize..4,
            declared in 0x8000u64..u64::MAX,
        ) {
            let mut image = vec![0u8; 0x8000];
            let real_block = fake_block + gap;
            let mut fake = squashfs(0x100);
            fake[BYTES_USED_OFFSET..][..8].copy_from_slice(&declared.to_le_bytes());
            place(&mut image, fake_block * ALIGN as usize, &fake);
            place(&mut image, real_block * ALIGN as usize, &squashfs(0x100));

            let found = locate_rootfs(&mut &image[..], 0x10, ALIGN).unwrap();
            prop_assert_eq!(found.offset, real_block as u64 * ALIGN);
        }
    }
}
