//! The image verifier: decides whether one image slot holds an intact firmware image.
//!
//! A slot is either a flash partition, read as verification proceeds, or an image already in
//! memory. Either way the verified bytes end up contiguous in the slot's staging buffer, laid
//! out exactly as on flash, so a good slot can be written straight back out to restore the other.

use crate::eofs::{marker_end, pad_eofs};
use crate::flash::{FlashDevice, FlashError, ReadStatus};
use crate::image::fdt::FdtHeader;
use crate::image::fit::{FitError, FitImage, RootfsMetaError};
use crate::image::legacy::{LegacyError, LegacyHeader, LEGACY_HEADER_SIZE};
use crate::image::{Fingerprint, ImageFormat, HEADER_PROBE_SIZE};
use crate::partition::{FlashPartition, PartitionIo};
use crate::rootfs::{locate_rootfs, LocateError, RootfsLocation};

use tracing::{debug, warn};

/// Where the parts of an image lie, relative to its start
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub kernel_size: u64,

    /// Between the end of the kernel image and the rootfs
    pub padding_size: u64,

    pub rootfs_size: u64,

    /// Trailing end-of-filesystem marker bytes
    pub marker_size: u64,
}

impl Geometry {
    pub fn rootfs_offset(&self) -> u64 {
        self.kernel_size + self.padding_size
    }

    pub fn rootfs_end(&self) -> u64 {
        self.rootfs_offset() + self.rootfs_size
    }

    pub fn image_size(&self) -> u64 {
        self.rootfs_end() + self.marker_size
    }
}

/// The outcome of a successful verification
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Verdict {
    pub format: ImageFormat,

    /// Identifies the build, when the format embeds anything to identify it by
    pub fingerprint: Option<Fingerprint>,
}

/// Why a slot does not hold a valid image
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("invalid image format (magic 0x{magic:08x})")]
    UnknownFormat { magic: u32 },

    #[error("legacy image: {0}")]
    Legacy(#[from] LegacyError),

    #[error("FIT image: {0}")]
    Fit(#[from] FitError),

    #[error("image size 0x{size:x} at 0x{offset:x} exceeds 0x{bound:x}, assuming corrupted")]
    TooLarge { offset: u64, size: u64, bound: u64 },

    #[error(transparent)]
    Rootfs(#[from] LocateError),

    #[error("FIT rootfs: {0}")]
    RootfsMeta(#[from] RootfsMetaError),

    #[error("RootFS is corrupted (erased byte at 0x{offset:x})")]
    RootfsErased { offset: u64 },

    #[error("read failed at 0x{offset:x}: {source}")]
    Read { offset: u64, source: FlashError },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Backing {
    Flash,
    Ram,
}

/// One candidate firmware image
#[derive(Debug, Clone)]
pub struct ImageSlot {
    backing: Backing,
    partition: Option<FlashPartition>,
    erase_size: u64,
    staging: Vec<u8>,
    geometry: Geometry,
}

impl ImageSlot {
    /// A slot to be read from `partition`
    pub fn flash(partition: FlashPartition, erase_size: u64) -> Self {
        Self {
            backing: Backing::Flash,
            partition: Some(partition),
            erase_size,
            staging: Vec::new(),
            geometry: Geometry::default(),
        }
    }

    /// A slot already in memory, optionally destined for (and bounded by) `partition`
    pub fn ram(data: Vec<u8>, partition: Option<FlashPartition>, erase_size: u64) -> Self {
        Self {
            backing: Backing::Ram,
            partition,
            erase_size,
            staging: data,
            geometry: Geometry::default(),
        }
    }

    pub fn partition(&self) -> Option<&FlashPartition> {
        self.partition.as_ref()
    }

    pub fn erase_size(&self) -> u64 {
        self.erase_size
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// The verified image, including any marker bytes
    pub fn image(&self) -> &[u8] {
        let len = std::cmp::min(self.geometry.image_size(), self.staging.len() as u64);
        &self.staging[..len as usize]
    }

    /// The whole staging buffer, which may extend past the image
    pub fn staged(&self) -> &[u8] {
        &self.staging
    }

    /// Scratch space for reading back this slot's partition, discarding the staged image
    pub(crate) fn scratch(&mut self, len: usize) -> &mut [u8] {
        self.geometry = Geometry::default();
        self.staging.clear();
        self.staging.resize(len, 0);
        &mut self.staging
    }

    /// Append the end-of-filesystem marker after the rootfs, ahead of writing this image to a
    /// partition of `capacity` bytes.
    ///
    /// An image filling its partition leaves no room for an overlay, and gets no marker.
    pub fn pad_eofs(&mut self, capacity: u64) {
        let rootfs_end = self.geometry.rootfs_end();
        if marker_end(rootfs_end, self.erase_size) > capacity {
            debug!("no room for end-of-filesystem marker past 0x{rootfs_end:x}");
            self.staging.truncate(rootfs_end as usize);
            self.geometry.marker_size = 0;
            return;
        }

        self.geometry.marker_size =
            pad_eofs(&mut self.staging, rootfs_end as usize, self.erase_size);
    }
}

/// Verify a slot, reading it from `flash` if it is flash-backed.
///
/// A RAM slot is verified in place and `flash` is not touched.
pub fn verify_flash<F: FlashDevice + ?Sized>(
    slot: &mut ImageSlot,
    flash: &mut F,
) -> Result<Verdict, Rejection> {
    let (Backing::Flash, Some(partition)) = (slot.backing, slot.partition.as_ref()) else {
        return verify_ram(slot);
    };

    slot.geometry = Geometry::default();
    slot.staging.clear();

    let mut access = FlashAccess {
        io: PartitionIo::new(flash, partition),
        staging: &mut slot.staging,
    };
    let (verdict, geometry) = verify_with(&mut access, slot.erase_size)?;
    slot.geometry = geometry;

    Ok(verdict)
}

/// Verify the image held in a slot's staging buffer.
///
/// Anything in the buffer past the rootfs is taken as marker bytes.
pub fn verify_ram(slot: &mut ImageSlot) -> Result<Verdict, Rejection> {
    slot.geometry = Geometry::default();

    let mut access = RamAccess {
        data: &slot.staging,
        limit: slot.partition.as_ref().map(|part| part.size),
    };
    let (verdict, mut geometry) = verify_with(&mut access, slot.erase_size)?;
    geometry.marker_size = slot.staging.len() as u64 - geometry.rootfs_end();

    if let Some(part) = &slot.partition {
        if geometry.image_size() > part.size {
            return Err(Rejection::TooLarge {
                offset: 0,
                size: geometry.image_size(),
                bound: part.size,
            });
        }
    }

    slot.geometry = geometry;
    Ok(verdict)
}

/// How the verifier gets at a slot's bytes
trait SlotAccess {
    /// Upper bound for the kernel image
    fn kernel_bound(&self) -> u64;

    /// Make `offset..offset+len` of the image available, and return it
    fn stage(&mut self, offset: u64, len: u64) -> Result<&[u8], Rejection>;

    fn locate(&mut self, start: u64, erase_size: u64) -> Result<RootfsLocation, LocateError>;
}

struct FlashAccess<'a, F: ?Sized> {
    io: PartitionIo<'a, F>,
    staging: &'a mut Vec<u8>,
}

impl<F: FlashDevice + ?Sized> SlotAccess for FlashAccess<'_, F> {
    fn kernel_bound(&self) -> u64 {
        self.io.partition().size
    }

    fn stage(&mut self, offset: u64, len: u64) -> Result<&[u8], Rejection> {
        let bound = self.io.partition().size;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= bound)
            .ok_or(Rejection::TooLarge {
                offset,
                size: len,
                bound,
            })?;
        let range = offset as usize..end as usize;

        if self.staging.len() < range.end {
            self.staging.resize(range.end, 0xFF);
        }

        debug!("reading 0x{len:x} bytes at 0x{offset:x}");
        match self.io.read(offset, &mut self.staging[range.clone()]) {
            Ok(ReadStatus::Clean) => (),
            Ok(ReadStatus::Corrected) => {
                warn!("corrected bitflips in 0x{len:x} bytes at 0x{offset:x}")
            }
            Err(source) => return Err(Rejection::Read { offset, source }),
        }

        Ok(&self.staging[range])
    }

    fn locate(&mut self, start: u64, erase_size: u64) -> Result<RootfsLocation, LocateError> {
        locate_rootfs(&mut self.io, start, erase_size)
    }
}

struct RamAccess<'a> {
    data: &'a [u8],

    /// Size of the partition the image is meant for
    limit: Option<u64>,
}

impl SlotAccess for RamAccess<'_> {
    fn kernel_bound(&self) -> u64 {
        let len = self.data.len() as u64;
        self.limit.map_or(len, |limit| limit.min(len))
    }

    fn stage(&mut self, offset: u64, len: u64) -> Result<&[u8], Rejection> {
        let bound = self.data.len() as u64;
        offset
            .checked_add(len)
            .filter(|&end| end <= bound)
            .map(|end| &self.data[offset as usize..end as usize])
            .ok_or(Rejection::TooLarge {
                offset,
                size: len,
                bound,
            })
    }

    fn locate(&mut self, start: u64, erase_size: u64) -> Result<RootfsLocation, LocateError> {
        locate_rootfs(&mut self.data, start, erase_size)
    }
}

fn verify_with<A: SlotAccess>(
    access: &mut A,
    erase_size: u64,
) -> Result<(Verdict, Geometry), Rejection> {
    let header = match access.stage(0, HEADER_PROBE_SIZE as u64) {
        Ok(header) => header.to_vec(),
        Err(Rejection::TooLarge { .. }) => return Err(Rejection::UnknownFormat { magic: 0 }),
        Err(e) => return Err(e),
    };

    match ImageFormat::detect(&header) {
        Some(ImageFormat::Legacy) => verify_legacy(access, &header, erase_size),
        Some(ImageFormat::Fit) => verify_fit(access, &header, erase_size),
        None => Err(Rejection::UnknownFormat {
            magic: u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
        }),
    }
}

fn check_kernel_size<A: SlotAccess>(access: &A, kernel_size: u64) -> Result<(), Rejection> {
    let bound = access.kernel_bound();
    if kernel_size > bound {
        return Err(Rejection::TooLarge {
            offset: 0,
            size: kernel_size,
            bound,
        });
    }
    Ok(())
}

/// Stage the padding and rootfs after the kernel, returning the rootfs itself
fn stage_rootfs<'a, A: SlotAccess>(
    access: &'a mut A,
    kernel_size: u64,
    found: &RootfsLocation,
) -> Result<&'a [u8], Rejection> {
    let staged = access.stage(kernel_size, found.padding + found.size)?;
    Ok(&staged[found.padding as usize..])
}

/// The only check possible on a bare squashfs: an image written by the upgrade process had
/// its partition erased first, so an interrupted write leaves the last rootfs byte erased.
fn check_rootfs_simple(rootfs: &[u8], rootfs_offset: u64) -> Result<(), Rejection> {
    match rootfs.last() {
        Some(&0xFF) | None => Err(Rejection::RootfsErased {
            offset: rootfs_offset + (rootfs.len() as u64).saturating_sub(1),
        }),
        Some(_) => Ok(()),
    }
}

fn verify_legacy<A: SlotAccess>(
    access: &mut A,
    header: &[u8],
    erase_size: u64,
) -> Result<(Verdict, Geometry), Rejection> {
    let header = LegacyHeader::parse(header)?;
    let kernel_size = header.image_size();
    check_kernel_size(access, kernel_size)?;
    debug!("legacy image '{}', 0x{kernel_size:x} bytes", header.name());

    let kernel = access.stage(0, kernel_size)?;
    header.check_dcrc(&kernel[LEGACY_HEADER_SIZE..])?;

    let found = access.locate(kernel_size, erase_size)?;
    let rootfs = stage_rootfs(access, kernel_size, &found)?;
    check_rootfs_simple(rootfs, found.offset)?;

    Ok((
        Verdict {
            format: ImageFormat::Legacy,
            fingerprint: None,
        },
        Geometry {
            kernel_size,
            padding_size: found.padding,
            rootfs_size: found.size,
            marker_size: 0,
        },
    ))
}

fn verify_fit<A: SlotAccess>(
    access: &mut A,
    header: &[u8],
    erase_size: u64,
) -> Result<(Verdict, Geometry), Rejection> {
    let kernel_size = FdtHeader::parse(header)
        .map_err(FitError::from)?
        .total_size();
    check_kernel_size(access, kernel_size)?;
    debug!("FIT image, 0x{kernel_size:x} bytes");

    let fit = FitImage::parse(access.stage(0, kernel_size)?)?;
    let fingerprint = fit.verify_all_images()?;

    let found = access.locate(kernel_size, erase_size)?;
    let meta = fit.rootfs_meta();
    if let Some(meta) = &meta {
        meta.check_size(found.size)?;
    }

    let rootfs = stage_rootfs(access, kernel_size, &found)?;
    match meta {
        Some(meta) => meta.verify(rootfs)?,
        None => check_rootfs_simple(rootfs, found.offset)?,
    }

    Ok((
        Verdict {
            format: ImageFormat::Fit,
            fingerprint,
        },
        Geometry {
            kernel_size,
            padding_size: found.padding,
            rootfs_size: found.size,
            marker_size: 0,
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{Ecc, Nand, NandBlock};
    use crate::testutil::{legacy_image, sim_board, FitBuilder, BLOCK};

    #[test]
    fn test_verify_legacy_in_ram() -> anyhow::Result<()> {
        let image = legacy_image(0x2345, 0x3000);
        let mut data = image.clone();
        data.extend_from_slice(&[0xDE, 0xAD, 0xC0, 0xDE]);

        let mut slot = ImageSlot::ram(data, None, BLOCK);
        let verdict = verify_ram(&mut slot)?;
        assert_eq!(verdict.format, ImageFormat::Legacy);
        assert_eq!(verdict.fingerprint, None);

        let geometry = slot.geometry();
        assert_eq!(geometry.kernel_size, 0x2345 + 64);
        assert_eq!(geometry.rootfs_offset(), BLOCK);
        assert_eq!(geometry.rootfs_size, 0x3000);
        assert_eq!(geometry.marker_size, 4);
        assert_eq!(slot.image().len() as u64, BLOCK + 0x3000 + 4);

        Ok(())
    }

    #[test]
    fn test_verify_flash_matches_ram() -> anyhow::Result<()> {
        let image = FitBuilder::new(vec![0x11; 0x1800])
            .kernel_hash("sha256")
            .rootfs(0x2800)
            .rootfs_hashes(&["sha1"])
            .build();

        let (mut board, main, _) = sim_board()?;
        board.flash()?.write(main.offset, &image, Some(main.end()))?;

        let mut slot = ImageSlot::flash(main.clone(), BLOCK);
        let verdict = verify_flash(&mut slot, board.flash()?)?;
        assert_eq!(verdict.format, ImageFormat::Fit);
        assert!(verdict.fingerprint.is_some());
        assert_eq!(slot.image(), &image[..]);

        let mut ram = ImageSlot::ram(image, Some(main), BLOCK);
        assert_eq!(verify_ram(&mut ram)?, verdict);
        assert_eq!(ram.geometry(), slot.geometry());

        Ok(())
    }

    #[test]
    fn test_rejections() -> anyhow::Result<()> {
        let image = legacy_image(0x1000, 0x1000);

        let mut bad_magic = image.clone();
        bad_magic[..4].fill(0xFF);
        let mut slot = ImageSlot::ram(bad_magic, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::UnknownFormat { magic: 0xFFFF_FFFF })
        ));

        let mut bad_data = image.clone();
        bad_data[100] ^= 0x80;
        let mut slot = ImageSlot::ram(bad_data, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::Legacy(LegacyError::BadDataCrc { .. }))
        ));

        // Erased tail: the write was cut short
        let mut cut = image.clone();
        let last = cut.len() - 1;
        cut[last] = 0xFF;
        let mut slot = ImageSlot::ram(cut, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::RootfsErased { .. })
        ));

        let truncated = image[..image.len() - 16].to_vec();
        let mut slot = ImageSlot::ram(truncated, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::Rootfs(LocateError::Truncated { .. }))
        ));

        let mut slot = ImageSlot::ram(vec![0x27, 0x05], None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::UnknownFormat { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_declared_size_bounded_by_partition() -> anyhow::Result<()> {
        let (mut board, main, _) = sim_board()?;

        // A kernel larger than the whole partition, with a valid header
        let image = legacy_image(main.size as usize, 0x1000);
        board
            .flash()?
            .write(main.offset, &image[..0x1000], Some(main.end()))?;

        let mut slot = ImageSlot::flash(main.clone(), BLOCK);
        assert!(matches!(
            verify_flash(&mut slot, board.flash()?),
            Err(Rejection::TooLarge { offset: 0, .. })
        ));
        // Nothing beyond the header was read
        assert_eq!(slot.staged().len(), HEADER_PROBE_SIZE);

        let mut ram = ImageSlot::ram(image, Some(main), BLOCK);
        assert!(matches!(
            verify_ram(&mut ram),
            Err(Rejection::TooLarge { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_fit_rootfs_size_mismatch() -> anyhow::Result<()> {
        let image = FitBuilder::new(vec![0x22; 0x800])
            .rootfs(0x2000)
            .rootfs_hashes(&["crc32"])
            .declared_rootfs_size(0x1ffc)
            .build();

        let mut slot = ImageSlot::ram(image, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::RootfsMeta(RootfsMetaError::SizeMismatch { .. }))
        ));

        Ok(())
    }

    #[test]
    fn test_fit_without_rootfs_node_uses_simple_check() -> anyhow::Result<()> {
        let mut image = FitBuilder::new(vec![0x33; 0x800])
            .kernel_hash("md5")
            .rootfs(0x1000)
            .build();

        let mut slot = ImageSlot::ram(image.clone(), None, BLOCK);
        verify_ram(&mut slot)?;

        let last = image.len() - 1;
        image[last] = 0xFF;
        let mut slot = ImageSlot::ram(image, None, BLOCK);
        assert!(matches!(
            verify_ram(&mut slot),
            Err(Rejection::RootfsErased { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_uncorrectable_read_rejects_slot() -> anyhow::Result<()> {
        let (mut board, main, _) = sim_board()?;
        let image = legacy_image(0x3000, 0x2000);
        board.flash()?.write(main.offset, &image, Some(main.end()))?;

        let block = (main.offset / BLOCK) as u32;
        board.flash()?.nand_mut().inject_ecc(block, 3, Ecc::Uncorrectable)?;

        let mut slot = ImageSlot::flash(main, BLOCK);
        assert!(matches!(
            verify_flash(&mut slot, board.flash()?),
            Err(Rejection::Read {
                source: FlashError::Uncorrectable { .. },
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn test_flash_slot_skips_bad_blocks() -> anyhow::Result<()> {
        let (mut board, main, _) = sim_board()?;
        let block = (main.offset / BLOCK) as u32 + 1;
        board.flash()?.nand_mut().block(block)?.unwrap().mark_bad()?;

        let image = legacy_image(0x3000, 0x2000);
        PartitionIo::new(board.flash()?, &main).write(0, &image)?;

        let mut slot = ImageSlot::flash(main, BLOCK);
        verify_flash(&mut slot, board.flash()?)?;
        assert_eq!(slot.image(), &image[..]);

        Ok(())
    }
}
