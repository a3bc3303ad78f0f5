//! The dual-image reconciler.
//!
//! The board keeps two copies of its firmware, in the main and backup partitions. Both are
//! verified; a broken copy is rewritten from the good one, and when both are good but differ,
//! main wins and the backup is brought up to date.

use crate::board::{Board, ConfigError};
use crate::config::{DualImageConfig, UnknownFingerprint};
use crate::flash::{FlashDevice, FlashError};
use crate::partition::{FlashPartition, PartitionIo};
use crate::rootfs::DEFAULT_SCAN_ALIGN;
use crate::verify::{verify_flash, verify_ram, ImageSlot, Rejection, Verdict};

use tracing::{debug, error, info, warn};

use std::fmt;

/// The result of one dual-image check
#[derive(Debug)]
pub enum Outcome {
    /// Both images are valid and the same; nothing was written
    Passed,

    /// The backup image was rewritten from main
    RestoredBackup,

    /// The main image was rewritten from the backup
    RestoredMain,

    /// The board is misconfigured, so neither image was looked at
    Bypassed(ConfigError),

    /// Neither image is valid
    BothBroken,

    /// A restore was attempted and did not read back correctly
    RestoreFailed(RestoreError),
}

impl Outcome {
    /// The status code reported to the boot environment
    pub fn code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::RestoredBackup => 1,
            Self::RestoredMain => 2,
            Self::Bypassed(_) => -1,
            Self::BothBroken => -2,
            Self::RestoreFailed(_) => -3,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "firmware images verified"),
            Self::RestoredBackup => write!(f, "backup image restored from main"),
            Self::RestoredMain => write!(f, "main image restored from backup"),
            Self::Bypassed(e) => write!(f, "dual image check bypassed: {e}"),
            Self::BothBroken => write!(f, "both firmware images are broken"),
            Self::RestoreFailed(e) => write!(f, "image restoration failed: {e}"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Decision {
    Pass,
    RestoreBackup,
    RestoreMain,
    BothBroken,
}

/// What to do about the two images. `same` only matters when both are valid.
pub fn decide(main_ok: bool, backup_ok: bool, same: bool) -> Decision {
    match (main_ok, backup_ok) {
        (true, true) if same => Decision::Pass,
        (true, _) => Decision::RestoreBackup,
        (false, true) => Decision::RestoreMain,
        (false, false) => Decision::BothBroken,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("target has no partition")]
    NoPartition,

    #[error("image size 0x{size:x} exceeds partition '{name}' size 0x{capacity:x}")]
    TooSmall {
        name: String,
        size: u64,
        capacity: u64,
    },

    #[error("erase failed: {0}")]
    Erase(#[source] FlashError),

    #[error("write failed: {0}")]
    Write(#[source] FlashError),

    #[error("reading back 0x{offset:x} failed: {source}")]
    VerifyRead { offset: u64, source: FlashError },

    #[error("written image differs at 0x{offset:x}")]
    VerifyMismatch { offset: u64 },
}

/// Write the image staged in `source` to the partition of `target`, then read it back block by
/// block and compare.
///
/// The read-back goes through `target`'s staging buffer, so any image staged there is discarded.
pub fn copy_image<F: FlashDevice + ?Sized>(
    flash: &mut F,
    target: &mut ImageSlot,
    source: &ImageSlot,
) -> Result<(), RestoreError> {
    let part = target
        .partition()
        .cloned()
        .ok_or(RestoreError::NoPartition)?;
    let image = source.image();
    let size = image.len() as u64;

    if size > part.size {
        return Err(RestoreError::TooSmall {
            name: part.name,
            size,
            capacity: part.size,
        });
    }

    let mut io = PartitionIo::new(flash, &part);
    let chunk = io.erase_size().max(1);

    let rpt = howudoin::new()
        .label(format!("Restoring '{}'", part.name))
        .set_len(size.div_ceil(chunk) + 2);

    info!("Writing 0x{size:x} bytes to '{}'", part.name);
    io.erase(0, size).map_err(RestoreError::Erase)?;
    rpt.inc();
    io.write(0, image).map_err(RestoreError::Write)?;
    rpt.inc();

    let buf = target.scratch(chunk as usize);
    for (i, expected) in image.chunks(chunk as usize).enumerate() {
        let offset = i as u64 * chunk;
        let actual = &mut buf[..expected.len()];

        io.read(offset, actual)
            .map_err(|source| RestoreError::VerifyRead { offset, source })?;

        if let Some(pos) = actual.iter().zip(expected).position(|(a, b)| a != b) {
            rpt.close();
            return Err(RestoreError::VerifyMismatch {
                offset: offset + pos as u64,
            });
        }
        rpt.inc();
    }

    rpt.close();
    debug!("0x{size:x} bytes read back from '{}'", part.name);

    Ok(())
}

/// Mark the source's rootfs end, if enabled, and copy it over the target
fn restore<F: FlashDevice + ?Sized>(
    flash: &mut F,
    target: &mut ImageSlot,
    source: &mut ImageSlot,
    eofs_marker: bool,
) -> Result<(), RestoreError> {
    if eofs_marker {
        let capacity = target.partition().map_or(0, |part| part.size);
        source.pad_eofs(capacity);
    }

    copy_image(flash, target, source)
}

/// One slot, after verification
#[derive(Debug)]
pub struct SlotReport {
    pub slot: ImageSlot,
    pub verdict: Result<Verdict, Rejection>,
}

impl SlotReport {
    pub fn is_valid(&self) -> bool {
        self.verdict.is_ok()
    }
}

fn verify_slot<F: FlashDevice + ?Sized>(
    role: &str,
    mut slot: ImageSlot,
    flash: &mut F,
) -> SlotReport {
    let name = slot
        .partition()
        .map(|part| part.name.clone())
        .unwrap_or_default();
    info!("Verifying {role} image in '{name}'");

    let verdict = verify_flash(&mut slot, flash);
    match &verdict {
        Ok(verdict) => info!("{role} image is a valid {} image", verdict.format),
        Err(e) => warn!("{role} image in '{name}' is invalid: {e}"),
    }

    SlotReport { slot, verdict }
}

#[derive(Debug, thiserror::Error)]
pub enum RamCheckError {
    #[error("no image data")]
    Empty,

    #[error(transparent)]
    NoDevice(ConfigError),

    #[error(transparent)]
    UnsupportedFormat(Rejection),

    #[error("image verification failed: {0}")]
    Failed(Rejection),
}

impl RamCheckError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Empty => -22,
            Self::NoDevice(_) => -19,
            Self::UnsupportedFormat(_) => -1,
            Self::Failed(_) => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateBackupError {
    #[error("image has not been verified")]
    NotVerified,

    #[error(transparent)]
    NoDevice(ConfigError),

    #[error("backup update failed: {0}")]
    Restore(RestoreError),
}

impl UpdateBackupError {
    pub fn code(&self) -> i32 {
        match self {
            Self::NotVerified => -22,
            Self::NoDevice(_) => -19,
            Self::Restore(_) => 1,
        }
    }
}

/// Runs checks against the two firmware partitions of a board
pub struct DualImage<'a, F> {
    board: &'a mut Board<F>,
    config: DualImageConfig,
}

impl<'a, F: FlashDevice> DualImage<'a, F> {
    pub fn new(board: &'a mut Board<F>, config: DualImageConfig) -> Self {
        Self { board, config }
    }

    pub fn config(&self) -> &DualImageConfig {
        &self.config
    }

    fn resolve_pair(&self) -> Result<(FlashPartition, FlashPartition), ConfigError> {
        let main = self.board.resolve(&self.config.main_partition)?;
        let backup = self.board.resolve(&self.config.backup_partition)?;

        if main.offset < backup.end() && backup.offset < main.end() {
            return Err(ConfigError::Overlapping {
                first: main.name,
                second: backup.name,
            });
        }

        Ok((main, backup))
    }

    /// Verify both images, changing nothing
    pub fn inspect(&mut self) -> Result<(SlotReport, SlotReport), ConfigError> {
        let (main, backup) = self.resolve_pair()?;
        let flash = self.board.flash()?;
        let erase_size = flash.erase_size();

        let main = verify_slot("main", ImageSlot::flash(main, erase_size), flash);
        let backup = verify_slot("backup", ImageSlot::flash(backup, erase_size), flash);

        Ok((main, backup))
    }

    /// Are two valid images the same build?
    fn same_build(&self, main: &SlotReport, backup: &SlotReport) -> bool {
        let (Ok(main_verdict), Ok(backup_verdict)) = (&main.verdict, &backup.verdict) else {
            return false;
        };

        match (main_verdict.fingerprint, backup_verdict.fingerprint) {
            (Some(a), Some(b)) => {
                debug!("fingerprints: main {a:02x?}, backup {b:02x?}");
                a == b
            }
            (main_fp, backup_fp) => match self.config.unknown_fingerprint {
                UnknownFingerprint::Pairwise => main_fp.is_none() && backup_fp.is_none(),
                UnknownFingerprint::Restore => false,
                UnknownFingerprint::Trust => true,
                UnknownFingerprint::Compare => main.slot.image() == backup.slot.image(),
            },
        }
    }

    /// Verify both images and repair whichever needs it
    pub fn check(&mut self) -> Outcome {
        let (mut main, mut backup) = match self.inspect() {
            Ok(reports) => reports,
            Err(e) => {
                error!("Dual image check bypassed: {e}");
                return Outcome::Bypassed(e);
            }
        };

        let same = self.same_build(&main, &backup);
        let decision = decide(main.is_valid(), backup.is_valid(), same);
        debug!("decision: {decision:?}");

        let eofs_marker = self.config.eofs_marker;
        let flash = match self.board.flash() {
            Ok(flash) => flash,
            Err(e) => return Outcome::Bypassed(e),
        };

        match decision {
            Decision::Pass => {
                info!("Firmware images verified");
                Outcome::Passed
            }

            Decision::BothBroken => {
                error!("Both firmware images are broken, no recovery possible");
                Outcome::BothBroken
            }

            Decision::RestoreBackup => {
                match backup.is_valid() {
                    true => info!("Firmware images differ, updating backup from main"),
                    false => warn!("Restoring backup image from main"),
                }

                match restore(flash, &mut backup.slot, &mut main.slot, eofs_marker) {
                    Ok(()) => {
                        info!("Backup image restored");
                        Outcome::RestoredBackup
                    }
                    Err(e) => {
                        error!("Backup image restoration failed: {e}");
                        Outcome::RestoreFailed(e)
                    }
                }
            }

            Decision::RestoreMain => {
                warn!("Restoring main image from backup");

                match restore(flash, &mut main.slot, &mut backup.slot, eofs_marker) {
                    Ok(()) => {
                        info!("Main image restored");
                        Outcome::RestoredMain
                    }
                    Err(e) => {
                        error!("Main image restoration failed: {e}");
                        Outcome::RestoreFailed(e)
                    }
                }
            }
        }
    }

    /// Verify an image held in memory, such as one just downloaded.
    ///
    /// With `partition`, the image must also fit in that partition. Whatever follows the
    /// rootfs is kept as marker bytes.
    pub fn check_single_ram(
        &mut self,
        data: Vec<u8>,
        partition: Option<&str>,
    ) -> Result<(ImageSlot, Verdict), RamCheckError> {
        if data.is_empty() {
            return Err(RamCheckError::Empty);
        }

        // Only a named partition needs the flash
        let partition = partition
            .map(|name| self.board.resolve(name))
            .transpose()
            .map_err(RamCheckError::NoDevice)?;
        let erase_size = self
            .board
            .flash()
            .map_or(DEFAULT_SCAN_ALIGN, |flash| flash.erase_size());

        info!("Verifying 0x{:x} byte image in memory", data.len());
        let mut slot = ImageSlot::ram(data, partition, erase_size);

        match verify_ram(&mut slot) {
            Ok(verdict) => {
                info!("Image is a valid {} image", verdict.format);
                Ok((slot, verdict))
            }
            Err(e @ Rejection::UnknownFormat { .. }) => {
                warn!("{e}");
                Err(RamCheckError::UnsupportedFormat(e))
            }
            Err(e) => {
                warn!("Image is invalid: {e}");
                Err(RamCheckError::Failed(e))
            }
        }
    }

    /// Write a verified image, marker bytes and all, to the backup partition
    pub fn update_backup(&mut self, slot: &ImageSlot) -> Result<(), UpdateBackupError> {
        if slot.geometry().rootfs_size == 0 {
            return Err(UpdateBackupError::NotVerified);
        }

        let part = self
            .board
            .resolve(&self.config.backup_partition)
            .map_err(UpdateBackupError::NoDevice)?;
        let flash = self.board.flash().map_err(UpdateBackupError::NoDevice)?;
        let mut target = ImageSlot::flash(part, flash.erase_size());

        info!("Updating backup image");
        copy_image(flash, &mut target, slot).map_err(|e| {
            error!("Backup update failed: {e}");
            UpdateBackupError::Restore(e)
        })?;
        info!("Backup image updated");

        Ok(())
    }
}
