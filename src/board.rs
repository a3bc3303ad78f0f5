//! The board registry: one flash device and the partition table laid over it.

use crate::flash::FlashDevice;
use crate::partition::{FlashPartition, PartitionError, PartitionTable};

/// Errors in the board configuration, as opposed to the data stored on it
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no flash device available")]
    NoFlashDevice,

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("flash device reports no erase size")]
    NoEraseSize,

    #[error("partition '{name}' is not aligned to the 0x{erase_size:x} erase size")]
    Misaligned { name: String, erase_size: u64 },

    #[error("partition '{name}' extends past the end of flash")]
    OutOfRange { name: String },

    #[error("partitions '{first}' and '{second}' overlap")]
    Overlapping { first: String, second: String },
}

/// Owns the flash device for the duration of a check, along with the partitions on it
#[derive(Debug)]
pub struct Board<F> {
    flash: Option<F>,
    partitions: PartitionTable,
}

impl<F: FlashDevice> Board<F> {
    /// `flash` is `None` when probing the device failed; every flash operation then reports
    /// [ConfigError::NoFlashDevice].
    pub fn new(flash: Option<F>, partitions: PartitionTable) -> Self {
        Self { flash, partitions }
    }

    pub fn flash(&mut self) -> Result<&mut F, ConfigError> {
        self.flash.as_mut().ok_or(ConfigError::NoFlashDevice)
    }

    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    pub fn into_flash(self) -> Option<F> {
        self.flash
    }

    /// Look up a partition by name and check that it can be used on this device
    pub fn resolve(&self, name: &str) -> Result<FlashPartition, ConfigError> {
        let flash = self.flash.as_ref().ok_or(ConfigError::NoFlashDevice)?;
        let part = self.partitions.lookup(name)?;

        let erase_size = flash.erase_size();
        if erase_size == 0 {
            return Err(ConfigError::NoEraseSize);
        }
        if part.offset % erase_size != 0 || part.size % erase_size != 0 {
            return Err(ConfigError::Misaligned {
                name: name.to_string(),
                erase_size,
            });
        }
        if part.end() > flash.size() || part.size == 0 {
            return Err(ConfigError::OutOfRange {
                name: name.to_string(),
            });
        }

        Ok(part.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{NorAdapter, SimNor, SkipBadNand};
    use crate::nand::{NandLayout, SimNand};

    #[test]
    fn test_resolve() -> anyhow::Result<()> {
        let flash = NorAdapter::new(SimNor::new(64 * 1024));
        let table = PartitionTable::new(vec![
            FlashPartition::new("firmware", 0x4000, 0x8000),
            FlashPartition::new("crooked", 0x4100, 0x1000),
            FlashPartition::new("beyond", 0xc000, 0x8000),
        ]);
        let board = Board::new(Some(flash), table);

        assert_eq!(board.resolve("firmware")?.offset, 0x4000);
        assert!(matches!(
            board.resolve("crooked"),
            Err(ConfigError::Misaligned { .. })
        ));
        assert!(matches!(
            board.resolve("beyond"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            board.resolve("nonexistent"),
            Err(ConfigError::Partition(PartitionError::NotFound(_)))
        ));

        Ok(())
    }

    #[test]
    fn test_missing_flash() {
        let table = PartitionTable::new(vec![FlashPartition::new("firmware", 0, 0x1000)]);
        let mut board: Board<NorAdapter<SimNor>> = Board::new(None, table);

        assert!(matches!(board.flash(), Err(ConfigError::NoFlashDevice)));
        assert!(matches!(
            board.resolve("firmware"),
            Err(ConfigError::NoFlashDevice)
        ));
    }

    #[test]
    fn test_zero_erase_size() {
        let nand = SimNand::new(NandLayout {
            blocks: 4,
            pages_per_block: 0,
            bytes_per_page: 2048,
        });
        let table = PartitionTable::new(vec![FlashPartition::new("firmware", 0, 0x1000)]);
        let board = Board::new(Some(SkipBadNand::new(nand)), table);

        assert!(matches!(
            board.resolve("firmware"),
            Err(ConfigError::NoEraseSize)
        ));
    }
}
