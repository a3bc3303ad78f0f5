//! Named flash partitions, and partition-scoped flash access.

use crate::flash::{align_down, align_up, FlashDevice, FlashError, ReadStatus};

use std::str::FromStr;

/// A named region of a flash device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPartition {
    pub name: String,

    /// Byte offset of the partition on the device
    pub offset: u64,

    /// Byte length of the partition
    pub size: u64,

    /// Marked `ro` in the partition table; informational only
    pub read_only: bool,
}

impl FlashPartition {
    pub fn new(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            read_only: false,
        }
    }

    /// The first device offset past the partition
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("partition '{0}' not found")]
    NotFound(String),

    #[error("invalid mtdparts: {0}")]
    Parse(String),
}

/// The partition table of one flash device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    parts: Vec<FlashPartition>,
}

impl PartitionTable {
    pub fn new(parts: Vec<FlashPartition>) -> Self {
        Self { parts }
    }

    /// Find a partition by name
    pub fn lookup(&self, name: &str) -> Result<&FlashPartition, PartitionError> {
        self.parts
            .iter()
            .find(|part| part.name == name)
            .ok_or_else(|| PartitionError::NotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlashPartition> {
        self.parts.iter()
    }

    /// Parse a Linux/U-Boot style `mtdparts` definition, e.g.
    /// `nmbm0:512k(u-boot),512k(config),-(firmware)`.
    ///
    /// A `-` size takes the rest of the device; an omitted `@offset` follows the previous entry.
    pub fn parse_mtdparts(mtdparts: &str, device_size: u64) -> Result<Self, PartitionError> {
        let mtdparts = mtdparts.trim();

        // Strip the optional leading `mtd-id:`
        let mtdparts = match mtdparts.split_once(':') {
            Some((id, rest)) if !id.contains('(') => rest,
            _ => mtdparts,
        };

        let mut parts = Vec::new();
        let mut next_offset = 0u64;

        for entry in mtdparts.split(',').filter(|entry| !entry.is_empty()) {
            let (geometry, rest) = entry
                .split_once('(')
                .ok_or_else(|| PartitionError::Parse(format!("'{entry}' has no name")))?;
            let (name, flags) = rest
                .split_once(')')
                .ok_or_else(|| PartitionError::Parse(format!("'{entry}' has unclosed name")))?;

            let (size, offset) = match geometry.split_once('@') {
                Some((size, offset)) => (size, Some(parse_size(offset)?)),
                None => (geometry, None),
            };
            let offset = offset.unwrap_or(next_offset);

            let size = match size {
                "-" => device_size.checked_sub(offset).ok_or_else(|| {
                    PartitionError::Parse(format!("'{name}' starts past the end of flash"))
                })?,
                size => parse_size(size)?,
            };

            let end = offset
                .checked_add(size)
                .filter(|&end| end <= device_size)
                .ok_or_else(|| {
                    PartitionError::Parse(format!("'{name}' extends past the end of flash"))
                })?;

            parts.push(FlashPartition {
                name: name.to_string(),
                offset,
                size,
                read_only: flags.contains("ro"),
            });
            next_offset = end;
        }

        Ok(Self { parts })
    }
}

/// Parse a size like `512k`, `0x40000` or `16M`
fn parse_size(s: &str) -> Result<u64, PartitionError> {
    let bad = || PartitionError::Parse(format!("bad size '{s}'"));

    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 10),
        Some((i, 'm' | 'M')) => (&s[..i], 20),
        Some((i, 'g' | 'G')) => (&s[..i], 30),
        _ => (s, 0),
    };

    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => u64::from_str(digits),
    }
    .map_err(|_| bad())?;

    value.checked_mul(1 << shift).ok_or_else(bad)
}

/// Flash access confined to one partition, addressed by offset within it.
///
/// Offsets are logical: they count only good blocks from the start of the partition, and the
/// end of the partition is passed down as the limit of every access.
pub struct PartitionIo<'a, F: ?Sized> {
    flash: &'a mut F,
    part: &'a FlashPartition,
}

impl<'a, F: FlashDevice + ?Sized> PartitionIo<'a, F> {
    pub fn new(flash: &'a mut F, part: &'a FlashPartition) -> Self {
        Self { flash, part }
    }

    pub fn partition(&self) -> &FlashPartition {
        self.part
    }

    pub fn erase_size(&self) -> u64 {
        self.flash.erase_size()
    }

    /// Resolve the device offset of `offset..offset+len` in this partition
    fn physical(&mut self, offset: u64, len: u64) -> Result<u64, FlashError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.part.size => (),
            _ => {
                return Err(FlashError::LimitExceeded {
                    offset: self.part.offset.saturating_add(offset),
                    len,
                    limit: self.part.end(),
                })
            }
        }

        self.flash
            .adjust_offset(self.part.offset, offset, self.part.end())
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<ReadStatus, FlashError> {
        let physical = self.physical(offset, buf.len() as u64)?;
        self.flash.read(physical, buf, Some(self.part.end()))
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        let physical = self.physical(offset, data.len() as u64)?;
        self.flash.write(physical, data, Some(self.part.end()))
    }

    /// Erase whole eraseblocks covering `offset..offset+len`
    pub fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        let erase_size = self.erase_size();
        let start = align_down(offset, erase_size);
        let end = align_up(offset.saturating_add(len), erase_size);

        let physical = self.physical(start, end - start)?;
        self.flash
            .erase(physical, end - start, Some(self.part.end()))
    }
}

#[test]
fn test_parse_mtdparts() -> anyhow::Result<()> {
    let table = PartitionTable::parse_mtdparts(
        "nmbm0:512k(u-boot)ro,256k(config),0x10000@0xc0000(factory),-(firmware)",
        0x200000,
    )?;

    let names: Vec<_> = table.iter().map(|part| part.name.as_str()).collect();
    assert_eq!(names, ["u-boot", "config", "factory", "firmware"]);

    assert_eq!(
        table.lookup("u-boot")?,
        &FlashPartition {
            name: "u-boot".into(),
            offset: 0,
            size: 0x80000,
            read_only: true,
        }
    );
    assert_eq!(table.lookup("config")?.offset, 0x80000);
    assert_eq!(table.lookup("factory")?.offset, 0xc0000);
    assert_eq!(table.lookup("firmware")?.offset, 0xd0000);
    assert_eq!(table.lookup("firmware")?.end(), 0x200000);

    assert!(matches!(
        table.lookup("rootfs_data"),
        Err(PartitionError::NotFound(_))
    ));

    Ok(())
}

#[test]
fn test_parse_mtdparts_errors() {
    assert!(PartitionTable::parse_mtdparts("1m(a),2m(b)", 0x200000).is_err());
    assert!(PartitionTable::parse_mtdparts("1m(a", 0x200000).is_err());
    assert!(PartitionTable::parse_mtdparts("1q(a)", 0x200000).is_err());
    assert!(PartitionTable::parse_mtdparts("-@3m(a)", 0x200000).is_err());
    assert!(PartitionTable::parse_mtdparts("512(a)", 0x200000).is_ok());
}

#[test]
fn test_partition_io_logical_offsets() -> anyhow::Result<()> {
    use crate::flash::SkipBadNand;
    use crate::nand::{Nand, NandBlock, NandLayout, SimNand};

    const LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 4,
        bytes_per_page: 256,
    };

    let mut nand = SimNand::new(LAYOUT);
    nand.block(3)?.unwrap().mark_bad()?;
    let mut flash = SkipBadNand::new(nand);

    let part = FlashPartition::new("firmware", 2048, 4096);
    let mut io = PartitionIo::new(&mut flash, &part);

    let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    io.write(0, &data)?;

    // Logical offset 1024 lives past the bad block 3
    let mut buf = vec![0u8; 1024];
    io.read(1024, &mut buf)?;
    assert_eq!(buf, data[1024..]);

    // The partition has four blocks but only three good ones
    assert!(io.read(3072, &mut buf).is_err());
    assert!(matches!(
        io.read(4000, &mut buf),
        Err(FlashError::LimitExceeded { .. })
    ));

    io.erase(100, 10)?;
    io.read(0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0xFF));
    io.read(1024, &mut buf)?;
    assert_eq!(buf, data[1024..]);

    Ok(())
}
