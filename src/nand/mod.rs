//! Abstractions and code to access raw NAND flash

use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The size of one eraseblock, in bytes
    pub fn block_size(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }

    /// The size of the whole device, in bytes
    pub fn device_size(&self) -> u64 {
        u64::from(self.blocks) * self.block_size()
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        ensure!(
            blocks != 0 && pages_per_block != 0 && bytes_per_page != 0,
            "every dimension of '{s}' must be non-zero"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// The outcome of the ECC engine for a read
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Ecc {
    /// No bitflips
    #[default]
    Clean,

    /// Bitflips were found and corrected; the data is good but the block is wearing out
    Corrected,

    /// Too many bitflips to correct; the returned data must not be trusted
    Uncorrectable,
}

impl Ecc {
    /// Combine the status of two reads, keeping the worst
    pub fn worst(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    ///
    /// An uncorrectable ECC error is not an `Err`: the content is still filled in (as the
    /// hardware delivered it) and the caller decides what that means.
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<Ecc>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Pages that report something other than `Ecc::Clean` until the next erase
    ecc_faults: HashMap<u32, Ecc>,

    /// Should the next erase fail?
    fail_erase: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Blocks filled entirely with the 0xBD pattern written by [SimNand::save] come back bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.layout.block_size() as usize;
        let mut buf = vec![0; size];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.ecc_faults.clear();
            block.marked_bad = buf.iter().all(|&x| x == 0xBD);
            if !block.marked_bad {
                let mut block = block;
                block.program(0, &buf)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let size = self.layout.block_size() as usize;
        let mut buf = vec![0; size];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => {
                    block.read(0, &mut buf)?;
                }
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Make reads of `page` in `block` report `ecc` until the block is next erased
    pub fn inject_ecc(&mut self, block: u32, page: u32, ecc: Ecc) -> anyhow::Result<()> {
        let Some(sim) = self.blocks.get_mut(block as usize) else {
            bail!("block {block} out of range");
        };
        ensure!(page < sim.page_count, "page index out of bounds");
        sim.ecc_faults.insert(page, ecc);
        Ok(())
    }

    /// Make the next erase of `block` fail
    pub fn inject_erase_failure(&mut self, block: u32) -> anyhow::Result<()> {
        let Some(sim) = self.blocks.get_mut(block as usize) else {
            bail!("block {block} out of range");
        };
        sim.fail_erase = true;
        Ok(())
    }

    /// Is `block` marked bad?
    pub fn is_bad(&self, block: u32) -> bool {
        self.blocks
            .get(block as usize)
            .map_or(true, |block| block.marked_bad)
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            ecc_faults: Default::default(),
            fail_erase: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<Ecc> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(self.ecc_faults.get(&index).copied().unwrap_or_default())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<Ecc> {
        let mut page = start_page;
        let mut ecc = Ecc::Clean;
        for chunk in content.chunks_mut(self.page_size()) {
            ecc = ecc.worst(self.read_page(page, chunk)?);
            page += 1;
        }
        Ok(ecc)
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        if std::mem::take(&mut self.fail_erase) {
            bail!("simulated erase failure");
        }

        self.data.clear();
        self.ecc_faults.clear();

        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.ecc_faults.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "64x32x512".parse().unwrap();
    assert_eq!(layout.block_size(), 0x4000);
    assert_eq!(layout.device_size(), 0x10_0000);

    for bad in ["0x4x2048", "4x0x2048", "4x4x0", "4x4", "4x4x4x4", "ax4x4"] {
        assert!(bad.parse::<NandLayout>().is_err(), "{bad}");
    }
}

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
    assert!(nand.is_bad(0));
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_ecc_injection() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_ecc(1, 3, Ecc::Corrected)?;
    nand.inject_ecc(1, 5, Ecc::Uncorrectable)?;

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page * 4];
    let mut block = nand.block(1)?.unwrap();
    assert_eq!(block.read(0, &mut buf)?, Ecc::Corrected);
    assert_eq!(block.read(2, &mut buf)?, Ecc::Uncorrectable);

    // A fresh erase means fresh cells
    block.erase()?;
    assert_eq!(block.read(2, &mut buf)?, Ecc::Clean);

    Ok(())
}

#[test]
fn test_sim_erase_failure() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_erase_failure(2)?;

    let mut block = nand.block(2)?.unwrap();
    assert!(block.erase().is_err());
    assert!(block.erase().is_ok());

    Ok(())
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block(3)?.unwrap().mark_bad()?;
    nand.block(0)?
        .unwrap()
        .program(0, &[0x55u8; TEST_LAYOUT.bytes_per_page])?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(image.len() as u64, TEST_LAYOUT.device_size());

    let mut reloaded = SimNand::new(TEST_LAYOUT);
    reloaded.load(&mut &image[..])?;
    assert!(reloaded.is_bad(3));

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
    reloaded.block(0)?.unwrap().read(0, &mut buf)?;
    assert!(buf.iter().all(|&x| x == 0x55));

    Ok(())
}
