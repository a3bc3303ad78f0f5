//! Builders for the images and flash the tests run against

use crate::board::Board;
use crate::config::{DEFAULT_BACKUP_PARTITION, DEFAULT_MAIN_PARTITION};
use crate::flash::SkipBadNand;
use crate::image::fdt::FDT_MAGIC;
use crate::image::fit::HashAlgo;
use crate::image::legacy::{ComputeCrc, DekuContainerWrite, LegacyHeader, LEGACY_CRC, LEGACY_MAGIC};
use crate::nand::{NandLayout, SimNand};
use crate::partition::{FlashPartition, PartitionTable};
use crate::rootfs::SQUASHFS_MAGIC;

/// Eraseblock size of the simulated board
pub const BLOCK: u64 = 0x4000;

const SIM_LAYOUT: &str = "64x32x512";
const SIM_MTDPARTS: &str = "64k(u-boot),448k(firmware),448k(firmware2),-(data)";

/// Filler that never contains an erased byte
fn pattern(len: usize, seed: usize) -> impl Iterator<Item = u8> {
    (0..len).map(move |i| ((i + seed) % 251) as u8)
}

/// A squashfs of `size` bytes: superblock magic and `bytes_used`, then filler. Never shorter
/// than a superblock probe.
pub fn squashfs(size: usize) -> Vec<u8> {
    let mut fs: Vec<u8> = pattern(size.max(48), size).collect();
    fs[..4].copy_from_slice(&SQUASHFS_MAGIC.to_le_bytes());
    fs[40..48].copy_from_slice(&(size as u64).to_le_bytes());
    fs
}

fn pad_to_block(image: &mut Vec<u8>) {
    let len = image.len().next_multiple_of(BLOCK as usize);
    image.resize(len, 0xFF);
}

/// A legacy image with a `payload_len` byte kernel, followed by a squashfs on the next
/// eraseblock boundary
pub fn legacy_image(payload_len: usize, rootfs_size: usize) -> Vec<u8> {
    let payload: Vec<u8> = pattern(payload_len, payload_len).collect();

    let mut name = [0u8; 32];
    name[..10].copy_from_slice(b"MIPS Linux");
    let mut header = LegacyHeader {
        magic: LEGACY_MAGIC,
        hcrc: 0,
        time: 0x6500_0000,
        size: payload_len as u32,
        load: 0x8000_1000,
        ep: 0x8000_1000,
        dcrc: LEGACY_CRC.checksum(&payload),
        os: 5,
        arch: 5,
        image_type: 2,
        comp: 3,
        name,
    };
    header.fix_crc().unwrap();

    let mut image = header.to_bytes().unwrap();
    image.extend_from_slice(&payload);
    pad_to_block(&mut image);
    image.extend_from_slice(&squashfs(rootfs_size));
    image
}

/// Writes flattened device trees, version 17
#[derive(Debug, Default)]
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn align(&mut self) {
        let len = self.structure.len().next_multiple_of(4);
        self.structure.resize(len, 0);
    }

    pub fn begin_node(&mut self, name: &str) {
        self.cell(0x1);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.align();
    }

    pub fn end_node(&mut self) {
        self.cell(0x2);
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) {
        let nameoff = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);

        self.cell(0x3);
        self.cell(value.len() as u32);
        self.cell(nameoff);
        self.structure.extend_from_slice(value);
        self.align();
    }

    pub fn prop_str(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes);
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) {
        self.prop(name, &value.to_be_bytes());
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.cell(0x9);

        let off_rsvmap = 40u32;
        let off_struct = off_rsvmap + 16;
        let off_strings = off_struct + self.structure.len() as u32;
        let total = off_strings + self.strings.len() as u32;

        let mut blob = Vec::with_capacity(total as usize);
        for cell in [
            FDT_MAGIC,
            total,
            off_struct,
            off_strings,
            off_rsvmap,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            blob.extend_from_slice(&cell.to_be_bytes());
        }
        blob.extend_from_slice(&[0; 16]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// Expected hash value for `algo`; algorithms the verifier does not know get a dummy value
fn hash_value(algo: &str, data: &[u8]) -> Vec<u8> {
    algo.parse::<HashAlgo>()
        .map(|algo| algo.digest(data))
        .unwrap_or_else(|_| vec![0xA5; 48])
}

fn hash_nodes(fdt: &mut FdtBuilder, algos: &[String], data: &[u8]) {
    for (i, algo) in algos.iter().enumerate() {
        fdt.begin_node(&format!("hash-{}", i + 1));
        fdt.prop_str("algo", algo);
        fdt.prop("value", &hash_value(algo, data));
        fdt.end_node();
    }
}

/// A FIT image with one kernel, optionally followed by a squashfs
#[derive(Debug, Clone)]
pub struct FitBuilder {
    kernel: Vec<u8>,
    kernel_hashes: Vec<String>,
    corrupt_kernel_hash: bool,
    rootfs_size: usize,
    rootfs_hashes: Option<Vec<String>>,
    declared_rootfs_size: Option<u32>,
}

impl FitBuilder {
    pub fn new(kernel: Vec<u8>) -> Self {
        Self {
            kernel,
            kernel_hashes: Vec::new(),
            corrupt_kernel_hash: false,
            rootfs_size: 0,
            rootfs_hashes: None,
            declared_rootfs_size: None,
        }
    }

    pub fn kernel_hash(mut self, algo: &str) -> Self {
        self.kernel_hashes.push(algo.to_string());
        self
    }

    /// Store a wrong value in the first kernel hash
    pub fn corrupt_kernel_hash(mut self) -> Self {
        self.corrupt_kernel_hash = true;
        self
    }

    pub fn rootfs(mut self, size: usize) -> Self {
        self.rootfs_size = size;
        self
    }

    /// Describe the rootfs in a `/rootfs` node with these hashes
    pub fn rootfs_hashes(mut self, algos: &[&str]) -> Self {
        self.rootfs_hashes = Some(algos.iter().map(|algo| algo.to_string()).collect());
        self
    }

    /// Override the `/rootfs` `size` property
    pub fn declared_rootfs_size(mut self, size: u32) -> Self {
        self.declared_rootfs_size = Some(size);
        self
    }

    pub fn build_tree(&self) -> Vec<u8> {
        let mut fdt = FdtBuilder::new();
        fdt.begin_node("");
        fdt.prop_str("description", "MT7621 firmware");

        fdt.begin_node("images");
        fdt.begin_node("kernel-1");
        fdt.prop("data", &self.kernel);
        fdt.prop_str("type", "kernel");
        for (i, algo) in self.kernel_hashes.iter().enumerate() {
            let mut value = hash_value(algo, &self.kernel);
            if self.corrupt_kernel_hash && i == 0 {
                value[0] ^= 0xFF;
            }
            fdt.begin_node(&format!("hash-{}", i + 1));
            fdt.prop_str("algo", algo);
            fdt.prop("value", &value);
            fdt.end_node();
        }
        fdt.end_node();
        fdt.end_node();

        if let Some(algos) = &self.rootfs_hashes {
            let size = self
                .declared_rootfs_size
                .unwrap_or(self.rootfs_size as u32);
            fdt.begin_node("rootfs");
            fdt.prop_u32("size", size);
            hash_nodes(&mut fdt, algos, &squashfs(self.rootfs_size));
            fdt.end_node();
        }

        fdt.end_node();
        fdt.finish()
    }

    /// The tree, padded to an eraseblock boundary, then the squashfs
    pub fn build(&self) -> Vec<u8> {
        let mut image = self.build_tree();
        pad_to_block(&mut image);
        image.extend_from_slice(&squashfs(self.rootfs_size));
        image
    }
}

/// A 1 MiB simulated NAND board, with main and backup partitions of 448 KiB
pub fn sim_board(
) -> anyhow::Result<(Board<SkipBadNand<SimNand>>, FlashPartition, FlashPartition)> {
    let layout: NandLayout = SIM_LAYOUT.parse()?;
    let table = PartitionTable::parse_mtdparts(SIM_MTDPARTS, layout.device_size())?;
    let board = Board::new(Some(SkipBadNand::new(SimNand::new(layout))), table);

    let main = board.resolve(DEFAULT_MAIN_PARTITION)?;
    let backup = board.resolve(DEFAULT_BACKUP_PARTITION)?;

    Ok((board, main, backup))
}
