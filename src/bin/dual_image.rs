//! Operator front end for the dual-image check.
//!
//! Runs against the board's real flash through MTD, or against a file holding a simulated NAND
//! or SPI-NOR chip, which is handy for trying out images before they go anywhere near a board.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::Level;

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::ExitCode;

#[cfg(target_os = "linux")]
use mt7621_dual_image::nand::mtd::MtdNand;
use mt7621_dual_image::{
    board::Board,
    config::{
        DualImageConfig, UnknownFingerprint, DEFAULT_BACKUP_PARTITION, DEFAULT_MAIN_PARTITION,
    },
    dual_image::{DualImage, SlotReport},
    flash::{FlashDevice, FlashError, NorAdapter, ReadStatus, SimNor, SkipBadNand},
    nand::{NandLayout, SimNand},
    partition::PartitionTable,
    util::ReadExt,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct FlashOptions {
    /// Name of the MTD device holding the firmware partitions
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device holding the firmware partitions
    #[cfg(target_os = "linux")]
    #[clap(long, group = "flash-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to a simulated NAND image
    #[clap(long, group = "flash-options", requires = "sim_layout")]
    sim_nand: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Path to a simulated SPI-NOR image
    #[clap(long, group = "flash-options")]
    sim_nor: Option<PathBuf>,

    /// Write the simulated flash back to its file when done
    #[clap(long)]
    sim_write: bool,
}

impl FlashOptions {
    fn open(&self) -> Result<FlashImpl> {
        if let Some(path) = &self.sim_nor {
            let nor = SimNor::from_vec(fs::read(path)?)?;
            return Ok(FlashImpl::SimNor(NorAdapter::new(nor)));
        }

        let flash = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_nand {
                sim.load(&mut File::open(path)?)?;
            }

            FlashImpl::SimNand(SkipBadNand::new(sim))
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                FlashImpl::Mtd(SkipBadNand::new(mtd))
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(flash)
    }

    fn cleanup(&self, flash: Option<FlashImpl>) -> Result<()> {
        if !self.sim_write {
            return Ok(());
        }

        match flash {
            Some(FlashImpl::SimNand(nand)) => {
                if let Some(path) = &self.sim_nand {
                    nand.into_inner().save(&mut File::create(path)?)?;
                }
            }
            Some(FlashImpl::SimNor(nor)) => {
                if let Some(path) = &self.sim_nor {
                    fs::write(path, nor.into_inner().as_bytes())?;
                }
            }
            _ => (),
        }

        Ok(())
    }
}

#[derive(Debug)]
enum FlashImpl {
    SimNand(SkipBadNand<SimNand>),
    SimNor(NorAdapter<SimNor>),

    #[cfg(target_os = "linux")]
    Mtd(SkipBadNand<MtdNand>),
}

impl FlashDevice for FlashImpl {
    fn size(&self) -> u64 {
        match self {
            Self::SimNand(flash) => flash.size(),
            Self::SimNor(flash) => flash.size(),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.size(),
        }
    }

    fn erase_size(&self) -> u64 {
        match self {
            Self::SimNand(flash) => flash.erase_size(),
            Self::SimNor(flash) => flash.erase_size(),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.erase_size(),
        }
    }

    fn adjust_offset(&mut self, base: u64, offset: u64, limit: u64) -> Result<u64, FlashError> {
        match self {
            Self::SimNand(flash) => flash.adjust_offset(base, offset, limit),
            Self::SimNor(flash) => flash.adjust_offset(base, offset, limit),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.adjust_offset(base, offset, limit),
        }
    }

    fn erase(&mut self, offset: u64, len: u64, limit: Option<u64>) -> Result<(), FlashError> {
        match self {
            Self::SimNand(flash) => flash.erase(offset, len, limit),
            Self::SimNor(flash) => flash.erase(offset, len, limit),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.erase(offset, len, limit),
        }
    }

    fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> Result<ReadStatus, FlashError> {
        match self {
            Self::SimNand(flash) => flash.read(offset, buf, limit),
            Self::SimNor(flash) => flash.read(offset, buf, limit),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.read(offset, buf, limit),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8], limit: Option<u64>) -> Result<(), FlashError> {
        match self {
            Self::SimNand(flash) => flash.write(offset, data, limit),
            Self::SimNor(flash) => flash.write(offset, data, limit),

            #[cfg(target_os = "linux")]
            Self::Mtd(flash) => flash.write(offset, data, limit),
        }
    }
}

#[derive(Args, Debug)]
struct ConfigOptions {
    /// Partition holding the main image
    #[clap(long, default_value = DEFAULT_MAIN_PARTITION)]
    main_partition: String,

    /// Partition holding the backup image
    #[clap(long, default_value = DEFAULT_BACKUP_PARTITION)]
    backup_partition: String,

    /// How to compare two valid images when either carries no fingerprint
    #[clap(long, value_enum, default_value_t)]
    unknown_fingerprint: UnknownFingerprint,

    /// Do not append end-of-filesystem markers to restored images
    #[clap(long)]
    no_eofs_marker: bool,
}

impl From<ConfigOptions> for DualImageConfig {
    fn from(value: ConfigOptions) -> Self {
        DualImageConfig::default()
            .main_partition(value.main_partition)
            .backup_partition(value.backup_partition)
            .unknown_fingerprint(value.unknown_fingerprint)
            .eofs_marker(!value.no_eofs_marker)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify both images and restore whichever is broken
    Check,

    /// Verify both images and print what was found; this is a read-only operation
    Inspect,

    /// Verify an image file the way a freshly downloaded image is verified
    VerifyImage {
        /// The path to the image
        path: PathBuf,

        /// Also require the image to fit in this partition
        #[clap(long)]
        partition: Option<String>,
    },

    /// Verify an image file, then write it to the backup partition
    UpdateBackup {
        /// The path to the image
        path: PathBuf,
    },
}

fn print_report(role: &str, report: &SlotReport) {
    let name = report
        .slot
        .partition()
        .map_or("-", |part| part.name.as_str());

    match &report.verdict {
        Ok(verdict) => {
            let geometry = report.slot.geometry();
            let fingerprint = verdict.fingerprint.map_or("none".to_string(), |fp| {
                fp.iter().map(|b| format!("{b:02x}")).collect()
            });
            println!(
                "{role:6} {name}: {} image, kernel 0x{:x}, padding 0x{:x}, rootfs 0x{:x}, \
                 fingerprint {fingerprint}",
                verdict.format, geometry.kernel_size, geometry.padding_size, geometry.rootfs_size,
            );
        }
        Err(e) => println!("{role:6} {name}: invalid: {e}"),
    }
}

impl Command {
    /// Run the command, returning its status code
    fn execute<F: FlashDevice>(
        self,
        board: &mut Board<F>,
        config: DualImageConfig,
    ) -> Result<i32> {
        let image_limit = board.flash()?.size() as usize;
        let main_partition = config.main_partition.clone();
        let mut dual = DualImage::new(board, config);

        let code = match self {
            Command::Check => {
                let outcome = dual.check();
                println!("{outcome}");
                outcome.code()
            }

            Command::Inspect => {
                let (main, backup) = dual.inspect()?;
                print_report("main", &main);
                print_report("backup", &backup);
                0
            }

            Command::VerifyImage { path, partition } => {
                let image = File::open(path)?.read_image(image_limit)?;
                match dual.check_single_ram(image, partition.as_deref()) {
                    Ok((slot, _)) => {
                        let geometry = slot.geometry();
                        println!(
                            "valid image, 0x{:x} bytes with 0x{:x} marker bytes",
                            geometry.image_size(),
                            geometry.marker_size
                        );
                        0
                    }
                    Err(e) => {
                        println!("{e}");
                        e.code()
                    }
                }
            }

            Command::UpdateBackup { path } => {
                let image = File::open(path)?.read_image(image_limit)?;
                let slot = match dual.check_single_ram(image, Some(&main_partition)) {
                    Ok((slot, _)) => slot,
                    Err(e) => {
                        println!("{e}");
                        return Ok(e.code());
                    }
                };

                match dual.update_backup(&slot) {
                    Ok(()) => 0,
                    Err(e) => {
                        println!("{e}");
                        e.code()
                    }
                }
            }
        };

        Ok(code)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash to use
    #[clap(flatten)]
    flash: FlashOptions,

    /// Partition layout of the flash, in mtdparts syntax
    #[clap(long)]
    mtdparts: String,

    #[clap(flatten)]
    config: ConfigOptions,

    /// Log every read and probe
    #[clap(long, short)]
    verbose: bool,

    /// The command to run against this flash
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let flash = args.flash.open()?;
    let partitions = PartitionTable::parse_mtdparts(&args.mtdparts, flash.size())?;
    let mut board = Board::new(Some(flash), partitions);

    let code = args.cmd.execute(&mut board, args.config.into())?;
    args.flash.cleanup(board.into_flash())?;

    // Negative codes wrap, as they would coming from a shell
    Ok(ExitCode::from(code as u8))
}
