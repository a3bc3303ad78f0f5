//! Dual-image firmware integrity checking and recovery for MT7621 boards.
//!
//! The board stores its firmware (a kernel image followed by a squashfs root filesystem) twice,
//! in a main and a backup partition. [dual_image::DualImage::check] verifies both copies and
//! rewrites whichever is broken from the other.

pub mod board;
pub mod config;
pub mod dual_image;
pub mod eofs;
pub mod flash;
pub mod image;
pub mod nand;
pub mod partition;
pub mod rootfs;
pub mod util;
pub mod verify;

#[cfg(test)]
mod testutil;
