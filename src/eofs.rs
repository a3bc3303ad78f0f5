//! JFFS2 end-of-filesystem marker.
//!
//! OpenWrt keeps its writable overlay (rootfs_data) in the space after the squashfs. When an
//! image is restored, whatever overlay the target partition held must not be picked up again,
//! so the restored image gets `DE AD C0 DE` markers past the rootfs at every power-of-two
//! offset (from 4 KiB) inside the last eraseblock, and at the start of the next one.

use crate::flash::{align_down, align_up};

use tracing::debug;

pub const EOFS_MARKER: [u8; 4] = [0xde, 0xad, 0xc0, 0xde];

/// Smallest marker stride
const FIRST_MARKER_POS: usize = 0x1000;

/// Where the markers written after `rootfs_end` stop
pub fn marker_end(rootfs_end: u64, erase_size: u64) -> u64 {
    align_up(rootfs_end, erase_size) + EOFS_MARKER.len() as u64
}

/// Write markers after `rootfs_end` into `image`, replacing anything already there, and return
/// the number of bytes added past `rootfs_end`.
pub fn pad_eofs(image: &mut Vec<u8>, rootfs_end: usize, erase_size: u64) -> u64 {
    let marker_start = align_down(rootfs_end as u64, erase_size) as usize;
    let marker_end = marker_end(rootfs_end as u64, erase_size) as usize;
    let marker_size = marker_end - rootfs_end;

    debug!("rootfs_end = 0x{rootfs_end:x}, marker_size = 0x{marker_size:x}");

    image.truncate(rootfs_end);
    image.resize(marker_end, 0xFF);

    if marker_size == EOFS_MARKER.len() {
        image[rootfs_end..].copy_from_slice(&EOFS_MARKER);
        return marker_size as u64;
    }

    let mut pos = FIRST_MARKER_POS;
    while marker_start + pos < marker_end {
        let at = marker_start + pos;
        if at >= rootfs_end {
            if let Some(slot) = image.get_mut(at..at + EOFS_MARKER.len()) {
                slot.copy_from_slice(&EOFS_MARKER);
                debug!("add marker at 0x{at:x}");
            }
        }
        pos *= 2;
    }

    // The marker opening the next block, which the strides above miss on blocks under 4 KiB
    image[marker_end - EOFS_MARKER.len()..].copy_from_slice(&EOFS_MARKER);

    marker_size as u64
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;

    const BLOCK: u64 = 0x4000;

    #[test]
    fn test_aligned_end() {
        let mut image = vec![0x11; 0x8000];
        assert_eq!(pad_eofs(&mut image, 0x4000, BLOCK), 4);
        assert_eq!(image.len(), 0x4004);
        assert_eq!(image[0x4000..], EOFS_MARKER);
        assert_eq!(image[0x3fff], 0x11);
    }

    #[test]
    fn test_doubling_stride() {
        let mut image = vec![0x11; 0x1100];
        let marker_size = pad_eofs(&mut image, 0x1100, BLOCK);
        assert_eq!(marker_size, 0x4004 - 0x1100);
        assert_eq!(image.len(), 0x4004);

        // 0x1000 lies inside the rootfs, so the first marker goes at 0x2000
        assert_eq!(image[0x2000..0x2004], EOFS_MARKER);
        assert_eq!(image[0x4000..0x4004], EOFS_MARKER);
        assert!(image[0x1100..0x2000].iter().all(|&b| b == 0xFF));
        assert!(image[0x2004..0x4000].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_small_blocks() {
        // Eraseblocks smaller than the first stride only get the marker opening the next block
        let mut image = vec![0x11; 0x300];
        assert_eq!(pad_eofs(&mut image, 0x300, 0x200), 0x104);
        assert_eq!(image[0x400..], EOFS_MARKER);
        assert!(image[0x300..0x400].iter().all(|&b| b == 0xFF));
    }

    proptest! {
        #[test]
        fn markers_cover_block_tail(
            rootfs_end in 1usize..0x40000,
            shift in 12u32..17,
        ) {
            let erase_size = 1u64 << shift;
            let mut image = vec![0x5A; rootfs_end];
            let marker_size = pad_eofs(&mut image, rootfs_end, erase_size);

            let aligned_end = align_up(rootfs_end as u64, erase_size) as usize;
            prop_assert_eq!(image.len(), aligned_end + 4);
            prop_assert_eq!(marker_size as usize, image.len() - rootfs_end);
            prop_assert!(image[..rootfs_end].iter().all(|&b| b == 0x5A));
            prop_assert_eq!(&image[aligned_end..], &EOFS_MARKER[..]);

            // Every marker sits at a power-of-two offset into the block
            let block_start = align_down(rootfs_end as u64, erase_size) as usize;
            for at in rootfs_end..aligned_end {
                if image[at..].starts_with(&EOFS_MARKER) {
                    let pos = at - block_start;
                    prop_assert!(pos >= FIRST_MARKER_POS && pos.is_power_of_two());
                }
            }
        }
    }
}
