//! Flattened Image Tree verification.
//!
//! A FIT image is an FDT whose `/images` node holds each component's `data` alongside
//! `hash*` subnodes naming an algorithm and the expected digest. Firmware images for this board
//! may also carry a `/rootfs` node describing the squashfs appended after the tree.

use super::fdt::{Fdt, FdtError, FdtNode};
use super::legacy::LEGACY_CRC;
use super::Fingerprint;

use sha2::{Digest, Sha256};
use tracing::debug;

use std::str::FromStr;

/// Subnodes whose names start with this carry a hash
pub const FIT_HASH_NODENAME: &str = "hash";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HashAlgo {
    Crc32,
    Md5,
    Sha1,
    Sha256,
}

impl FromStr for HashAlgo {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, HashError> {
        match s {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            other => Err(HashError::UnsupportedAlgo(other.to_string())),
        }
    }
}

impl HashAlgo {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc32 => LEGACY_CRC.checksum(data).to_be_bytes().to_vec(),
            Self::Md5 => md5::compute(data).0.to_vec(),
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("hash node has no 'algo' property")]
    MissingAlgo,

    #[error("unsupported hash algorithm '{0}'")]
    UnsupportedAlgo(String),

    #[error("hash node has no 'value' property")]
    MissingValue,

    #[error("bad {algo} hash value length {actual}, expected {expected}")]
    BadLength {
        algo: String,
        expected: usize,
        actual: usize,
    },

    #[error("bad {algo} hash value")]
    Mismatch { algo: String },
}

/// One `hash*` subnode
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HashSpec {
    pub name: String,
    pub algo: Option<String>,
    pub value: Option<Vec<u8>>,
}

impl HashSpec {
    fn from_node(node: &FdtNode) -> Self {
        Self {
            name: node.name.clone(),
            algo: node.prop_str("algo").map(str::to_string),
            value: node.prop("value").map(<[u8]>::to_vec),
        }
    }

    /// All hash subnodes of `node`, in tree order
    fn all_of(node: &FdtNode) -> Vec<Self> {
        node.children
            .iter()
            .filter(|child| child.name.starts_with(FIT_HASH_NODENAME))
            .map(Self::from_node)
            .collect()
    }

    pub fn verify(&self, data: &[u8]) -> Result<(), HashError> {
        let algo = self.algo.as_deref().ok_or(HashError::MissingAlgo)?;
        let expected = self.value.as_deref().ok_or(HashError::MissingValue)?;
        let actual = algo.parse::<HashAlgo>()?.digest(data);

        if actual.len() != expected.len() {
            return Err(HashError::BadLength {
                algo: algo.to_string(),
                expected: actual.len(),
                actual: expected.len(),
            });
        }
        if actual != expected {
            return Err(HashError::Mismatch {
                algo: algo.to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("bad FIT structure: {0}")]
    Fdt(#[from] FdtError),

    #[error("FIT has no /images node")]
    NoImages,

    #[error("FIT image '{image}' has no embedded data")]
    MissingData { image: String },

    #[error("FIT image '{image}' {hash}: {source}")]
    Hash {
        image: String,
        hash: String,
        source: HashError,
    },
}

/// A structurally valid FIT image
#[derive(Debug, Clone)]
pub struct FitImage {
    fdt: Fdt,
}

impl FitImage {
    /// Parse and format-check the FIT image at the start of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, FitError> {
        let fdt = Fdt::parse(buf)?;
        if fdt.path("/images").is_none() {
            return Err(FitError::NoImages);
        }
        Ok(Self { fdt })
    }

    pub fn total_size(&self) -> u64 {
        self.fdt.header.total_size()
    }

    /// Verify every hash of every component image.
    ///
    /// Returns the leading bytes of the first hash value found, which identifies this build.
    pub fn verify_all_images(&self) -> Result<Option<Fingerprint>, FitError> {
        let images = self.fdt.path("/images").ok_or(FitError::NoImages)?;
        let mut fingerprint = None;

        for image in &images.children {
            let data = image.prop("data").ok_or_else(|| FitError::MissingData {
                image: image.name.clone(),
            })?;

            for hash in HashSpec::all_of(image) {
                hash.verify(data).map_err(|source| FitError::Hash {
                    image: image.name.clone(),
                    hash: hash.name.clone(),
                    source,
                })?;
                debug!("FIT image '{}' {} OK", image.name, hash.name);

                if fingerprint.is_none() {
                    fingerprint = hash
                        .value
                        .as_deref()
                        .and_then(|value| value.get(..4))
                        .and_then(|value| value.try_into().ok());
                }
            }
        }

        Ok(fingerprint)
    }

    /// The `/rootfs` description, if the image has one
    pub fn rootfs_meta(&self) -> Option<RootfsMeta> {
        let node = self.fdt.path("/rootfs")?;
        Some(RootfsMeta {
            declared_size: node.prop_u32("size"),
            hashes: HashSpec::all_of(node),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RootfsMetaError {
    #[error("rootfs size missing from FIT")]
    MissingSize,

    #[error("invalid rootfs size in FIT")]
    ZeroSize,

    #[error("rootfs size mismatch: FIT declares 0x{declared:x}, found 0x{located:x}")]
    SizeMismatch { declared: u64, located: u64 },

    #[error("no rootfs hash node verified")]
    NoHashPassed,
}

/// What the `/rootfs` node says about the appended root filesystem
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RootfsMeta {
    /// The `size` property, if present and exactly one cell
    pub declared_size: Option<u32>,
    pub hashes: Vec<HashSpec>,
}

impl RootfsMeta {
    /// Check the declared size against the size found on flash
    pub fn check_size(&self, located: u64) -> Result<(), RootfsMetaError> {
        let declared = u64::from(self.declared_size.ok_or(RootfsMetaError::MissingSize)?);
        if declared == 0 {
            return Err(RootfsMetaError::ZeroSize);
        }
        if declared != located {
            return Err(RootfsMetaError::SizeMismatch { declared, located });
        }
        Ok(())
    }

    /// Verify the rootfs contents; any single hash passing is enough
    pub fn verify(&self, rootfs: &[u8]) -> Result<(), RootfsMetaError> {
        let mut passed = false;

        for hash in &self.hashes {
            match hash.verify(rootfs) {
                Ok(()) => {
                    debug!("rootfs {} OK", hash.name);
                    passed = true;
                }
                Err(e) => debug!("rootfs {}: {e}", hash.name),
            }
        }

        match passed {
            true => Ok(()),
            false => Err(RootfsMetaError::NoHashPassed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{squashfs, FdtBuilder, FitBuilder};

    #[test]
    fn test_digests() {
        assert_eq!(
            HashAlgo::Crc32.digest(b"123456789"),
            0xcbf4_3926u32.to_be_bytes()
        );
        assert_eq!(
            HashAlgo::Md5.digest(b""),
            [
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec,
                0xf8, 0x42, 0x7e
            ]
        );
        assert_eq!(HashAlgo::Sha1.digest(b"abc")[..4], [0xa9, 0x99, 0x3e, 0x36]);
        assert_eq!(HashAlgo::Sha256.digest(b"abc")[..4], [0xba, 0x78, 0x16, 0xbf]);
        assert!("sha512".parse::<HashAlgo>().is_err());
    }

    #[test]
    fn test_verify_all_images() -> anyhow::Result<()> {
        let blob = FitBuilder::new(b"kernel payload".to_vec())
            .kernel_hash("sha1")
            .kernel_hash("crc32")
            .build_tree();
        let fit = FitImage::parse(&blob)?;

        let fingerprint = fit.verify_all_images()?.unwrap();
        assert_eq!(fingerprint[..], HashAlgo::Sha1.digest(b"kernel payload")[..4]);
        assert!(fit.rootfs_meta().is_none());

        Ok(())
    }

    #[test]
    fn test_verify_all_images_failures() -> anyhow::Result<()> {
        let blob = FitBuilder::new(b"kernel payload".to_vec())
            .kernel_hash("sha256")
            .corrupt_kernel_hash()
            .build_tree();
        assert!(matches!(
            FitImage::parse(&blob)?.verify_all_images(),
            Err(FitError::Hash {
                source: HashError::Mismatch { .. },
                ..
            })
        ));

        let blob = FitBuilder::new(b"kernel payload".to_vec())
            .kernel_hash("sha384")
            .build_tree();
        assert!(matches!(
            FitImage::parse(&blob)?.verify_all_images(),
            Err(FitError::Hash {
                source: HashError::UnsupportedAlgo(_),
                ..
            })
        ));

        // No hashes at all: nothing to fail, nothing to identify the build by
        let blob = FitBuilder::new(b"kernel payload".to_vec()).build_tree();
        assert_eq!(FitImage::parse(&blob)?.verify_all_images()?, None);

        let mut fdt = FdtBuilder::new();
        fdt.begin_node("");
        fdt.begin_node("images");
        fdt.begin_node("kernel-1");
        fdt.prop_u32("data-size", 4);
        fdt.end_node();
        fdt.end_node();
        fdt.end_node();
        assert!(matches!(
            FitImage::parse(&fdt.finish())?.verify_all_images(),
            Err(FitError::MissingData { .. })
        ));

        let mut fdt = FdtBuilder::new();
        fdt.begin_node("");
        fdt.end_node();
        assert!(matches!(
            FitImage::parse(&fdt.finish()),
            Err(FitError::NoImages)
        ));

        Ok(())
    }

    #[test]
    fn test_rootfs_meta() -> anyhow::Result<()> {
        let rootfs = squashfs(1000);
        let blob = FitBuilder::new(b"kernel".to_vec())
            .rootfs(1000)
            .rootfs_hashes(&["md5", "sha384"])
            .build_tree();
        let meta = FitImage::parse(&blob)?.rootfs_meta().unwrap();

        assert_eq!(meta.declared_size, Some(1000));
        meta.check_size(1000)?;
        assert!(matches!(
            meta.check_size(1004),
            Err(RootfsMetaError::SizeMismatch { .. })
        ));

        // md5 passes even though sha384 is not understood
        meta.verify(&rootfs)?;
        assert!(matches!(
            meta.verify(&rootfs[1..]),
            Err(RootfsMetaError::NoHashPassed)
        ));

        let missing = RootfsMeta {
            declared_size: None,
            hashes: vec![],
        };
        assert!(matches!(
            missing.check_size(1000),
            Err(RootfsMetaError::MissingSize)
        ));
        assert!(matches!(
            missing.verify(&rootfs),
            Err(RootfsMetaError::NoHashPassed)
        ));
        let zero = RootfsMeta {
            declared_size: Some(0),
            hashes: vec![],
        };
        assert!(matches!(zero.check_size(0), Err(RootfsMetaError::ZeroSize)));

        Ok(())
    }
}
