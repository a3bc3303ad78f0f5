//! Firmware container formats understood by the verifier

pub mod fdt;
pub mod fit;
pub mod legacy;

/// A short content identity, comparable between two verified images
pub type Fingerprint = [u8; 4];

/// How many leading bytes of an image [ImageFormat::detect] and the header parsers need
pub const HEADER_PROBE_SIZE: usize = legacy::LEGACY_HEADER_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageFormat {
    /// uImage: a 64-byte header with CRC-32s over itself and the payload
    Legacy,

    /// Flattened image tree: an FDT describing and hashing its components
    Fit,
}

impl ImageFormat {
    /// Identify the format from the first bytes of an image
    pub fn detect(header: &[u8]) -> Option<Self> {
        let magic: [u8; 4] = header.get(..4)?.try_into().ok()?;
        match u32::from_be_bytes(magic) {
            legacy::LEGACY_MAGIC => Some(Self::Legacy),
            fdt::FDT_MAGIC => Some(Self::Fit),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Legacy => "legacy",
            Self::Fit => "FIT",
        })
    }
}

#[test]
fn test_detect() {
    assert_eq!(
        ImageFormat::detect(&[0x27, 0x05, 0x19, 0x56, 0, 0]),
        Some(ImageFormat::Legacy)
    );
    assert_eq!(
        ImageFormat::detect(&[0xd0, 0x0d, 0xfe, 0xed]),
        Some(ImageFormat::Fit)
    );
    assert_eq!(ImageFormat::detect(&[0xFF; 64]), None);
    assert_eq!(ImageFormat::detect(&[0x27, 0x05]), None);
}
