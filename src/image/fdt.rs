//! A read-only flattened device tree parser.
//!
//! Every offset and length in the blob is checked against the blob before it is used, so a
//! corrupted or hostile tree produces an [FdtError] rather than a panic.

use bytes::Buf;

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_HEADER_SIZE: usize = 40;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Oldest layout we can read, and the newest we claim compatibility with
const FDT_FIRST_SUPPORTED_VERSION: u32 = 0x10;
const FDT_LAST_SUPPORTED_VERSION: u32 = 0x11;

/// Nesting limit; real FIT images are three or four levels deep
const MAX_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FdtError {
    #[error("device tree truncated")]
    Truncated,

    #[error("bad device tree magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported device tree version {version} (last compatible {last_comp_version})")]
    Version {
        version: u32,
        last_comp_version: u32,
    },

    #[error("device tree {0} block lies outside the blob")]
    BadLayout(&'static str),

    #[error("unexpected token 0x{token:x} at struct offset 0x{offset:x}")]
    BadToken { offset: usize, token: u32 },

    #[error("bad string reference at 0x{0:x}")]
    BadString(usize),

    #[error("device tree nested too deeply")]
    TooDeep,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FdtHeader {
    pub magic: u32,
    pub total_size: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl FdtHeader {
    /// Decode the header at the start of `buf`, checking only the magic
    pub fn parse(buf: &[u8]) -> Result<Self, FdtError> {
        let mut buf = buf.get(..FDT_HEADER_SIZE).ok_or(FdtError::Truncated)?;

        let header = Self {
            magic: buf.get_u32(),
            total_size: buf.get_u32(),
            off_dt_struct: buf.get_u32(),
            off_dt_strings: buf.get_u32(),
            off_mem_rsvmap: buf.get_u32(),
            version: buf.get_u32(),
            last_comp_version: buf.get_u32(),
            boot_cpuid_phys: buf.get_u32(),
            size_dt_strings: buf.get_u32(),
            size_dt_struct: buf.get_u32(),
        };

        if header.magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(header.magic));
        }

        Ok(header)
    }

    /// Size of the whole blob, in bytes
    pub fn total_size(&self) -> u64 {
        self.total_size.into()
    }

    /// Validate the version and block layout, returning the struct and strings block ranges
    fn blocks(&self) -> Result<(std::ops::Range<usize>, std::ops::Range<usize>), FdtError> {
        if self.version < FDT_FIRST_SUPPORTED_VERSION
            || self.last_comp_version > FDT_LAST_SUPPORTED_VERSION
        {
            return Err(FdtError::Version {
                version: self.version,
                last_comp_version: self.last_comp_version,
            });
        }

        let total = self.total_size as usize;
        if total < FDT_HEADER_SIZE {
            return Err(FdtError::BadLayout("header"));
        }

        // size_dt_struct only exists from version 17 on
        let struct_size = if self.version >= 17 {
            self.size_dt_struct
        } else {
            self.total_size.saturating_sub(self.off_dt_struct)
        };

        let block = |offset: u32, size: u32, what| {
            let start = offset as usize;
            match start.checked_add(size as usize) {
                Some(end) if start >= FDT_HEADER_SIZE && end <= total => Ok(start..end),
                _ => Err(FdtError::BadLayout(what)),
            }
        };

        Ok((
            block(self.off_dt_struct, struct_size, "struct")?,
            block(self.off_dt_strings, self.size_dt_strings, "strings")?,
        ))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FdtProperty {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FdtNode {
    pub name: String,
    pub properties: Vec<FdtProperty>,
    pub children: Vec<FdtNode>,
}

impl FdtNode {
    pub fn prop(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|prop| prop.name == name)
            .map(|prop| prop.value.as_slice())
    }

    /// A string property, up to its first NUL
    pub fn prop_str(&self, name: &str) -> Option<&str> {
        let value = self.prop(name)?;
        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        std::str::from_utf8(&value[..end]).ok()
    }

    /// A single-cell property; anything but exactly 4 bytes is `None`
    pub fn prop_u32(&self, name: &str) -> Option<u32> {
        let cell: [u8; 4] = self.prop(name)?.try_into().ok()?;
        Some(u32::from_be_bytes(cell))
    }

    pub fn child(&self, name: &str) -> Option<&FdtNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Look up a descendant by absolute-style path, e.g. `/images/kernel-1`
    pub fn path(&self, path: &str) -> Option<&FdtNode> {
        path.split('/')
            .filter(|component| !component.is_empty())
            .try_fold(self, |node, component| node.child(component))
    }
}

/// A parsed device tree
#[derive(Debug, Clone)]
pub struct Fdt {
    pub header: FdtHeader,
    pub root: FdtNode,
}

impl Fdt {
    /// Parse a whole blob; `buf` must hold at least `total_size` bytes
    pub fn parse(buf: &[u8]) -> Result<Self, FdtError> {
        let header = FdtHeader::parse(buf)?;
        let (struct_block, strings_block) = header.blocks()?;
        let blob = buf
            .get(..header.total_size as usize)
            .ok_or(FdtError::Truncated)?;

        let mut parser = Parser {
            data: &blob[struct_block.clone()],
            strings: &blob[strings_block],
            pos: 0,
        };

        let root = match parser.next_token()? {
            FDT_BEGIN_NODE => parser.parse_node(0)?,
            token => {
                return Err(FdtError::BadToken {
                    offset: 0,
                    token,
                })
            }
        };

        match parser.next_token()? {
            FDT_END => Ok(Self { header, root }),
            token => Err(FdtError::BadToken {
                offset: parser.pos - 4,
                token,
            }),
        }
    }

    pub fn path(&self, path: &str) -> Option<&FdtNode> {
        self.root.path(path)
    }
}

struct Parser<'a> {
    data: &'a [u8],
    strings: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn u32(&mut self) -> Result<u32, FdtError> {
        let mut cell = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(FdtError::Truncated)?;
        self.pos += 4;
        Ok(cell.get_u32())
    }

    /// The next token, skipping NOPs
    fn next_token(&mut self) -> Result<u32, FdtError> {
        loop {
            match self.u32()? {
                FDT_NOP => continue,
                token => return Ok(token),
            }
        }
    }

    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn node_name(&mut self) -> Result<String, FdtError> {
        let rest = self.data.get(self.pos..).ok_or(FdtError::Truncated)?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::Truncated)?;
        let name = String::from_utf8_lossy(&rest[..len]).into_owned();

        self.pos += len + 1;
        self.align();
        Ok(name)
    }

    fn string(&self, offset: usize) -> Result<String, FdtError> {
        let rest = self
            .strings
            .get(offset..)
            .ok_or(FdtError::BadString(offset))?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::BadString(offset))?;
        Ok(String::from_utf8_lossy(&rest[..len]).into_owned())
    }

    /// Parse a node whose FDT_BEGIN_NODE token was just consumed
    fn parse_node(&mut self, depth: usize) -> Result<FdtNode, FdtError> {
        if depth >= MAX_DEPTH {
            return Err(FdtError::TooDeep);
        }

        let mut node = FdtNode {
            name: self.node_name()?,
            ..Default::default()
        };

        loop {
            let offset = self.pos;
            match self.next_token()? {
                FDT_PROP => {
                    let len = self.u32()? as usize;
                    let nameoff = self.u32()? as usize;
                    let name = self.string(nameoff)?;
                    let value = self
                        .pos
                        .checked_add(len)
                        .and_then(|end| self.data.get(self.pos..end))
                        .ok_or(FdtError::Truncated)?
                        .to_vec();
                    self.pos += len;
                    self.align();

                    node.properties.push(FdtProperty { name, value });
                }
                FDT_BEGIN_NODE => node.children.push(self.parse_node(depth + 1)?),
                FDT_END_NODE => return Ok(node),
                token => return Err(FdtError::BadToken { offset, token }),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::FdtBuilder;

    fn sample() -> Vec<u8> {
        let mut fdt = FdtBuilder::new();
        fdt.begin_node("");
        fdt.prop_str("description", "test");
        fdt.begin_node("images");
        fdt.begin_node("kernel-1");
        fdt.prop("data", b"kernel!");
        fdt.prop_u32("load", 0x8000_1000);
        fdt.end_node();
        fdt.end_node();
        fdt.end_node();
        fdt.finish()
    }

    #[test]
    fn test_parse_tree() -> anyhow::Result<()> {
        let blob = sample();
        let fdt = Fdt::parse(&blob)?;

        assert_eq!(fdt.header.total_size(), blob.len() as u64);
        assert_eq!(fdt.root.prop_str("description"), Some("test"));

        let kernel = fdt.path("/images/kernel-1").unwrap();
        assert_eq!(kernel.prop("data"), Some(&b"kernel!"[..]));
        assert_eq!(kernel.prop_u32("load"), Some(0x8000_1000));
        assert_eq!(kernel.prop_u32("data"), None);
        assert!(fdt.path("/images/ramdisk-1").is_none());
        assert!(fdt.path("/").is_some());

        Ok(())
    }

    #[test]
    fn test_rejects_damage() {
        let blob = sample();

        assert!(matches!(
            Fdt::parse(&blob[..blob.len() - 1]),
            Err(FdtError::Truncated)
        ));

        let mut bad = blob.clone();
        bad[0] = 0;
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::BadMagic(_))));

        let mut bad = blob.clone();
        bad[20..24].copy_from_slice(&2u32.to_be_bytes());
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::Version { .. })));

        let mut bad = blob.clone();
        bad[12..16].copy_from_slice(&0xFFFF_0000u32.to_be_bytes());
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::BadLayout(_))));

        // Corrupt the root's BEGIN_NODE token
        let mut bad = blob;
        let off_struct = u32::from_be_bytes(bad[8..12].try_into().unwrap()) as usize;
        bad[off_struct + 3] = 0x7;
        assert!(matches!(Fdt::parse(&bad), Err(FdtError::BadToken { .. })));
    }

    #[test]
    fn test_depth_limit() {
        let mut fdt = FdtBuilder::new();
        for _ in 0..=MAX_DEPTH {
            fdt.begin_node("n");
        }
        for _ in 0..=MAX_DEPTH {
            fdt.end_node();
        }
        assert!(matches!(Fdt::parse(&fdt.finish()), Err(FdtError::TooDeep)));
    }
}
