//! [FlashDevice] over raw NAND, skipping blocks marked bad

use super::{align_down, align_up, check_range, effective_limit, FlashDevice, FlashError, ReadStatus};
use crate::nand::{Ecc, Nand, NandBlock};

use tracing::{debug, warn};

/// A contiguous piece of an access that lands inside one good block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Span {
    block: u32,
    start: u64,
    len: u64,
}

/// Bad-block-aware flash access over any [Nand]
#[derive(Debug)]
pub struct SkipBadNand<N> {
    nand: N,
}

impl<N: Nand> SkipBadNand<N> {
    pub fn new(nand: N) -> Self {
        Self { nand }
    }

    /// Access the wrapped NAND directly
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn into_inner(self) -> N {
        self.nand
    }

    fn block_size(&self) -> u64 {
        self.nand.get_layout().block_size()
    }

    fn is_good(&mut self, block: u32) -> Result<bool, FlashError> {
        Ok(self.nand.block(block)?.is_some())
    }

    /// Map `len` bytes of data starting at physical `offset` onto good blocks.
    ///
    /// A bad block is passed over whole, keeping the offset within the block, which is how
    /// U-Boot's skip-bad helpers lay data down.
    fn spans(&mut self, offset: u64, len: u64, limit: u64) -> Result<Vec<Span>, FlashError> {
        check_range(offset, len, limit)?;

        let block_size = self.block_size();
        let mut spans = Vec::new();
        let mut position = offset;
        let mut remaining = len;

        while remaining > 0 {
            let block_base = align_down(position, block_size);
            if block_base >= limit {
                return Err(FlashError::OutOfGoodBlocks {
                    offset: position,
                    limit,
                });
            }

            let block = u32::try_from(block_base / block_size).map_err(|_| {
                FlashError::OutOfGoodBlocks {
                    offset: position,
                    limit,
                }
            })?;
            if !self.is_good(block)? {
                debug!("skipping bad block {block} at 0x{block_base:x}");
                position += block_size;
                continue;
            }

            let chunk = std::cmp::min(remaining, block_base + block_size - position);
            check_range(position, chunk, limit)?;

            spans.push(Span {
                block,
                start: position - block_base,
                len: chunk,
            });

            remaining -= chunk;
            position += chunk;
        }

        Ok(spans)
    }

    /// Read one span, widened to whole pages
    fn read_span(&mut self, span: Span, out: &mut [u8]) -> Result<Ecc, FlashError> {
        let Some(block) = self.nand.block(span.block)? else {
            return Err(anyhow::anyhow!("block {} went bad during read", span.block).into());
        };

        let page_size = block.page_size() as u64;
        let first_page = span.start / page_size;
        let end = align_up(span.start + span.len, page_size);
        let mut pages = vec![0u8; (end - first_page * page_size) as usize];

        let ecc = block.read(first_page as u32, &mut pages)?;
        let skip = (span.start - first_page * page_size) as usize;
        out.copy_from_slice(&pages[skip..skip + out.len()]);

        Ok(ecc)
    }
}

impl<N: Nand> FlashDevice for SkipBadNand<N> {
    fn size(&self) -> u64 {
        self.nand.get_layout().device_size()
    }

    fn erase_size(&self) -> u64 {
        self.block_size()
    }

    fn adjust_offset(&mut self, base: u64, offset: u64, limit: u64) -> Result<u64, FlashError> {
        let block_size = self.block_size();
        let limit = effective_limit(Some(limit), self.size());
        let mut physical = base;
        let mut consume = offset;

        loop {
            let block_base = align_down(physical, block_size);
            if physical >= limit {
                if consume == 0 && physical == limit {
                    return Ok(physical);
                }
                return Err(FlashError::OutOfGoodBlocks {
                    offset: physical,
                    limit,
                });
            }

            let block = u32::try_from(block_base / block_size).map_err(|_| {
                FlashError::OutOfGoodBlocks {
                    offset: physical,
                    limit,
                }
            })?;
            if !self.is_good(block)? {
                physical += block_size;
                continue;
            }

            let room = block_base + block_size - physical;
            if consume < room {
                return Ok(physical + consume);
            }

            consume -= room;
            physical += room;
        }
    }

    fn erase(&mut self, offset: u64, len: u64, limit: Option<u64>) -> Result<(), FlashError> {
        let block_size = self.block_size();
        let limit = effective_limit(limit, self.size());
        let start = align_down(offset, block_size);
        let end = align_up(offset.saturating_add(len), block_size);

        for span in self.spans(start, end - start, limit)? {
            let Some(mut block) = self.nand.block(span.block)? else {
                continue;
            };

            if let Err(e) = block.erase() {
                let first_bad = u64::from(span.block) * block_size;
                warn!("erase failed at 0x{first_bad:x}, marking block bad: {e:#}");

                // Error when trying to erase means the block is definitely bad
                block.mark_bad()?;
                return Err(FlashError::EraseIncomplete { first_bad });
            }
        }

        Ok(())
    }

    fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        limit: Option<u64>,
    ) -> Result<ReadStatus, FlashError> {
        let block_size = self.block_size();
        let limit = effective_limit(limit, self.size());
        let mut status = ReadStatus::Clean;
        let mut cursor = 0usize;

        for span in self.spans(offset, buf.len() as u64, limit)? {
            let out = &mut buf[cursor..cursor + span.len as usize];
            match self.read_span(span, out)? {
                Ecc::Clean => (),
                Ecc::Corrected => {
                    debug!("corrected bitflips in block {}", span.block);
                    status = status.worst(ReadStatus::Corrected);
                }
                Ecc::Uncorrectable => {
                    return Err(FlashError::Uncorrectable {
                        offset: u64::from(span.block) * block_size + span.start,
                    })
                }
            }
            cursor += span.len as usize;
        }

        Ok(status)
    }

    fn write(&mut self, offset: u64, data: &[u8], limit: Option<u64>) -> Result<(), FlashError> {
        let page_size = self.nand.get_layout().bytes_per_page as u64;
        if offset % page_size != 0 {
            return Err(FlashError::Misaligned {
                offset,
                align: page_size,
            });
        }

        let limit = effective_limit(limit, self.size());
        let mut cursor = 0usize;

        for span in self.spans(offset, data.len() as u64, limit)? {
            let chunk = &data[cursor..cursor + span.len as usize];
            cursor += chunk.len();

            let Some(mut block) = self.nand.block(span.block)? else {
                return Err(anyhow::anyhow!("block {} went bad during write", span.block).into());
            };

            // Only the final span can end mid-page; pad it out with erased bytes
            let padded_len = align_up(chunk.len() as u64, page_size) as usize;
            if padded_len == chunk.len() {
                block.program((span.start / page_size) as u32, chunk)?;
            } else {
                let mut padded = Vec::with_capacity(padded_len);
                padded.extend_from_slice(chunk);
                padded.resize(padded_len, 0xFF);
                block.program((span.start / page_size) as u32, &padded)?;
            }
        }

        Ok(())
    }
}
