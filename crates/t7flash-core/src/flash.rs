//! External flash operations
//!
//! The device exposes its external flash through two pointer/window
//! register pairs: writing a byte address to a pointer register positions
//! a cursor, and subsequent transfers through the matching window register
//! move 32-bit words at the cursor while the device auto-advances it.
//! Erasing goes through a separate key/erase register pair, one page at a
//! time.
//!
//! All transfers are chunked: the hardware accepts at most
//! [`MAX_CHUNK_WORDS`] words per mixed transaction. Chunks execute
//! strictly sequentially. The cursor is shared device state, so a chunk
//! may only start once the previous chunk has been acknowledged.

use crate::error::{Error, Result};
use crate::link::{DeviceLink, Frame};
use crate::t7::{self, regs, FlashRegion};

/// Hardware cap on words moved by a single mixed transaction.
pub const MAX_CHUNK_WORDS: usize = 8;

fn check_transfer_params(start: u32, chunk_words: usize) -> Result<()> {
    if chunk_words == 0 || chunk_words > MAX_CHUNK_WORDS {
        return Err(Error::InvalidChunkSize {
            words: chunk_words,
            max: MAX_CHUNK_WORDS,
        });
    }
    if start % 4 != 0 {
        return Err(Error::UnalignedAddress { address: start });
    }
    Ok(())
}

/// Read `len_words` 32-bit words starting at flash byte address `start`.
///
/// Each chunk is one mixed transaction: a write positioning the read
/// pointer, then a read of up to `chunk_words` words from the read window.
/// The result is the flat word sequence in flash address order.
pub fn read_flash<L: DeviceLink + ?Sized>(
    link: &mut L,
    start: u32,
    len_words: usize,
    chunk_words: usize,
) -> Result<Vec<u32>> {
    check_transfer_params(start, chunk_words)?;

    let mut out = Vec::with_capacity(len_words);
    let mut done = 0usize;
    while done < len_words {
        let count = chunk_words.min(len_words - done);
        let cursor = start + (done as u32) * 4;
        let words = link.rw_many(&[
            Frame::Write {
                reg: regs::EXF_P_READ,
                values: &[cursor],
            },
            Frame::Read {
                reg: regs::EXF_READ,
                count,
            },
        ])?;
        if words.len() != count {
            return Err(Error::ShortResponse {
                expected: count,
                actual: words.len(),
            });
        }
        out.extend_from_slice(&words);
        done += count;
    }
    log::debug!("read {len_words} words from flash {start:#010x}");
    Ok(out)
}

/// Write `data` starting at flash byte address `start`, unlocking each
/// chunk with `key`.
///
/// Each chunk is one mixed transaction with three write frames: the region
/// key, the write pointer, then up to `chunk_words` words through the
/// write window. A chunk failure aborts immediately and leaves the flash
/// partially programmed; callers treat that as fatal for the region.
pub fn write_flash<L: DeviceLink + ?Sized>(
    link: &mut L,
    key: u32,
    start: u32,
    data: &[u32],
    chunk_words: usize,
) -> Result<()> {
    check_transfer_params(start, chunk_words)?;

    let mut done = 0usize;
    while done < data.len() {
        let count = chunk_words.min(data.len() - done);
        let cursor = start + (done as u32) * 4;
        link.rw_many(&[
            Frame::Write {
                reg: regs::EXF_KEY,
                values: &[key],
            },
            Frame::Write {
                reg: regs::EXF_P_WRITE,
                values: &[cursor],
            },
            Frame::Write {
                reg: regs::EXF_WRITE,
                values: &data[done..done + count],
            },
        ])?;
        done += count;
    }
    log::debug!("wrote {} words to flash {start:#010x}", data.len());
    Ok(())
}

/// Erase `pages` flash pages beginning at `base`.
///
/// Each page is one paired write of the region key and the page address;
/// pages are erased in ascending address order. A freshly erased word
/// reads as [`crate::t7::ERASED_WORD`].
pub fn erase_pages<L: DeviceLink + ?Sized>(
    link: &mut L,
    key: u32,
    base: u32,
    pages: u32,
) -> Result<()> {
    for page in 0..pages {
        let address = base + page * t7::FLASH_PAGE_SIZE;
        link.write_many(&[regs::EXF_KEY, regs::EXF_ERASE], &[key, address])?;
    }
    Ok(())
}

/// Erase an entire flash region.
pub fn erase_region<L: DeviceLink + ?Sized>(link: &mut L, region: &FlashRegion) -> Result<()> {
    log::info!(
        "erasing {} region: {} pages at {:#010x}",
        region.name,
        region.pages,
        region.base
    );
    erase_pages(link, region.key, region.base, region.pages).map_err(|e| Error::EraseFailed {
        region: region.name,
        source: Box::new(e),
    })
}

/// Read a region back and verify every word is erased.
///
/// Anything other than all-ones means the erase did not take, which is
/// fatal: programming over un-erased flash produces silent corruption.
pub fn check_erased<L: DeviceLink + ?Sized>(link: &mut L, region: &FlashRegion) -> Result<()> {
    let words = read_flash(link, region.base, region.size_words(), region.block_words)?;
    for (i, &word) in words.iter().enumerate() {
        if word != t7::ERASED_WORD {
            return Err(Error::EraseVerify {
                address: region.base + (i as u32) * 4,
                word,
            });
        }
    }
    log::debug!("{} region verified erased", region.name);
    Ok(())
}
