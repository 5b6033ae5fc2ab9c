// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation table that pins process memory and resolves its physical
//! address through `/proc/self/pagemap`.

use crate::backend::m4u::M4uBufferConfig;
use crate::backend::m4u::TranslationTable;
use crate::entry::VirtAddr;
use crate::mapping::lock_range;
use crate::mapping::page_size;
use crate::mapping::unlock_range;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;

const PAGEMAP_PATH: &str = "/proc/self/pagemap";
const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = 0x3f_ffff_ffff_ffff;

/// Returns the page frame number in a pagemap entry, or `None` if the page is
/// not resident.
fn decode_pagemap_entry(entry: u64) -> Option<u64> {
    if entry & PAGEMAP_PRESENT == 0 {
        return None;
    }
    Some(entry & PAGEMAP_PFN_MASK)
}

/// Page pin counts.
///
/// `mlock` works on whole pages and does not nest, so a page shared by
/// several registered ranges is locked on its first pin and unlocked when
/// its last pin is released.
#[derive(Debug, Default)]
struct PagePins(Mutex<HashMap<usize, usize>>);

fn page_range(va: VirtAddr, len: usize) -> anyhow::Result<Range<usize>> {
    let page_size = page_size();
    let end = va
        .get()
        .checked_add(len.max(1))
        .with_context(|| format!("range at {va} overflows"))?;
    Ok(va.get() / page_size..(end - 1) / page_size + 1)
}

fn page_va(page: usize) -> anyhow::Result<VirtAddr> {
    VirtAddr::new(page * page_size()).context("cannot pin the null page")
}

impl PagePins {
    fn pin(&self, va: VirtAddr, len: usize) -> anyhow::Result<()> {
        let pages = page_range(va, len)?;
        let mut pins = self.0.lock();
        for page in pages.clone() {
            if !pins.contains_key(&page) {
                let locked = page_va(page)
                    .and_then(|page_va| Ok(lock_range(page_va, page_size())?));
                if let Err(err) = locked {
                    if let Err(unlock_err) = Self::release(&mut pins, pages.start..page) {
                        tracing::warn!(
                            error = unlock_err.as_ref() as &dyn std::error::Error,
                            %va,
                            "failed to unlock range"
                        );
                    }
                    return Err(err).with_context(|| format!("failed to lock range at {va}"));
                }
            }
            *pins.entry(page).or_insert(0) += 1;
        }
        Ok(())
    }

    fn unpin(&self, va: VirtAddr, len: usize) -> anyhow::Result<()> {
        let pages = page_range(va, len)?;
        Self::release(&mut self.0.lock(), pages)
    }

    /// Drops one pin on each page in `pages`. Every page is visited even if
    /// an earlier unlock fails.
    fn release(pins: &mut HashMap<usize, usize>, pages: Range<usize>) -> anyhow::Result<()> {
        let mut result = Ok(());
        for page in pages {
            let Some(count) = pins.get_mut(&page) else {
                if result.is_ok() {
                    result = Err(anyhow::anyhow!("page {page:#x} is not pinned"));
                }
                continue;
            };
            *count -= 1;
            if *count == 0 {
                pins.remove(&page);
                let unlocked = page_va(page)
                    .and_then(|page_va| Ok(unlock_range(page_va, page_size())?))
                    .with_context(|| format!("failed to unlock page {page:#x}"));
                if let Err(err) = unlocked {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    #[cfg(test)]
    fn count(&self, page: usize) -> usize {
        self.0.lock().get(&page).copied().unwrap_or(0)
    }
}

/// A [`TranslationTable`] for processes without a dedicated IOMMU driver.
///
/// Registered ranges are pinned with `mlock` so their frames stay put while
/// the codec holds the address. Reading frame numbers requires
/// `CAP_SYS_ADMIN`; without it the kernel reports zero and `map` fails.
#[derive(Debug)]
pub struct PagemapTable {
    pagemap: File,
    pins: PagePins,
}

impl PagemapTable {
    /// Opens the pagemap of the current process.
    pub fn open() -> anyhow::Result<Self> {
        let pagemap = File::open(PAGEMAP_PATH).context("failed to open pagemap")?;
        Ok(Self {
            pagemap,
            pins: PagePins::default(),
        })
    }

    fn physical_address(&self, va: VirtAddr) -> anyhow::Result<u64> {
        let page_size = page_size();
        let page = (va.get() / page_size) as u64;
        let mut entry = [0; 8];
        self.pagemap
            .read_exact_at(&mut entry, page * 8)
            .context("failed to read from pagemap")?;

        let pfn = decode_pagemap_entry(u64::from_ne_bytes(entry))
            .with_context(|| format!("page at {va} not present in RAM"))?;
        if pfn == 0 {
            anyhow::bail!("page frame numbers are hidden from this process");
        }
        Ok(pfn * page_size as u64 + (va.get() % page_size) as u64)
    }
}

impl TranslationTable for PagemapTable {
    fn map(&self, va: VirtAddr, len: usize, config: &M4uBufferConfig) -> anyhow::Result<u64> {
        self.pins.pin(va, len)?;
        match self.physical_address(va) {
            Ok(pa) => {
                tracing::trace!(%va, len, pa, ?config, "pinned range");
                Ok(pa)
            }
            Err(err) => {
                if let Err(unpin_err) = self.pins.unpin(va, len) {
                    tracing::warn!(
                        error = unpin_err.as_ref() as &dyn std::error::Error,
                        %va,
                        "failed to unlock range"
                    );
                }
                Err(err)
            }
        }
    }

    fn unmap(
        &self,
        va: VirtAddr,
        _pa: u64,
        len: usize,
        _config: &M4uBufferConfig,
    ) -> anyhow::Result<()> {
        self.pins.unpin(va, len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapping::AlignedBuffer;

    #[test]
    fn test_decode_entry() {
        assert_eq!(decode_pagemap_entry(0), None);
        assert_eq!(decode_pagemap_entry(0x1234), None);
        assert_eq!(decode_pagemap_entry(PAGEMAP_PRESENT | 0x1234), Some(0x1234));
        // Soft-dirty and exclusive bits are not part of the frame number.
        assert_eq!(
            decode_pagemap_entry(PAGEMAP_PRESENT | (1 << 55) | (1 << 56) | 0x42),
            Some(0x42)
        );
    }

    #[test]
    fn test_map_reports_or_unwinds() {
        let table = PagemapTable::open().unwrap();
        let buffer = AlignedBuffer::new(page_size(), page_size()).unwrap();
        let config = M4uBufferConfig::default();

        // Unprivileged processes see zero frame numbers and the lock may hit
        // RLIMIT_MEMLOCK, so only check consistency of whichever outcome.
        match table.map(buffer.va(), page_size(), &config) {
            Ok(pa) => {
                assert_eq!(pa % page_size() as u64, 0);
                table.unmap(buffer.va(), pa, page_size(), &config).unwrap();
            }
            Err(_) => {
                let page = buffer.va().get() / page_size();
                assert_eq!(table.pins.count(page), 0);
            }
        }
    }

    #[test]
    fn test_pins_shared_by_page() {
        let pins = PagePins::default();
        let buffer = AlignedBuffer::new(page_size(), page_size()).unwrap();
        let a = buffer.va();
        let b = VirtAddr::new(a.get() + page_size() / 2).unwrap();
        let page = a.get() / page_size();

        pins.pin(a, 0x100).unwrap();
        pins.pin(b, 0x100).unwrap();
        assert_eq!(pins.count(page), 2);

        // Releasing one range keeps the page locked for the other.
        pins.unpin(a, 0x100).unwrap();
        assert_eq!(pins.count(page), 1);

        pins.unpin(b, 0x100).unwrap();
        assert_eq!(pins.count(page), 0);
        assert!(pins.unpin(b, 0x100).is_err());
    }

    #[test]
    fn test_pins_span_pages() {
        let pins = PagePins::default();
        let buffer = AlignedBuffer::new(page_size(), page_size() * 2).unwrap();
        let first = buffer.va().get() / page_size();
        let tail = VirtAddr::new(buffer.va().get() + page_size() - 0x10).unwrap();

        pins.pin(buffer.va(), page_size()).unwrap();
        pins.pin(tail, 0x20).unwrap();
        assert_eq!(pins.count(first), 2);
        assert_eq!(pins.count(first + 1), 1);

        pins.unpin(buffer.va(), page_size()).unwrap();
        assert_eq!(pins.count(first), 1);
        assert_eq!(pins.count(first + 1), 1);
        pins.unpin(tail, 0x20).unwrap();
        assert_eq!(pins.count(first), 0);
        assert_eq!(pins.count(first + 1), 0);
    }
}
