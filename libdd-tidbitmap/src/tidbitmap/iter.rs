// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{PagetableEntry, TidBitmap, PAGES_PER_CHUNK, WORDS_PER_PAGE};
use crate::tid::{BlockNumber, OffsetNumber, BITS_PER_BITMAPWORD, MAX_HEAP_TUPLES_PER_PAGE};
use crate::TidBitmapError;

/// One page of a bitmap, in ascending block order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TbmIterateResult {
    pub blockno: BlockNumber,
    /// Number of offsets, or -1 when the whole page may match.
    pub ntuples: i32,
    /// Every tuple returned must be rechecked against the scan
    /// condition. Always set for lossy pages.
    pub recheck: bool,
    /// Matching offsets, ascending. Empty for lossy pages.
    pub offsets: Vec<OffsetNumber>,
}

impl TbmIterateResult {
    pub fn is_lossy(&self) -> bool {
        self.ntuples < 0
    }

    pub(crate) fn lossy(blockno: BlockNumber) -> Self {
        TbmIterateResult {
            blockno,
            ntuples: -1,
            recheck: true,
            offsets: Vec::new(),
        }
    }

    pub(crate) fn exact(page: &PagetableEntry) -> Result<Self, TidBitmapError> {
        let mut offsets = Vec::new();
        for (wordnum, &word) in page.words[..WORDS_PER_PAGE].iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let offset = wordnum * BITS_PER_BITMAPWORD + w.trailing_zeros() as usize + 1;
                if offset > MAX_HEAP_TUPLES_PER_PAGE {
                    return Err(TidBitmapError::Corrupted(format!(
                        "page {} has offset {offset} set",
                        page.blockno
                    )));
                }
                offsets.push(offset as OffsetNumber);
                w &= w - 1;
            }
        }
        let ntuples = i32::try_from(offsets.len()).map_err(|_| {
            TidBitmapError::Corrupted(format!("page {} has too many offsets", page.blockno))
        })?;
        Ok(TbmIterateResult {
            blockno: page.blockno,
            ntuples,
            recheck: page.recheck,
            offsets,
        })
    }
}

pub(crate) enum Step {
    Lossy(BlockNumber),
    Page(usize),
    Done,
}

/// Merge position over the sorted pages and chunks. Lives in shared memory
/// for shared iteration.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct Cursor {
    spageptr: usize,
    schunkptr: usize,
    schunkbit: usize,
}

impl Cursor {
    /// Picks the next block: the lowest of the next exact page and the next
    /// lossy page. A block is never both.
    pub(crate) fn advance<'e>(
        &mut self,
        npages: usize,
        nchunks: usize,
        page: impl Fn(usize) -> Option<&'e PagetableEntry>,
        chunk: impl Fn(usize) -> Option<&'e PagetableEntry>,
    ) -> Step {
        // Move to the next set bit of the current chunk, or to a later chunk.
        let mut lossy = None;
        while self.schunkptr < nchunks {
            let Some(entry) = chunk(self.schunkptr) else {
                break;
            };
            if let Some(bit) = (self.schunkbit..PAGES_PER_CHUNK).find(|&bit| entry.test_bit(bit)) {
                self.schunkbit = bit;
                lossy = Some(entry.blockno + bit as BlockNumber);
                break;
            }
            self.schunkptr += 1;
            self.schunkbit = 0;
        }

        let next_page = if self.spageptr < npages {
            page(self.spageptr)
        } else {
            None
        };
        match (lossy, next_page) {
            (Some(blockno), Some(entry)) if blockno < entry.blockno => {
                self.schunkbit += 1;
                Step::Lossy(blockno)
            }
            (Some(blockno), None) => {
                self.schunkbit += 1;
                Step::Lossy(blockno)
            }
            (_, Some(_)) => {
                self.spageptr += 1;
                Step::Page(self.spageptr - 1)
            }
            (None, None) => Step::Done,
        }
    }
}

/// Walks a bitmap in this process. Holds the bitmap read-only.
pub struct TbmIterator<'b> {
    tbm: &'b TidBitmap<'b>,
    cursor: Cursor,
}

impl<'b> TbmIterator<'b> {
    pub(crate) fn new(tbm: &'b TidBitmap<'b>) -> Self {
        TbmIterator {
            tbm,
            cursor: Cursor::default(),
        }
    }
}

impl Iterator for TbmIterator<'_> {
    type Item = Result<TbmIterateResult, TidBitmapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let tbm = self.tbm;
        let step = self.cursor.advance(
            tbm.npages,
            tbm.nchunks,
            |n| tbm.sorted_page(n),
            |n| tbm.sorted_chunk(n),
        );
        match step {
            Step::Lossy(blockno) => Some(Ok(TbmIterateResult::lossy(blockno))),
            Step::Page(n) => tbm.sorted_page(n).map(TbmIterateResult::exact),
            Step::Done => None,
        }
    }
}

impl core::iter::FusedIterator for TbmIterator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_offset(page: &mut PagetableEntry, offset: usize) {
        let bit = offset - 1;
        page.words[bit / BITS_PER_BITMAPWORD] |= 1 << (bit % BITS_PER_BITMAPWORD);
    }

    #[test]
    fn exact_lists_offsets_in_order() {
        let mut page = PagetableEntry::page(42);
        page.recheck = true;
        for offset in [MAX_HEAP_TUPLES_PER_PAGE, 1, 65, 64] {
            set_offset(&mut page, offset);
        }
        let result = TbmIterateResult::exact(&page).unwrap();
        assert_eq!(result.blockno, 42);
        assert_eq!(result.ntuples, 4);
        assert!(result.recheck);
        assert!(!result.is_lossy());
        assert_eq!(result.offsets, vec![1, 64, 65, MAX_HEAP_TUPLES_PER_PAGE as OffsetNumber]);
    }

    #[test]
    fn exact_rejects_offsets_past_the_page() {
        // The last word has room for bits no heap page can use.
        assert!(WORDS_PER_PAGE * BITS_PER_BITMAPWORD > MAX_HEAP_TUPLES_PER_PAGE);
        let mut page = PagetableEntry::page(7);
        set_offset(&mut page, 3);
        set_offset(&mut page, MAX_HEAP_TUPLES_PER_PAGE + 1);
        assert!(matches!(
            TbmIterateResult::exact(&page),
            Err(TidBitmapError::Corrupted(_))
        ));
    }
}
