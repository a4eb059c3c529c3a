// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A set of tuple identifiers that trades precision for memory.
//!
//! Every page with matches has an exact entry holding one bit per tuple
//! offset. When the bitmap grows past its budget, exact pages are folded
//! into lossy chunks: one entry per [`PAGES_PER_CHUNK`] consecutive pages
//! with one bit per page, meaning "some tuples on this page may match".
//! Callers recheck every tuple of a lossy page.
//!
//! Both kinds of entry share one table keyed by block number. A chunk is
//! keyed by its first page, so the first page of a chunk is never exact
//! and lossy at the same time: turning it lossy converts its entry in
//! place.
//!
//! The bitmap starts without a table and holds its first page inline; the
//! table is built when a second page shows up and is kept from then on.
//! Once iteration begins the bitmap is read-only.

mod iter;
mod shared;

pub use iter::{TbmIterateResult, TbmIterator};
pub use shared::{free_shared_area, TbmSharedIterator};

use crate::tid::{
    bitnum, wordnum, BlockNumber, Bitmapword, ItemPointer, BITS_PER_BITMAPWORD, BLCKSZ,
    MAX_HEAP_TUPLES_PER_PAGE,
};
use crate::TidBitmapError;
use core::mem::size_of;
use indexmap::map::Entry;
use indexmap::IndexMap;
use libdd_dsa::DsaArea;

/// Pages covered by one lossy chunk.
pub const PAGES_PER_CHUNK: usize = BLCKSZ / 32;

const WORDS_PER_PAGE: usize = (MAX_HEAP_TUPLES_PER_PAGE - 1) / BITS_PER_BITMAPWORD + 1;
const WORDS_PER_CHUNK: usize = (PAGES_PER_CHUNK - 1) / BITS_PER_BITMAPWORD + 1;
const ENTRY_WORDS: usize = if WORDS_PER_PAGE > WORDS_PER_CHUNK {
    WORDS_PER_PAGE
} else {
    WORDS_PER_CHUNK
};

/// Fewest entries a bitmap is allowed, whatever its budget.
const MIN_MAX_ENTRIES: usize = 16;
const MAX_MAX_ENTRIES: usize = i32::MAX as usize - 1;

/// An exact page or a lossy chunk header. Also the layout shared iteration
/// copies into the area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct PagetableEntry {
    pub(crate) blockno: BlockNumber,
    pub(crate) ischunk: bool,
    /// Tuples of an exact page must be rechecked.
    pub(crate) recheck: bool,
    /// Offset `o` of an exact page is bit `o - 1`; page `blockno + i` of a
    /// chunk is bit `i`.
    pub(crate) words: [Bitmapword; ENTRY_WORDS],
}

impl PagetableEntry {
    fn page(blockno: BlockNumber) -> Self {
        PagetableEntry {
            blockno,
            ..Default::default()
        }
    }

    fn chunk(blockno: BlockNumber) -> Self {
        PagetableEntry {
            blockno,
            ischunk: true,
            ..Default::default()
        }
    }

    fn test_bit(&self, bit: usize) -> bool {
        self.words[wordnum(bit)] & (1 << bitnum(bit)) != 0
    }

    fn set_bit(&mut self, bit: usize) {
        self.words[wordnum(bit)] |= 1 << bitnum(bit);
    }

    /// Blocks a chunk marks lossy.
    fn chunk_pages(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        (0..PAGES_PER_CHUNK)
            .filter(|&bit| self.test_bit(bit))
            .map(|bit| self.blockno + bit as BlockNumber)
    }
}

enum Status {
    Empty,
    OnePage(PagetableEntry),
    Hash(IndexMap<BlockNumber, PagetableEntry>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Iterating {
    No,
    Private,
    Shared,
}

pub struct TidBitmap<'a> {
    status: Status,
    nentries: usize,
    maxentries: usize,
    npages: usize,
    nchunks: usize,
    /// Table position the next lossify pass starts from.
    lossify_start: usize,
    iterating: Iterating,
    /// Table positions of exact pages and of chunks, sorted by block, built
    /// when iteration begins.
    spages: Vec<usize>,
    schunks: Vec<usize>,
    area: Option<&'a DsaArea>,
}

/// Number of entries a bitmap can hold in `max_bytes`.
pub fn calculate_entries(max_bytes: usize) -> usize {
    // Each entry also costs a hash slot and a pointer in the sorted arrays.
    let per_entry = size_of::<PagetableEntry>() + 2 * size_of::<usize>();
    (max_bytes / per_entry).clamp(MIN_MAX_ENTRIES, MAX_MAX_ENTRIES)
}

impl<'a> TidBitmap<'a> {
    /// An empty bitmap sized for `max_bytes`. Shared iteration needs an
    /// `area` to put its state in.
    pub fn new(max_bytes: usize, area: Option<&'a DsaArea>) -> Self {
        Self::with_max_entries(calculate_entries(max_bytes), area)
    }

    /// An empty bitmap that starts folding pages into chunks past
    /// `maxentries` entries.
    pub fn with_max_entries(maxentries: usize, area: Option<&'a DsaArea>) -> Self {
        TidBitmap {
            status: Status::Empty,
            nentries: 0,
            maxentries: maxentries.max(1),
            npages: 0,
            nchunks: 0,
            lossify_start: 0,
            iterating: Iterating::No,
            spages: Vec::new(),
            schunks: Vec::new(),
            area,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nentries == 0
    }

    pub fn nentries(&self) -> usize {
        self.nentries
    }

    pub fn maxentries(&self) -> usize {
        self.maxentries
    }

    /// Exact pages.
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Lossy chunks.
    pub fn nchunks(&self) -> usize {
        self.nchunks
    }

    pub fn area(&self) -> Option<&'a DsaArea> {
        self.area
    }

    fn check_not_iterating(&self) -> Result<(), TidBitmapError> {
        if self.iterating != Iterating::No {
            return Err(TidBitmapError::Misuse(
                "tid bitmap is read-only once iteration has begun".to_owned(),
            ));
        }
        Ok(())
    }

    fn one_page(&self) -> Option<&PagetableEntry> {
        match &self.status {
            Status::OnePage(entry) => Some(entry),
            _ => None,
        }
    }

    fn table(&self) -> Option<&IndexMap<BlockNumber, PagetableEntry>> {
        match &self.status {
            Status::Hash(table) => Some(table),
            _ => None,
        }
    }

    fn entries(&self) -> impl Iterator<Item = &PagetableEntry> {
        self.one_page()
            .into_iter()
            .chain(self.table().into_iter().flat_map(|table| table.values()))
    }

    /// Switches to the table representation, moving the inline page in.
    fn ensure_hash(&mut self) {
        if matches!(self.status, Status::Hash(_)) {
            return;
        }
        let mut table = IndexMap::new();
        if let Status::OnePage(entry) = self.status {
            table.insert(entry.blockno, entry);
        }
        self.status = Status::Hash(table);
    }

    // ---------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------

    /// The exact entry for `pageno`, if there is one.
    fn find_pageentry(&self, pageno: BlockNumber) -> Option<&PagetableEntry> {
        if self.nentries == 0 {
            return None;
        }
        match &self.status {
            Status::Empty => None,
            Status::OnePage(entry) => (entry.blockno == pageno).then_some(entry),
            Status::Hash(table) => table.get(&pageno).filter(|entry| !entry.ischunk),
        }
    }

    /// The entry for `pageno`, created exact if missing. May return the
    /// chunk header the page itself heads.
    fn get_pageentry(&mut self, pageno: BlockNumber) -> Result<&mut PagetableEntry, TidBitmapError> {
        match self.status {
            Status::Empty => {
                self.status = Status::OnePage(PagetableEntry::page(pageno));
                self.nentries += 1;
                self.npages += 1;
            }
            Status::OnePage(PagetableEntry { blockno, .. }) if blockno == pageno => {}
            _ => {
                self.ensure_hash();
                if let Status::Hash(table) = &mut self.status {
                    if let Entry::Vacant(vacant) = table.entry(pageno) {
                        vacant.insert(PagetableEntry::page(pageno));
                        self.nentries += 1;
                        self.npages += 1;
                    }
                }
            }
        }
        let entry = match &mut self.status {
            Status::OnePage(entry) => Some(entry),
            Status::Hash(table) => table.get_mut(&pageno),
            Status::Empty => None,
        };
        entry.ok_or_else(|| TidBitmapError::Corrupted(format!("page {pageno} vanished")))
    }

    /// Whether `pageno` is covered by a lossy chunk.
    fn page_is_lossy(&self, pageno: BlockNumber) -> bool {
        if self.nchunks == 0 {
            return false;
        }
        let bitno = pageno as usize % PAGES_PER_CHUNK;
        let chunk_pageno = pageno - bitno as BlockNumber;
        self.table()
            .and_then(|table| table.get(&chunk_pageno))
            .is_some_and(|entry| entry.ischunk && entry.test_bit(bitno))
    }

    // ---------------------------------------------------------------------
    // Lossy pages
    // ---------------------------------------------------------------------

    /// Replaces any exact entry for `pageno` with a bit in its chunk.
    fn mark_page_lossy(&mut self, pageno: BlockNumber) {
        self.ensure_hash();
        let Status::Hash(table) = &mut self.status else {
            return;
        };
        let bitno = pageno as usize % PAGES_PER_CHUNK;
        let chunk_pageno = pageno - bitno as BlockNumber;

        // The chunk's own first page is converted below instead.
        if bitno != 0 && table.swap_remove(&pageno).is_some() {
            self.nentries -= 1;
            self.npages -= 1;
        }

        let chunk = match table.entry(chunk_pageno) {
            Entry::Vacant(vacant) => {
                self.nentries += 1;
                self.nchunks += 1;
                vacant.insert(PagetableEntry::chunk(chunk_pageno))
            }
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if !entry.ischunk {
                    // The first page had matches, so it stays marked.
                    *entry = PagetableEntry::chunk(chunk_pageno);
                    entry.set_bit(0);
                    self.nchunks += 1;
                    self.npages -= 1;
                }
                entry
            }
        };
        chunk.set_bit(bitno);
    }

    /// Folds exact pages into chunks until the bitmap is at half its
    /// budget. Passes resume where the previous one stopped, so pages are
    /// lossified round-robin. When a full pass cannot get there, the budget
    /// is raised instead of lossifying again on every insertion.
    fn lossify(&mut self) {
        tracing::debug!(
            nentries = self.nentries,
            maxentries = self.maxentries,
            "lossifying tid bitmap"
        );
        // Folding a page moves other entries around the table, so the pass
        // order is taken up front: every entry present now, from the resume
        // point around to just before it.
        let order: Vec<BlockNumber> = match self.table() {
            Some(table) if !table.is_empty() => {
                let start = self.lossify_start % table.len();
                table
                    .keys()
                    .skip(start)
                    .chain(table.keys().take(start))
                    .copied()
                    .collect()
            }
            _ => Vec::new(),
        };
        for (visited, &blockno) in order.iter().enumerate() {
            // Chunks are already lossy, and a chunk's first page would only
            // turn into its own header.
            let foldable = blockno as usize % PAGES_PER_CHUNK != 0
                && self
                    .table()
                    .and_then(|table| table.get(&blockno))
                    .is_some_and(|entry| !entry.ischunk);
            if !foldable {
                continue;
            }
            self.mark_page_lossy(blockno);
            if self.nentries <= self.maxentries / 2 {
                let resume = order[visited + 1..]
                    .iter()
                    .find_map(|next| self.table()?.get_index_of(next))
                    .unwrap_or(0);
                self.lossify_start = resume;
                return;
            }
        }

        if self.nentries > self.maxentries / 2 {
            self.maxentries = self.nentries.min((MAX_MAX_ENTRIES - 1) / 2) * 2;
            tracing::debug!(
                maxentries = self.maxentries,
                "could not lossify tid bitmap below half its budget, raised the budget"
            );
        }
    }

    fn lossify_if_full(&mut self) {
        if self.nentries > self.maxentries {
            self.lossify();
        }
    }

    // ---------------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------------

    /// Adds tuples. `recheck` marks that their pages must be rechecked.
    pub fn add_tuples(&mut self, tids: &[ItemPointer], recheck: bool) -> Result<(), TidBitmapError> {
        self.check_not_iterating()?;
        let mut currblk = None;
        let mut lossy = false;
        for tid in tids {
            let off = tid.offset as usize;
            if off < 1 || off > MAX_HEAP_TUPLES_PER_PAGE {
                return Err(TidBitmapError::OffsetOutOfRange(tid.offset));
            }
            if currblk != Some(tid.block) {
                lossy = self.page_is_lossy(tid.block);
                currblk = Some(tid.block);
            }
            if lossy {
                continue;
            }
            let page = self.get_pageentry(tid.block)?;
            if page.ischunk {
                // The page heads a lossy chunk; its own bit says it all.
                page.set_bit(0);
            } else {
                page.set_bit(off - 1);
            }
            page.recheck |= recheck;
            if self.nentries > self.maxentries {
                self.lossify();
                // The page may have been folded into a chunk.
                currblk = None;
            }
        }
        Ok(())
    }

    /// Marks a whole page as possibly matching.
    pub fn add_page(&mut self, pageno: BlockNumber) -> Result<(), TidBitmapError> {
        self.check_not_iterating()?;
        self.mark_page_lossy(pageno);
        self.lossify_if_full();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Set operations
    // ---------------------------------------------------------------------

    /// Adds every tuple and lossy page of `other`.
    pub fn union(&mut self, other: &TidBitmap<'_>) -> Result<(), TidBitmapError> {
        self.check_not_iterating()?;
        for bpage in other.entries() {
            self.union_page(bpage)?;
        }
        Ok(())
    }

    fn union_page(&mut self, bpage: &PagetableEntry) -> Result<(), TidBitmapError> {
        if bpage.ischunk {
            for pageno in bpage.chunk_pages() {
                self.mark_page_lossy(pageno);
            }
        } else if self.page_is_lossy(bpage.blockno) {
            return Ok(());
        } else {
            let apage = self.get_pageentry(bpage.blockno)?;
            if apage.ischunk {
                apage.set_bit(0);
            } else {
                for (aword, bword) in apage.words[..WORDS_PER_PAGE]
                    .iter_mut()
                    .zip(&bpage.words[..WORDS_PER_PAGE])
                {
                    *aword |= *bword;
                }
                apage.recheck |= bpage.recheck;
            }
        }
        self.lossify_if_full();
        Ok(())
    }

    /// Keeps only the tuples also in `other`. Tuples of pages `other` holds
    /// lossy are kept but flagged for recheck.
    pub fn intersect(&mut self, other: &TidBitmap<'_>) -> Result<(), TidBitmapError> {
        self.check_not_iterating()?;
        if self.nentries == 0 {
            return Ok(());
        }
        match &mut self.status {
            Status::Empty => {}
            Status::OnePage(entry) => {
                if Self::intersect_page(entry, other) {
                    self.status = Status::Empty;
                    self.nentries = 0;
                    self.npages = 0;
                }
            }
            Status::Hash(table) => {
                let (mut pages, mut chunks) = (0, 0);
                table.retain(|_, apage| {
                    let emptied = Self::intersect_page(apage, other);
                    if emptied {
                        if apage.ischunk {
                            chunks += 1;
                        } else {
                            pages += 1;
                        }
                    }
                    !emptied
                });
                self.npages -= pages;
                self.nchunks -= chunks;
                self.nentries -= pages + chunks;
            }
        }
        Ok(())
    }

    /// Intersects one entry with `b`. Returns whether it ended up empty.
    fn intersect_page(apage: &mut PagetableEntry, b: &TidBitmap<'_>) -> bool {
        if apage.ischunk {
            let mut candelete = true;
            for bit in 0..PAGES_PER_CHUNK {
                if !apage.test_bit(bit) {
                    continue;
                }
                let pageno = apage.blockno + bit as BlockNumber;
                if !b.page_is_lossy(pageno) && b.find_pageentry(pageno).is_none() {
                    apage.words[wordnum(bit)] &= !(1 << bitnum(bit));
                } else {
                    candelete = false;
                }
            }
            candelete
        } else if b.page_is_lossy(apage.blockno) {
            // We cannot tell which of our tuples match, so all of them
            // might.
            apage.recheck = true;
            false
        } else {
            let mut candelete = true;
            if let Some(bpage) = b.find_pageentry(apage.blockno) {
                for (aword, bword) in apage.words[..WORDS_PER_PAGE]
                    .iter_mut()
                    .zip(&bpage.words[..WORDS_PER_PAGE])
                {
                    *aword &= *bword;
                    if *aword != 0 {
                        candelete = false;
                    }
                }
                apage.recheck |= bpage.recheck;
            }
            candelete
        }
    }

    // ---------------------------------------------------------------------
    // Iteration setup
    // ---------------------------------------------------------------------

    /// Sorts the table positions of pages and chunks by block, once.
    fn prepare_sorted(&mut self) {
        if self.iterating != Iterating::No {
            return;
        }
        let Some(table) = self.table() else {
            return;
        };
        let mut spages = Vec::with_capacity(self.npages);
        let mut schunks = Vec::with_capacity(self.nchunks);
        for (index, entry) in table.values().enumerate() {
            if entry.ischunk {
                schunks.push(index);
            } else {
                spages.push(index);
            }
        }
        let block_of = |index: &usize| table.get_index(*index).map(|(&block, _)| block);
        spages.sort_unstable_by_key(block_of);
        schunks.sort_unstable_by_key(block_of);
        self.spages = spages;
        self.schunks = schunks;
    }

    /// The `n`th exact page in block order.
    pub(crate) fn sorted_page(&self, n: usize) -> Option<&PagetableEntry> {
        match &self.status {
            Status::Empty => None,
            Status::OnePage(entry) => (n == 0).then_some(entry),
            Status::Hash(table) => {
                let index = *self.spages.get(n)?;
                table.get_index(index).map(|(_, entry)| entry)
            }
        }
    }

    /// The `n`th chunk in block order.
    pub(crate) fn sorted_chunk(&self, n: usize) -> Option<&PagetableEntry> {
        let index = *self.schunks.get(n)?;
        self.table()?.get_index(index).map(|(_, entry)| entry)
    }

    /// Starts iterating in this process. The bitmap stays read-only from
    /// now on.
    pub fn begin_iterate(&mut self) -> Result<TbmIterator<'_>, TidBitmapError> {
        if self.iterating == Iterating::Shared {
            return Err(TidBitmapError::Misuse(
                "tid bitmap is already prepared for shared iteration".to_owned(),
            ));
        }
        self.prepare_sorted();
        self.iterating = Iterating::Private;
        Ok(TbmIterator::new(self))
    }
}

impl core::fmt::Debug for TidBitmap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TidBitmap")
            .field("nentries", &self.nentries)
            .field("maxentries", &self.maxentries)
            .field("npages", &self.npages)
            .field("nchunks", &self.nchunks)
            .field("iterating", &self.iterating)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use std::collections::{BTreeMap, BTreeSet};

    fn tid(block: BlockNumber, offset: u16) -> ItemPointer {
        ItemPointer::new(block, offset)
    }

    /// What iteration reports: exact offsets per page, and lossy pages.
    #[derive(Debug, Default, PartialEq, Eq)]
    struct Reported {
        exact: BTreeMap<BlockNumber, (BTreeSet<u16>, bool)>,
        lossy: BTreeSet<BlockNumber>,
    }

    fn report(tbm: &mut TidBitmap<'_>) -> Reported {
        let mut reported = Reported::default();
        let mut last = None;
        for result in tbm.begin_iterate().unwrap() {
            let result = result.unwrap();
            assert!(last < Some(result.blockno), "blocks out of order");
            last = Some(result.blockno);
            if result.is_lossy() {
                assert!(result.recheck);
                assert!(result.offsets.is_empty());
                reported.lossy.insert(result.blockno);
            } else {
                assert_eq!(result.ntuples as usize, result.offsets.len());
                let offsets = result.offsets.iter().copied().collect();
                reported.exact.insert(result.blockno, (offsets, result.recheck));
            }
        }
        reported
    }

    #[test]
    fn states() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        assert!(tbm.is_empty());
        assert!(matches!(tbm.status, Status::Empty));
        tbm.add_tuples(&[tid(5, 1), tid(5, 7)], false).unwrap();
        assert!(matches!(tbm.status, Status::OnePage(_)));
        tbm.add_tuples(&[tid(9, 2)], true).unwrap();
        assert!(matches!(tbm.status, Status::Hash(_)));
        assert_eq!((tbm.nentries(), tbm.npages(), tbm.nchunks()), (2, 2, 0));

        let reported = report(&mut tbm);
        assert_eq!(reported.exact[&5], (BTreeSet::from([1, 7]), false));
        assert_eq!(reported.exact[&9], (BTreeSet::from([2]), true));
        assert!(reported.lossy.is_empty());
    }

    #[test]
    fn one_page_iteration() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        tbm.add_tuples(&[tid(3, 291), tid(3, 1)], false).unwrap();
        let results: Vec<TbmIterateResult> =
            tbm.begin_iterate().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].blockno, 3);
        assert_eq!(results[0].ntuples, 2);
        assert_eq!(results[0].offsets, vec![1, 291]);
    }

    #[test]
    fn offsets_are_checked() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        assert!(matches!(
            tbm.add_tuples(&[tid(1, 0)], false),
            Err(TidBitmapError::OffsetOutOfRange(0))
        ));
        assert!(matches!(
            tbm.add_tuples(&[tid(1, 292)], false),
            Err(TidBitmapError::OffsetOutOfRange(292))
        ));
    }

    #[test]
    fn read_only_once_iterating() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        tbm.add_tuples(&[tid(1, 1)], false).unwrap();
        drop(tbm.begin_iterate().unwrap());
        assert!(matches!(
            tbm.add_tuples(&[tid(2, 1)], false),
            Err(TidBitmapError::Misuse(_))
        ));
        assert!(tbm.add_page(3).is_err());
        let other = TidBitmap::new(1 << 20, None);
        assert!(tbm.union(&other).is_err());
        assert!(tbm.intersect(&other).is_err());
        // Iterating again is fine.
        assert_eq!(tbm.begin_iterate().unwrap().count(), 1);
    }

    #[test]
    fn lossify_keeps_every_block() {
        let mut tbm = TidBitmap::with_max_entries(10, None);
        for block in 0..16 {
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        assert!(tbm.nchunks() > 0);
        assert!(tbm.nentries() <= tbm.maxentries());
        let reported = report(&mut tbm);
        assert!(!reported.lossy.is_empty());
        assert!(!reported.exact.is_empty());
        let all: BTreeSet<BlockNumber> = reported
            .exact
            .keys()
            .chain(reported.lossy.iter())
            .copied()
            .collect();
        assert_eq!(all, (0..16).collect());
        for (offsets, recheck) in reported.exact.values() {
            assert_eq!(offsets, &BTreeSet::from([1]));
            assert!(!recheck);
        }
    }

    #[test]
    fn lossify_raises_an_unreachable_budget() {
        // Chunk heads cannot be lossified, so one page per chunk is stuck.
        let mut tbm = TidBitmap::with_max_entries(4, None);
        for chunk in 0..8 {
            let block = (chunk * PAGES_PER_CHUNK) as BlockNumber;
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        assert_eq!(tbm.nchunks(), 0);
        assert_eq!(tbm.nentries(), 8);
        assert!(tbm.maxentries() >= 8);
    }

    fn exact_pages(tbm: &TidBitmap<'_>) -> BTreeSet<BlockNumber> {
        tbm.entries()
            .filter(|entry| !entry.ischunk)
            .map(|entry| entry.blockno)
            .collect()
    }

    fn lossy_pages(tbm: &TidBitmap<'_>) -> BTreeSet<BlockNumber> {
        tbm.entries()
            .filter(|entry| entry.ischunk)
            .flat_map(PagetableEntry::chunk_pages)
            .collect()
    }

    #[test]
    fn lossify_visits_every_entry_before_raising_the_budget() {
        let mut tbm = TidBitmap::with_max_entries(11, None);
        for chunk in 0..4 {
            let block = (chunk * PAGES_PER_CHUNK) as BlockNumber;
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        let base = (100 * PAGES_PER_CHUNK) as BlockNumber;
        for block in base + 1..=base + 8 {
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        // The chunk heads come first and cannot be folded; the pages after
        // them all fit in one chunk.
        assert_eq!(tbm.maxentries(), 11);
        assert_eq!((tbm.nentries(), tbm.npages(), tbm.nchunks()), (5, 4, 1));
        assert_eq!(lossy_pages(&tbm), (base + 1..=base + 8).collect());
    }

    #[test]
    fn lossify_resumes_where_it_stopped() {
        let mut tbm = TidBitmap::with_max_entries(8, None);
        for block in 1..=9 {
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        assert_eq!(lossy_pages(&tbm), (1..=6).collect());
        assert_eq!(exact_pages(&tbm), BTreeSet::from([7, 8, 9]));

        let next = PAGES_PER_CHUNK as BlockNumber;
        for block in next + 1..=next + 5 {
            tbm.add_tuples(&[tid(block, 1)], false).unwrap();
        }
        // 8 and 9 sit before the resume point and are left for a later pass.
        let mut lossy: BTreeSet<BlockNumber> = (1..=7).collect();
        lossy.extend(next + 1..=next + 5);
        assert_eq!(lossy_pages(&tbm), lossy);
        assert_eq!(exact_pages(&tbm), BTreeSet::from([8, 9]));
        assert_eq!((tbm.nentries(), tbm.npages(), tbm.nchunks()), (4, 2, 2));
        assert_eq!(tbm.maxentries(), 8);
    }

    #[test]
    fn lossy_pages_absorb_tuples() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        tbm.add_page(300).unwrap();
        tbm.add_tuples(&[tid(300, 5), tid(301, 5)], false).unwrap();
        let reported = report(&mut tbm);
        assert_eq!(reported.lossy, BTreeSet::from([300]));
        assert_eq!(reported.exact.keys().copied().collect::<Vec<_>>(), vec![301]);
    }

    #[test]
    fn chunk_head_becomes_lossy_in_place() {
        let mut tbm = TidBitmap::new(1 << 20, None);
        tbm.add_tuples(&[tid(256, 3)], false).unwrap();
        tbm.add_page(260).unwrap();
        // 256 held tuples, so its bit stays set in the chunk it now heads.
        assert_eq!((tbm.npages(), tbm.nchunks(), tbm.nentries()), (0, 1, 1));
        tbm.add_tuples(&[tid(256, 4)], false).unwrap();
        let reported = report(&mut tbm);
        assert_eq!(reported.lossy, BTreeSet::from([256, 260]));
        assert!(reported.exact.is_empty());
    }

    #[test]
    fn union_merges_pages_and_chunks() {
        let mut a = TidBitmap::new(1 << 20, None);
        a.add_tuples(&[tid(1, 1), tid(2, 2)], false).unwrap();
        let mut b = TidBitmap::new(1 << 20, None);
        b.add_tuples(&[tid(1, 3)], true).unwrap();
        b.add_tuples(&[tid(700, 9)], false).unwrap();
        b.add_page(2).unwrap();

        a.union(&b).unwrap();
        let reported = report(&mut a);
        assert_eq!(reported.exact[&1], (BTreeSet::from([1, 3]), true));
        assert_eq!(reported.exact[&700], (BTreeSet::from([9]), false));
        assert_eq!(reported.lossy, BTreeSet::from([2]));
    }

    #[test]
    fn intersect_keeps_common_tuples() {
        let mut a = TidBitmap::new(1 << 20, None);
        a.add_tuples(&[tid(1, 1), tid(1, 2), tid(2, 1), tid(3, 1)], false)
            .unwrap();
        a.add_page(600).unwrap();
        a.add_page(601).unwrap();
        let mut b = TidBitmap::new(1 << 20, None);
        b.add_tuples(&[tid(1, 2), tid(601, 4)], false).unwrap();
        b.add_page(3).unwrap();

        a.intersect(&b).unwrap();
        let reported = report(&mut a);
        assert_eq!(reported.exact[&1], (BTreeSet::from([2]), false));
        // Lossy in b: kept, but must be rechecked.
        assert_eq!(reported.exact[&3], (BTreeSet::from([1]), true));
        assert!(!reported.exact.contains_key(&2));
        assert_eq!(reported.lossy, BTreeSet::from([601]));
    }

    #[test]
    fn intersect_can_empty_a_one_page_bitmap() {
        let mut a = TidBitmap::new(1 << 20, None);
        a.add_tuples(&[tid(1, 1)], false).unwrap();
        let mut b = TidBitmap::new(1 << 20, None);
        b.add_tuples(&[tid(1, 2)], false).unwrap();
        a.intersect(&b).unwrap();
        assert!(a.is_empty());
        assert!(matches!(a.status, Status::Empty));
    }

    #[test]
    fn hash_state_survives_draining() {
        let mut a = TidBitmap::new(1 << 20, None);
        a.add_tuples(&[tid(1, 1), tid(2, 1)], false).unwrap();
        let b = TidBitmap::new(1 << 20, None);
        a.intersect(&b).unwrap();
        assert!(a.is_empty());
        assert!(matches!(a.status, Status::Hash(_)));
        a.add_tuples(&[tid(4, 4)], false).unwrap();
        assert_eq!(report(&mut a).exact.len(), 1);
    }

    #[test]
    fn budget_from_bytes() {
        assert_eq!(calculate_entries(0), MIN_MAX_ENTRIES);
        let per_entry = size_of::<PagetableEntry>() + 2 * size_of::<usize>();
        assert_eq!(calculate_entries(per_entry * 1000), 1000);
    }

    /// Every tuple added is reported, exactly or through its lossy page.
    #[test]
    #[cfg_attr(miri, ignore)]
    fn never_loses_tuples() {
        check!()
            .with_type::<(u8, Vec<(u16, u16, bool)>)>()
            .for_each(|(maxentries, adds)| {
                let mut tbm = TidBitmap::with_max_entries(*maxentries as usize + 1, None);
                let mut model: BTreeMap<BlockNumber, BTreeSet<u16>> = BTreeMap::new();
                let mut whole_pages = BTreeSet::new();
                for &(block, offset, page) in adds {
                    let block = BlockNumber::from(block % 2048);
                    if page {
                        tbm.add_page(block).unwrap();
                        whole_pages.insert(block);
                    } else {
                        let offset = offset % MAX_HEAP_TUPLES_PER_PAGE as u16 + 1;
                        tbm.add_tuples(&[tid(block, offset)], false).unwrap();
                        model.entry(block).or_default().insert(offset);
                    }
                }
                let reported = report(&mut tbm);
                for block in &whole_pages {
                    assert!(reported.lossy.contains(block));
                }
                for (block, offsets) in &model {
                    if reported.lossy.contains(block) {
                        continue;
                    }
                    let (exact, recheck) = &reported.exact[block];
                    assert_eq!(exact, offsets);
                    assert!(!recheck);
                }
                for block in reported.exact.keys().chain(&reported.lossy) {
                    assert!(model.contains_key(block) || whole_pages.contains(block));
                }
            });
    }
}
