// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tuple identifiers stored per block in a radix tree.
//!
//! Each block maps to a [`BlocktableEntry`]. A block with at most
//! [`NUM_FULL_OFFSETS`] offsets keeps them in the entry header, which is
//! small enough to live inside the tree's child slot. Other blocks get a
//! bitmap of offsets trailing the header, sized by their highest offset.
//!
//! A store is local or lives in a DSA area. Shared stores are locked per
//! call, or explicitly for a batch with [`TidStore::lock_exclusive`] and
//! [`TidStore::lock_share`].

use crate::tid::{
    bitnum, wordnum, BlockNumber, Bitmapword, ItemPointer, OffsetNumber, BITS_PER_BITMAPWORD,
    INVALID_OFFSET_NUMBER, MAX_OFFSET_NUMBER,
};
use crate::TidBitmapError;
use core::mem::size_of;
use libdd_dsa::{minimum_size, DsaArea, DsaConfig, DEFAULT_INIT_SEGMENT_SIZE, DSA_MAX_SEGMENT_SIZE};
use libdd_radixtree::{
    Iter, LocalMemory, LockedIter, RadixTree, RadixTreeHandle, SharedMemory, SharedRadixTree,
    TreeReadGuard, TreeValue, TreeWriteGuard,
};

/// Offsets kept in the header of an entry before switching to a bitmap.
pub const NUM_FULL_OFFSETS: usize =
    (size_of::<Bitmapword>() - size_of::<u8>() - size_of::<i8>()) / size_of::<OffsetNumber>();

/// Words needed for a bitmap reaching [`MAX_OFFSET_NUMBER`].
const MAX_BITMAP_WORDS: usize = wordnum(MAX_OFFSET_NUMBER as usize) + 1;
const _: () = assert!(MAX_BITMAP_WORDS <= i8::MAX as usize);

/// Smallest segment a shared store's area grows by.
const MIN_SEGMENT_SIZE: usize = 256 * 1024;

pub type TidStoreHandle = RadixTreeHandle;

// The tree tags values kept in its slots with the lowest bit of the slot
// word. `flags` holds that bit, so it has to sit at the low end of the word.
#[cfg(target_endian = "little")]
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct EntryHeader {
    flags: u8,
    nwords: i8,
    full_offsets: [OffsetNumber; NUM_FULL_OFFSETS],
}

#[cfg(target_endian = "big")]
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct EntryHeader {
    full_offsets: [OffsetNumber; NUM_FULL_OFFSETS],
    nwords: i8,
    flags: u8,
}

const _: () = assert!(size_of::<EntryHeader>() == size_of::<Bitmapword>());

/// Offsets of one block, as stored in the tree. `nwords` bitmap words
/// follow the header in memory.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct BlocktableEntry {
    header: EntryHeader,
}

// SAFETY: the header is followed by `nwords` words wherever an entry is
// stored or built, `value_size` only reads `nwords`, and `flags` is never
// used by the store.
unsafe impl TreeValue for BlocktableEntry {
    const VARIABLE_LENGTH: bool = true;

    fn value_size(&self) -> usize {
        size_of::<Self>() + self.nwords() * size_of::<Bitmapword>()
    }
}

impl BlocktableEntry {
    fn nwords(&self) -> usize {
        self.header.nwords.max(0) as usize
    }

    /// The bitmap trailing the header.
    fn words(&self) -> &[Bitmapword] {
        let nwords = self.nwords();
        if nwords == 0 {
            return &[];
        }
        // SAFETY: entries with a bitmap are only reachable from the tree's
        // leaves or from an `EntryBuf`, both 8-byte aligned and holding
        // `nwords` words after the header.
        unsafe {
            core::slice::from_raw_parts((self as *const Self).add(1).cast::<Bitmapword>(), nwords)
        }
    }

    pub fn is_member(&self, offset: OffsetNumber) -> bool {
        if offset == INVALID_OFFSET_NUMBER {
            return false;
        }
        if self.nwords() == 0 {
            return self.header.full_offsets.contains(&offset);
        }
        let words = self.words();
        let wordnum = wordnum(offset as usize);
        wordnum < words.len() && words[wordnum] & (1 << bitnum(offset as usize)) != 0
    }

    fn to_offsets(&self) -> BlockOffsets {
        BlockOffsets {
            full_offsets: self.header.full_offsets,
            words: self.words().to_vec(),
        }
    }
}

/// Builds entries for insertion. Word 0 holds the header.
#[derive(Default)]
struct EntryBuf {
    words: Vec<Bitmapword>,
}

impl EntryBuf {
    fn build(&mut self, offsets: &[OffsetNumber]) -> Result<&BlocktableEntry, TidBitmapError> {
        let mut previous = INVALID_OFFSET_NUMBER;
        for &offset in offsets {
            if offset == INVALID_OFFSET_NUMBER || offset > MAX_OFFSET_NUMBER {
                return Err(TidBitmapError::OffsetOutOfRange(offset));
            }
            if offset <= previous {
                return Err(TidBitmapError::Misuse(format!(
                    "block offsets must be strictly ascending, got {offset} after {previous}"
                )));
            }
            previous = offset;
        }

        let mut header = EntryHeader {
            flags: 0,
            nwords: 0,
            full_offsets: [INVALID_OFFSET_NUMBER; NUM_FULL_OFFSETS],
        };
        self.words.clear();
        self.words.push(0);
        if offsets.len() <= NUM_FULL_OFFSETS {
            header.full_offsets[..offsets.len()].copy_from_slice(offsets);
        } else {
            let nwords = wordnum(previous as usize) + 1;
            self.words.resize(1 + nwords, 0);
            for &offset in offsets {
                self.words[1 + wordnum(offset as usize)] |= 1 << bitnum(offset as usize);
            }
            header.nwords = nwords as i8;
        }
        // SAFETY: word 0 is as large as the header and at least as aligned.
        unsafe {
            self.words.as_mut_ptr().cast::<EntryHeader>().write(header);
            Ok(&*self.words.as_ptr().cast::<BlocktableEntry>())
        }
    }
}

// ---------------------------------------------------------------------------
// Iteration results
// ---------------------------------------------------------------------------

/// Copy of a block's offsets, independent of the store's lock.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockOffsets {
    full_offsets: [OffsetNumber; NUM_FULL_OFFSETS],
    words: Vec<Bitmapword>,
}

/// One block yielded by [`TidStoreIter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TidStoreIterResult {
    pub block: BlockNumber,
    offsets: BlockOffsets,
}

impl TidStoreIterResult {
    /// The block's offsets in ascending order.
    pub fn offsets(&self) -> impl Iterator<Item = OffsetNumber> + '_ {
        let inline = self
            .offsets
            .full_offsets
            .iter()
            .copied()
            .filter(|&offset| offset != INVALID_OFFSET_NUMBER);
        let bitmap = self
            .offsets
            .words
            .iter()
            .enumerate()
            .flat_map(|(wordnum, &word)| {
                (0..BITS_PER_BITMAPWORD)
                    .filter(move |&bit| word & (1 << bit) != 0)
                    .map(move |bit| (wordnum * BITS_PER_BITMAPWORD + bit) as OffsetNumber)
            });
        inline.chain(bitmap)
    }

    /// Copies up to `out.len()` offsets into `out` and returns how many the
    /// block has, which may be more than were copied.
    pub fn get_block_offsets(&self, out: &mut [OffsetNumber]) -> usize {
        let mut count = 0;
        for offset in self.offsets() {
            if let Some(slot) = out.get_mut(count) {
                *slot = offset;
            }
            count += 1;
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

enum Tree<'a> {
    Local(RadixTree<BlocktableEntry>),
    Shared(SharedRadixTree<'a, BlocktableEntry>),
}

pub struct TidStore<'a> {
    tree: Tree<'a>,
    max_bytes: usize,
    buf: EntryBuf,
}

impl TidStore<'static> {
    /// A store in process memory. `max_bytes` is the budget the caller
    /// checks [`TidStore::memory_usage`] against. An insert-only store never
    /// overwrites a block and frees its memory only when dropped.
    pub fn create_local(max_bytes: usize, insert_only: bool) -> Result<Self, TidBitmapError> {
        let tree = if insert_only {
            RadixTree::new_insert_only()?
        } else {
            RadixTree::new()?
        };
        Ok(TidStore {
            tree: Tree::Local(tree),
            max_bytes,
            buf: EntryBuf::default(),
        })
    }
}

impl<'a> TidStore<'a> {
    /// Area settings suited to a shared store of `max_bytes`: segments stay
    /// small enough that the area does not overshoot the budget by much.
    pub fn shared_area_config(max_bytes: usize, tranche_id: u32) -> DsaConfig {
        let mut max_segment_size = DSA_MAX_SEGMENT_SIZE;
        while max_segment_size > 0 && 16 * max_segment_size > max_bytes {
            max_segment_size >>= 1;
        }
        let max_segment_size = max_segment_size.max(MIN_SEGMENT_SIZE).max(minimum_size());
        DsaConfig {
            tranche_id,
            init_segment_size: DEFAULT_INIT_SEGMENT_SIZE.min(max_segment_size),
            max_segment_size,
            ..DsaConfig::default()
        }
    }

    /// A store in `area`, reachable from other processes through
    /// [`TidStore::handle`].
    pub fn create_shared(
        area: &'a DsaArea,
        max_bytes: usize,
        tranche_id: u32,
    ) -> Result<Self, TidBitmapError> {
        let tree = SharedRadixTree::create(area, tranche_id)?;
        tracing::debug!(handle = %tree.handle(), max_bytes, "created shared tid store");
        Ok(TidStore {
            tree: Tree::Shared(tree),
            max_bytes,
            buf: EntryBuf::default(),
        })
    }

    /// Attaches to a shared store. The budget is not shared; the attached
    /// store reports zero.
    pub fn attach(area: &'a DsaArea, handle: TidStoreHandle) -> Result<Self, TidBitmapError> {
        Ok(TidStore {
            tree: Tree::Shared(SharedRadixTree::attach(area, handle)?),
            max_bytes: 0,
            buf: EntryBuf::default(),
        })
    }

    /// Frees the store. For a shared store no other process may use it
    /// afterwards; detaching is just dropping it.
    pub fn destroy(self) -> Result<(), TidBitmapError> {
        match self.tree {
            Tree::Local(tree) => drop(tree),
            Tree::Shared(tree) => {
                let handle = tree.handle();
                tree.free()?;
                tracing::debug!(%handle, "destroyed shared tid store");
            }
        }
        Ok(())
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn memory_usage(&self) -> usize {
        match &self.tree {
            Tree::Local(tree) => tree.memory_usage(),
            Tree::Shared(tree) => tree.memory_usage(),
        }
    }

    pub fn area(&self) -> Option<&'a DsaArea> {
        match &self.tree {
            Tree::Local(_) => None,
            Tree::Shared(tree) => Some(tree.area()),
        }
    }

    pub fn handle(&self) -> Option<TidStoreHandle> {
        match &self.tree {
            Tree::Local(_) => None,
            Tree::Shared(tree) => Some(tree.handle()),
        }
    }

    pub fn lock_exclusive(&mut self) -> TidStoreWriter<'_> {
        let tree = match &mut self.tree {
            Tree::Local(tree) => WriteTree::Local(tree),
            Tree::Shared(tree) => WriteTree::Shared(tree.lock_exclusive()),
        };
        TidStoreWriter {
            tree,
            buf: &mut self.buf,
        }
    }

    pub fn lock_share(&self) -> TidStoreReader<'_> {
        let tree = match &self.tree {
            Tree::Local(tree) => ReadTree::Local(tree),
            Tree::Shared(tree) => ReadTree::Shared(tree.lock_share()),
        };
        TidStoreReader { tree }
    }

    /// Replaces the offsets stored for `block`. `offsets` must be strictly
    /// ascending.
    pub fn set_block_offsets(
        &mut self,
        block: BlockNumber,
        offsets: &[OffsetNumber],
    ) -> Result<(), TidBitmapError> {
        self.lock_exclusive().set_block_offsets(block, offsets)
    }

    pub fn is_member(&self, tid: ItemPointer) -> Result<bool, TidBitmapError> {
        self.lock_share().is_member(tid)
    }

    /// Blocks in ascending order. A shared store stays share-locked until
    /// the iterator is dropped.
    pub fn iter(&self) -> TidStoreIter<'_> {
        match &self.tree {
            Tree::Local(tree) => TidStoreIter::Local(tree.iter()),
            Tree::Shared(tree) => TidStoreIter::Shared(tree.lock_share().into_locked_iter()),
        }
    }
}

fn member(entry: Option<&BlocktableEntry>, offset: OffsetNumber) -> bool {
    entry.is_some_and(|entry| entry.is_member(offset))
}

enum ReadTree<'s> {
    Local(&'s RadixTree<BlocktableEntry>),
    Shared(TreeReadGuard<'s, BlocktableEntry, SharedMemory<'s>>),
}

/// Shared access to a store.
pub struct TidStoreReader<'s> {
    tree: ReadTree<'s>,
}

impl TidStoreReader<'_> {
    pub fn is_member(&self, tid: ItemPointer) -> Result<bool, TidBitmapError> {
        let entry = match &self.tree {
            ReadTree::Local(tree) => tree.find(u64::from(tid.block))?,
            ReadTree::Shared(guard) => guard.find(u64::from(tid.block))?,
        };
        Ok(member(entry, tid.offset))
    }

    pub fn num_blocks(&self) -> u64 {
        match &self.tree {
            ReadTree::Local(tree) => tree.num_keys(),
            ReadTree::Shared(guard) => guard.num_keys(),
        }
    }
}

enum WriteTree<'s> {
    Local(&'s mut RadixTree<BlocktableEntry, LocalMemory>),
    Shared(TreeWriteGuard<'s, BlocktableEntry, SharedMemory<'s>>),
}

/// Exclusive access to a store.
pub struct TidStoreWriter<'s> {
    tree: WriteTree<'s>,
    buf: &'s mut EntryBuf,
}

impl TidStoreWriter<'_> {
    /// Replaces the offsets stored for `block`. `offsets` must be strictly
    /// ascending.
    pub fn set_block_offsets(
        &mut self,
        block: BlockNumber,
        offsets: &[OffsetNumber],
    ) -> Result<(), TidBitmapError> {
        let entry = self.buf.build(offsets)?;
        match &mut self.tree {
            WriteTree::Local(tree) => tree.set(u64::from(block), entry)?,
            WriteTree::Shared(guard) => guard.set(u64::from(block), entry)?,
        };
        Ok(())
    }

    pub fn is_member(&self, tid: ItemPointer) -> Result<bool, TidBitmapError> {
        let entry = match &self.tree {
            WriteTree::Local(tree) => tree.find(u64::from(tid.block))?,
            WriteTree::Shared(guard) => guard.find(u64::from(tid.block))?,
        };
        Ok(member(entry, tid.offset))
    }
}

/// Blocks of a store in ascending order.
pub enum TidStoreIter<'s> {
    #[doc(hidden)]
    Local(Iter<'s, BlocktableEntry, LocalMemory>),
    #[doc(hidden)]
    Shared(LockedIter<'s, BlocktableEntry, SharedMemory<'s>>),
}

impl Iterator for TidStoreIter<'_> {
    type Item = Result<TidStoreIterResult, TidBitmapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self {
            TidStoreIter::Local(iter) => iter.next(),
            TidStoreIter::Shared(iter) => iter.next_entry(),
        }?;
        Some(
            entry
                .map(|(key, entry)| TidStoreIterResult {
                    block: key as BlockNumber,
                    offsets: entry.to_offsets(),
                })
                .map_err(TidBitmapError::from),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use std::collections::{BTreeMap, BTreeSet};

    fn offsets_of(result: &TidStoreIterResult) -> Vec<OffsetNumber> {
        result.offsets().collect()
    }

    #[test]
    fn inline_and_bitmap_entries() {
        let mut store = TidStore::create_local(1 << 20, false).unwrap();
        store.set_block_offsets(17, &[3, 7, 9]).unwrap();
        let odd: Vec<OffsetNumber> = (1..100).step_by(2).collect();
        store.set_block_offsets(18, &odd).unwrap();

        assert!(store.is_member(ItemPointer::new(17, 7)).unwrap());
        assert!(!store.is_member(ItemPointer::new(17, 8)).unwrap());
        assert!(store.is_member(ItemPointer::new(18, 51)).unwrap());
        assert!(!store.is_member(ItemPointer::new(18, 52)).unwrap());
        assert!(!store.is_member(ItemPointer::new(19, 1)).unwrap());
        assert!(!store.is_member(ItemPointer::new(17, 0)).unwrap());
        assert!(!store.is_member(ItemPointer::new(18, 2000)).unwrap());

        let results: Vec<TidStoreIterResult> = store.iter().map(Result::unwrap).collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].block, 17);
        assert!(results[0].offsets.words.is_empty());
        assert_eq!(offsets_of(&results[0]), vec![3, 7, 9]);
        assert_eq!(results[1].block, 18);
        assert_eq!(results[1].offsets.words.len(), 2);
        assert_eq!(offsets_of(&results[1]), odd);
    }

    #[test]
    fn inline_entries_need_no_leaf() {
        let mut store = TidStore::create_local(1 << 20, false).unwrap();
        let before = store.memory_usage();
        store.set_block_offsets(5, &[1, 2, 3]).unwrap();
        assert_eq!(store.memory_usage(), before);
        store.set_block_offsets(6, &[1, 2, 3, 4]).unwrap();
        assert!(store.memory_usage() > before);
    }

    #[test]
    fn replacing_a_block() {
        let mut store = TidStore::create_local(1 << 20, false).unwrap();
        store.set_block_offsets(1, &[1, 2, 3, 4, 5, 300]).unwrap();
        store.set_block_offsets(1, &[9]).unwrap();
        assert!(!store.is_member(ItemPointer::new(1, 300)).unwrap());
        assert!(store.is_member(ItemPointer::new(1, 9)).unwrap());
        assert_eq!(store.lock_share().num_blocks(), 1);
    }

    #[test]
    fn rejects_bad_offsets() {
        let mut store = TidStore::create_local(1 << 20, true).unwrap();
        assert!(matches!(
            store.set_block_offsets(1, &[0, 1]),
            Err(TidBitmapError::OffsetOutOfRange(0))
        ));
        assert!(matches!(
            store.set_block_offsets(1, &[1, MAX_OFFSET_NUMBER + 1]),
            Err(TidBitmapError::OffsetOutOfRange(_))
        ));
        assert!(matches!(
            store.set_block_offsets(1, &[5, 4]),
            Err(TidBitmapError::Misuse(_))
        ));
        store.set_block_offsets(1, &[1, MAX_OFFSET_NUMBER]).unwrap();
        assert!(store.is_member(ItemPointer::new(1, MAX_OFFSET_NUMBER)).unwrap());
    }

    #[test]
    fn get_block_offsets_reports_the_full_count() {
        let mut store = TidStore::create_local(1 << 20, false).unwrap();
        store.set_block_offsets(3, &[2, 4, 6, 8, 10]).unwrap();
        let result = store.iter().next().unwrap().unwrap();
        let mut out = [0; 3];
        assert_eq!(result.get_block_offsets(&mut out), 5);
        assert_eq!(out, [2, 4, 6]);
    }

    #[test]
    fn area_config_follows_the_budget() {
        let small = TidStore::shared_area_config(1 << 20, 3);
        assert_eq!(small.max_segment_size, MIN_SEGMENT_SIZE);
        assert!(small.init_segment_size <= small.max_segment_size);
        let large = TidStore::shared_area_config(1 << 34, 3);
        assert_eq!(large.max_segment_size, 1 << 30);
        assert_eq!(large.init_segment_size, DEFAULT_INIT_SEGMENT_SIZE);
        assert_eq!(large.tranche_id, 3);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn matches_a_model() {
        check!()
            .with_type::<Vec<(u16, Vec<u16>)>>()
            .for_each(|ops| {
                let mut store = TidStore::create_local(1 << 20, false).unwrap();
                let mut model: BTreeMap<BlockNumber, BTreeSet<OffsetNumber>> = BTreeMap::new();
                for (block, offsets) in ops {
                    let block = BlockNumber::from(*block % 512);
                    let offsets: BTreeSet<OffsetNumber> = offsets
                        .iter()
                        .map(|o| o % MAX_OFFSET_NUMBER + 1)
                        .collect();
                    let sorted: Vec<OffsetNumber> = offsets.iter().copied().collect();
                    store.set_block_offsets(block, &sorted).unwrap();
                    model.insert(block, offsets);
                }
                for (block, offsets) in &model {
                    for offset in [1, 2, 63, 64, 65, 300, MAX_OFFSET_NUMBER] {
                        assert_eq!(
                            store.is_member(ItemPointer::new(*block, offset)).unwrap(),
                            offsets.contains(&offset)
                        );
                    }
                }
                let stored: Vec<(BlockNumber, BTreeSet<OffsetNumber>)> = store
                    .iter()
                    .map(|r| {
                        let r = r.unwrap();
                        (r.block, r.offsets().collect())
                    })
                    .collect();
                let expected: Vec<(BlockNumber, BTreeSet<OffsetNumber>)> =
                    model.into_iter().collect();
                assert_eq!(stored, expected);
            });
    }
}
