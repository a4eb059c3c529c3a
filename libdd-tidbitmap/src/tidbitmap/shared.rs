// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Iteration shared between processes.
//!
//! The leader copies the sorted entries into the bitmap's area next to a
//! small state block holding a lock and the merge cursor:
//!
//! ```text
//! state:   | magic | lock | npages | nchunks | entries | cursor |
//! entries: | page 0 | .. | page npages-1 | chunk 0 | .. | chunk nchunks-1 |
//! ```
//!
//! Each participant attaches to the state and pulls blocks from the common
//! cursor, so every block is handed out exactly once. The cursor only moves
//! under the lock; offsets are extracted after it is released.

use super::iter::{Cursor, Step, TbmIterateResult};
use super::{Iterating, PagetableEntry, TidBitmap};
use crate::TidBitmapError;
use core::mem::size_of;
use core::ptr;
use libdd_dsa::{AllocFlags, DsaArea, DsaPointer};
use libdd_dsm::LwLock;

const SHARED_ITERATOR_MAGIC: u32 = 0x7b1d_5a17;

#[repr(C)]
struct SharedIterState {
    magic: u32,
    lock: LwLock,
    npages: usize,
    nchunks: usize,
    entries: DsaPointer,
    cursor: Cursor,
}

impl TidBitmap<'_> {
    /// Copies the bitmap into its area for shared iteration and returns the
    /// pointer participants attach to with [`TbmSharedIterator::attach`].
    /// The bitmap stays read-only from now on. The copy is released with
    /// [`free_shared_area`].
    pub fn prepare_shared_iterate(&mut self) -> Result<DsaPointer, TidBitmapError> {
        let Some(area) = self.area else {
            return Err(TidBitmapError::Misuse(
                "shared iteration needs a bitmap created with an area".to_owned(),
            ));
        };
        if self.iterating == Iterating::Private {
            return Err(TidBitmapError::Misuse(
                "tid bitmap is already being iterated privately".to_owned(),
            ));
        }
        self.prepare_sorted();
        self.iterating = Iterating::Shared;

        let entries = self.copy_sorted_entries(area)?;
        let state_pointer = match area.allocate(size_of::<SharedIterState>()) {
            Ok(dp) => dp,
            Err(err) => {
                if !entries.is_null() {
                    area.free(entries)?;
                }
                return Err(err.into());
            }
        };
        let state = area.get_address(state_pointer)?.cast::<SharedIterState>();
        // SAFETY: freshly allocated and large enough for the state block.
        unsafe {
            state.write(SharedIterState {
                magic: SHARED_ITERATOR_MAGIC,
                lock: LwLock::new(area.tranche_id()),
                npages: self.npages,
                nchunks: self.nchunks,
                entries,
                cursor: Cursor::default(),
            });
        }
        tracing::debug!(
            state = %state_pointer,
            npages = self.npages,
            nchunks = self.nchunks,
            "prepared tid bitmap for shared iteration"
        );
        Ok(state_pointer)
    }

    fn copy_sorted_entries(&self, area: &DsaArea) -> Result<DsaPointer, TidBitmapError> {
        let total = self.npages + self.nchunks;
        if total == 0 {
            return Ok(DsaPointer::NULL);
        }
        let entries = area.allocate_extended(total * size_of::<PagetableEntry>(), AllocFlags::HUGE)?;
        let base = area.get_address(entries)?.cast::<PagetableEntry>();
        let sorted = (0..self.npages)
            .filter_map(|n| self.sorted_page(n))
            .chain((0..self.nchunks).filter_map(|n| self.sorted_chunk(n)));
        let mut written = 0;
        for entry in sorted.take(total) {
            // SAFETY: in bounds of an allocation sized for `total` entries.
            unsafe { base.add(written).write(*entry) };
            written += 1;
        }
        if written != total {
            area.free(entries)?;
            return Err(TidBitmapError::Corrupted(format!(
                "tid bitmap counts {total} entries but holds {written}"
            )));
        }
        Ok(entries)
    }
}

/// Releases what [`TidBitmap::prepare_shared_iterate`] allocated. No
/// participant may use its iterator afterwards.
pub fn free_shared_area(area: &DsaArea, pointer: DsaPointer) -> Result<(), TidBitmapError> {
    let state = resolve_state(area, pointer)?;
    // SAFETY: validated above; participants are done.
    let entries = unsafe {
        (*state).magic = 0;
        (*state).entries
    };
    if !entries.is_null() {
        area.free(entries)?;
    }
    area.free(pointer)?;
    tracing::debug!(state = %pointer, "freed shared tid bitmap iteration");
    Ok(())
}

fn resolve_state(area: &DsaArea, pointer: DsaPointer) -> Result<*mut SharedIterState, TidBitmapError> {
    if pointer.is_null() {
        return Err(TidBitmapError::Misuse(
            "cannot attach to a null shared iteration pointer".to_owned(),
        ));
    }
    let state = area.get_address(pointer)?.cast::<SharedIterState>();
    // SAFETY: the magic is written once when the state is prepared.
    if unsafe { (*state).magic } != SHARED_ITERATOR_MAGIC {
        return Err(TidBitmapError::Corrupted(format!(
            "no shared tid bitmap iteration at {pointer}"
        )));
    }
    Ok(state)
}

/// One participant's view of a shared iteration.
pub struct TbmSharedIterator<'a> {
    _area: &'a DsaArea,
    state: *mut SharedIterState,
    entries: *const PagetableEntry,
    npages: usize,
    nchunks: usize,
}

// SAFETY: the state block is shared memory whose cursor is guarded by its
// lock; the entries are immutable once prepared.
unsafe impl Send for TbmSharedIterator<'_> {}

impl<'a> TbmSharedIterator<'a> {
    pub fn attach(area: &'a DsaArea, pointer: DsaPointer) -> Result<Self, TidBitmapError> {
        let state = resolve_state(area, pointer)?;
        // SAFETY: validated above; these fields never change.
        let (npages, nchunks, entries) =
            unsafe { ((*state).npages, (*state).nchunks, (*state).entries) };
        let entries = if entries.is_null() {
            ptr::null()
        } else {
            area.get_address(entries)?.cast::<PagetableEntry>().cast_const()
        };
        Ok(TbmSharedIterator {
            _area: area,
            state,
            entries,
            npages,
            nchunks,
        })
    }

    fn entry(&self, index: usize) -> Option<&PagetableEntry> {
        if self.entries.is_null() || index >= self.npages + self.nchunks {
            return None;
        }
        // SAFETY: in bounds; the entries are immutable while attached.
        Some(unsafe { &*self.entries.add(index) })
    }

    fn lock(&self) -> &LwLock {
        // SAFETY: the state outlives the iterator; the lock is only used
        // through shared references.
        unsafe { &*ptr::addr_of!((*self.state).lock) }
    }
}

impl Iterator for TbmSharedIterator<'_> {
    type Item = Result<TbmIterateResult, TidBitmapError>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state;
        let step = {
            let _guard = self.lock().write();
            // SAFETY: the cursor is only touched while holding the lock.
            let cursor = unsafe { &mut *ptr::addr_of_mut!((*state).cursor) };
            cursor.advance(
                self.npages,
                self.nchunks,
                |n| self.entry(n),
                |n| self.entry(self.npages + n),
            )
        };
        match step {
            Step::Lossy(blockno) => Some(Ok(TbmIterateResult::lossy(blockno))),
            Step::Page(n) => self.entry(n).map(TbmIterateResult::exact),
            Step::Done => None,
        }
    }
}

impl core::fmt::Debug for TbmSharedIterator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TbmSharedIterator")
            .field("npages", &self.npages)
            .field("nchunks", &self.nchunks)
            .finish_non_exhaustive()
    }
}
