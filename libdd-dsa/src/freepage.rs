// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Free page manager.
//!
//! Tracks which [`FPM_PAGE_SIZE`] pages of a contiguous extent are unused.
//! It has no memory of its own beyond the [`FreePageManager`] header: free
//! runs are threaded onto size-segregated freelists through a leader record
//! written into the first page of each run, and a btree of free runs ordered
//! by page number (used to coalesce neighbours on free) lives in pages taken
//! from the extent itself.
//!
//! While there is only one free run the btree does not exist; the run is kept
//! as a singleton in the header. Every pointer stored anywhere is a
//! [`RelPtr`] against the extent base, so the manager works at any mapping
//! address.

use crate::pointer::RelPtr;
use crate::DsaError;
use core::fmt::Write as _;
use core::mem;
use core::ptr;

pub const FPM_PAGE_SIZE: usize = 4096;
/// Lists 0..127 hold runs of exactly `index + 1` pages; the last list holds
/// every run of 129 pages or more.
pub const FPM_NUM_FREELISTS: usize = 129;

const SPAN_LEADER_MAGIC: u32 = 0xea40_20f0;
const LEAF_MAGIC: u32 = 0x98ea_e728;
const INTERNAL_MAGIC: u32 = 0x19aa_32c9;

#[repr(C)]
struct SpanLeader {
    magic: u32,
    npages: usize,
    prev: RelPtr,
    next: RelPtr,
}

#[repr(C)]
struct BtreeHeader {
    magic: u32,
    nused: usize,
    parent: RelPtr,
}

/// Leaf keys are `(first_page, npages)`; internal keys are
/// `(first_page, child)` where `value` holds the child's raw `RelPtr`.
#[repr(C)]
#[derive(Clone, Copy)]
struct BtreeKey {
    first_page: usize,
    value: usize,
}

const ITEMS_PER_PAGE: usize =
    (FPM_PAGE_SIZE - mem::size_of::<BtreeHeader>()) / mem::size_of::<BtreeKey>();

#[repr(C)]
struct BtreePage {
    hdr: BtreeHeader,
    keys: [BtreeKey; ITEMS_PER_PAGE],
}

const _: () = assert!(mem::size_of::<BtreePage>() <= FPM_PAGE_SIZE);
const _: () = assert!(mem::size_of::<SpanLeader>() <= FPM_PAGE_SIZE);

impl BtreePage {
    fn is_leaf(&self) -> bool {
        self.hdr.magic == LEAF_MAGIC
    }

    fn child(&self, index: usize) -> RelPtr {
        RelPtr::from_raw(self.keys[index].value)
    }

    fn set_child(&mut self, index: usize, child: RelPtr) {
        self.keys[index].value = child.as_raw();
    }

    fn first_key(&self) -> usize {
        debug_assert!(self.hdr.nused > 0);
        self.keys[0].first_page
    }

    /// Index of the first key >= `first_page`, or `nused` if there is none.
    fn search(&self, first_page: usize) -> usize {
        let (mut low, mut high) = (0, self.hdr.nused);
        while low < high {
            let mid = (low + high) / 2;
            let val = self.keys[mid].first_page;
            if first_page == val {
                return mid;
            } else if first_page < val {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        low
    }
}

struct SearchResult {
    page: *mut BtreePage,
    index: usize,
    found: bool,
    /// Extra btree pages a split would need to insert here.
    split_pages: usize,
}

/// Header of a free page manager. It may live inside the extent it manages
/// or anywhere else; it only has to be at a fixed distance from the extent
/// base in every mapping.
#[repr(C)]
pub struct FreePageManager {
    self_ptr: RelPtr,
    btree_root: RelPtr,
    btree_recycle: RelPtr,
    btree_depth: u32,
    btree_recycle_count: u32,
    singleton_first_page: usize,
    singleton_npages: usize,
    contiguous_pages: usize,
    contiguous_pages_dirty: bool,
    freelist: [RelPtr; FPM_NUM_FREELISTS],
}

impl FreePageManager {
    /// Initializes an empty manager for pages relative to `base`.
    ///
    /// # Safety
    /// `fpm` must be valid for writes. Every page later handed to
    /// [`FreePageManager::put`] must be valid, exclusively owned memory at
    /// `base + page * FPM_PAGE_SIZE`, and the manager must stay at the same
    /// distance from `base` in every mapping that uses it.
    pub unsafe fn initialize(fpm: *mut FreePageManager, base: *mut u8) {
        fpm.write(FreePageManager {
            self_ptr: RelPtr::from_ptr(base, fpm),
            btree_root: RelPtr::NULL,
            btree_recycle: RelPtr::NULL,
            btree_depth: 0,
            btree_recycle_count: 0,
            singleton_first_page: 0,
            singleton_npages: 0,
            contiguous_pages: 0,
            contiguous_pages_dirty: true,
            freelist: [RelPtr::NULL; FPM_NUM_FREELISTS],
        });
    }

    fn base(&self) -> *mut u8 {
        let offset = self.self_ptr.offset().unwrap_or(0);
        (self as *const Self as *mut u8).wrapping_sub(offset)
    }

    fn page_to_ptr<T>(&self, pageno: usize) -> *mut T {
        self.base().wrapping_add(pageno * FPM_PAGE_SIZE).cast()
    }

    fn ptr_to_page<T>(&self, ptr: *const T) -> usize {
        (ptr as usize).wrapping_sub(self.base() as usize) / FPM_PAGE_SIZE
    }

    fn access<T>(&self, rel: RelPtr) -> *mut T {
        rel.resolve(self.base())
    }

    fn rel<T>(&self, ptr: *const T) -> RelPtr {
        RelPtr::from_ptr(self.base(), ptr)
    }

    /// Size of the largest run [`FreePageManager::get`] could satisfy.
    pub fn largest(&self) -> usize {
        self.contiguous_pages
    }

    /// Allocates a run of `npages` pages and returns its first page.
    pub fn get(&mut self, npages: usize) -> Option<usize> {
        // SAFETY: established by `initialize`.
        unsafe {
            let result = self.get_internal(npages);

            // Taking a key out of the btree can let a recycled page go back,
            // which may merge two runs into one larger than any before.
            let contiguous_pages = self.btree_cleanup();
            if self.contiguous_pages < contiguous_pages {
                self.contiguous_pages = contiguous_pages;
            }
            self.update_largest();
            result
        }
    }

    /// Returns the run `first_page .. first_page + npages` to the manager.
    /// Returns the size of the free run the pages ended up in.
    pub fn put(&mut self, first_page: usize, npages: usize) -> Result<usize, DsaError> {
        debug_assert!(npages > 0);
        // SAFETY: established by `initialize`.
        unsafe {
            let mut contiguous_pages = self.put_internal(first_page, npages, false)?;
            if contiguous_pages > npages {
                let cleanup_pages = self.btree_cleanup();
                if cleanup_pages > contiguous_pages {
                    contiguous_pages = cleanup_pages;
                }
            }
            if self.contiguous_pages < contiguous_pages {
                self.contiguous_pages = contiguous_pages;
            }
            self.update_largest();
            Ok(contiguous_pages)
        }
    }

    fn largest_contiguous(&self) -> usize {
        let last = FPM_NUM_FREELISTS - 1;
        let mut largest = 0;
        if !self.freelist[last].is_null() {
            let mut candidate = self.access::<SpanLeader>(self.freelist[last]);
            // SAFETY: freelist entries point at span leaders inside the extent.
            unsafe {
                while !candidate.is_null() {
                    largest = largest.max((*candidate).npages);
                    candidate = self.access((*candidate).next);
                }
            }
        } else if let Some(f) = (0..last).rev().find(|&f| !self.freelist[f].is_null()) {
            largest = f + 1;
        }
        largest
    }

    fn update_largest(&mut self) {
        if self.contiguous_pages_dirty {
            self.contiguous_pages = self.largest_contiguous();
            self.contiguous_pages_dirty = false;
        }
    }

    // -- Allocation ---------------------------------------------------------

    unsafe fn get_internal(&mut self, npages: usize) -> Option<usize> {
        let mut victim: *mut SpanLeader = ptr::null_mut();
        let mut f = npages.min(FPM_NUM_FREELISTS) - 1;

        // Best fit: the fixed-size lists are exact, the last list is searched.
        while f < FPM_NUM_FREELISTS {
            if self.freelist[f].is_null() {
                f += 1;
                continue;
            }
            if f < FPM_NUM_FREELISTS - 1 {
                victim = self.access(self.freelist[f]);
            } else {
                let mut candidate = self.access::<SpanLeader>(self.freelist[f]);
                while !candidate.is_null() {
                    if (*candidate).npages >= npages
                        && (victim.is_null() || (*victim).npages > (*candidate).npages)
                    {
                        victim = candidate;
                        if (*victim).npages == npages {
                            break;
                        }
                    }
                    candidate = self.access((*candidate).next);
                }
            }
            break;
        }

        if victim.is_null() {
            return None;
        }

        debug_assert_eq!((*victim).magic, SPAN_LEADER_MAGIC);
        let prev = self.access::<SpanLeader>((*victim).prev);
        let next = self.access::<SpanLeader>((*victim).next);
        if !prev.is_null() {
            (*prev).next = (*victim).next;
        } else {
            self.freelist[f] = (*victim).next;
        }
        if !next.is_null() {
            (*next).prev = (*victim).prev;
        }
        let victim_page = self.ptr_to_page(victim);
        let victim_npages = (*victim).npages;

        if f == FPM_NUM_FREELISTS - 1 && victim_npages == self.contiguous_pages {
            // There may or may not be another run of the same size.
            self.contiguous_pages_dirty = true;
        } else if f + 1 == self.contiguous_pages && self.freelist[f].is_null() {
            self.contiguous_pages_dirty = true;
        }

        if self.btree_root.is_null() {
            debug_assert_eq!(victim_page, self.singleton_first_page);
            debug_assert!(victim_npages >= npages);
            self.singleton_first_page += npages;
            self.singleton_npages -= npages;
            if self.singleton_npages > 0 {
                self.push_span_leader(self.singleton_first_page, self.singleton_npages);
            }
        } else {
            let result = self.btree_search(victim_page);
            debug_assert!(result.found);
            if victim_npages == npages {
                self.btree_remove(result.page, result.index);
            } else {
                let key = &mut (*result.page).keys[result.index];
                key.first_page += npages;
                key.value -= npages;
                if result.index == 0 {
                    self.adjust_ancestor_keys(result.page);
                }
                self.push_span_leader(victim_page + npages, victim_npages - npages);
            }
        }

        Some(victim_page)
    }

    /// Inserts a free run, merging it with its neighbours. With `soft` the
    /// insertion is skipped (returning 0) when it would need a new btree
    /// page. Otherwise returns the size of the run that now contains it.
    unsafe fn put_internal(
        &mut self,
        first_page: usize,
        npages: usize,
        soft: bool,
    ) -> Result<usize, DsaError> {
        if self.btree_depth == 0 {
            if self.singleton_npages == 0 {
                self.singleton_first_page = first_page;
                self.singleton_npages = npages;
                self.push_span_leader(first_page, npages);
                return Ok(npages);
            } else if self.singleton_first_page + self.singleton_npages == first_page {
                self.singleton_npages += npages;
                self.pop_span_leader(self.singleton_first_page);
                self.push_span_leader(self.singleton_first_page, self.singleton_npages);
                return Ok(self.singleton_npages);
            } else if first_page + npages == self.singleton_first_page {
                self.pop_span_leader(self.singleton_first_page);
                self.singleton_first_page = first_page;
                self.singleton_npages += npages;
                self.push_span_leader(self.singleton_first_page, self.singleton_npages);
                return Ok(self.singleton_npages);
            }

            // Two separate runs: time to build the btree.
            let root: *mut BtreePage = if !self.btree_recycle.is_null() {
                self.get_recycled()
            } else if soft {
                return Ok(0);
            } else if let Some(root_page) = self.get_internal(1) {
                self.page_to_ptr(root_page)
            } else {
                return Err(corrupt());
            };

            (*root).hdr.magic = LEAF_MAGIC;
            (*root).hdr.nused = 1;
            (*root).hdr.parent = RelPtr::NULL;
            (*root).keys[0] = BtreeKey {
                first_page: self.singleton_first_page,
                value: self.singleton_npages,
            };
            self.btree_root = self.rel(root);
            self.singleton_first_page = 0;
            self.singleton_npages = 0;
            self.btree_depth = 1;

            // The root may have consumed the last free page of the singleton.
            if (*root).keys[0].value == 0 {
                (*root).keys[0] = BtreeKey {
                    first_page,
                    value: npages,
                };
                self.push_span_leader(first_page, npages);
                return Ok(npages);
            }
        }

        let mut result = self.btree_search(first_page);
        debug_assert!(!result.found);
        let page = result.page;
        let prevkey = if result.index > 0 {
            (*page).keys.as_mut_ptr().add(result.index - 1)
        } else {
            ptr::null_mut()
        };
        let (np, nindex, nextkey) = if result.index < (*page).hdr.nused {
            (page, result.index, (*page).keys.as_mut_ptr().add(result.index))
        } else {
            let np = self.find_right_sibling(page);
            let nextkey = if np.is_null() {
                ptr::null_mut()
            } else {
                (*np).keys.as_mut_ptr()
            };
            (np, 0, nextkey)
        };

        // Merge with the preceding run, and possibly the following one too.
        if !prevkey.is_null() && (*prevkey).first_page + (*prevkey).value >= first_page {
            debug_assert_eq!((*prevkey).first_page + (*prevkey).value, first_page);
            (*prevkey).value = (first_page - (*prevkey).first_page) + npages;

            let mut remove_next = false;
            if !nextkey.is_null()
                && (*prevkey).first_page + (*prevkey).value >= (*nextkey).first_page
            {
                (*prevkey).value =
                    ((*nextkey).first_page - (*prevkey).first_page) + (*nextkey).value;
                self.pop_span_leader((*nextkey).first_page);
                remove_next = true;
            }

            self.pop_span_leader((*prevkey).first_page);
            self.push_span_leader((*prevkey).first_page, (*prevkey).value);
            let merged = (*prevkey).value;

            // Last, since removal may move the keys we point at.
            if remove_next {
                self.btree_remove(np, nindex);
            }
            return Ok(merged);
        }

        // Merge with the following run.
        if !nextkey.is_null() && first_page + npages >= (*nextkey).first_page {
            debug_assert_eq!(first_page + npages, (*nextkey).first_page);
            let newpages = ((*nextkey).first_page - first_page) + (*nextkey).value;
            self.pop_span_leader((*nextkey).first_page);
            self.push_span_leader(first_page, newpages);
            (*nextkey).first_page = first_page;
            (*nextkey).value = newpages;
            if nindex == 0 {
                self.adjust_ancestor_keys(np);
            }
            return Ok(newpages);
        }

        if result.split_pages > 0 {
            if soft {
                return Ok(0);
            }

            if result.split_pages > self.btree_recycle_count as usize {
                let pages_needed = result.split_pages - self.btree_recycle_count as usize;
                for _ in 0..pages_needed {
                    let Some(recycle_page) = self.get_internal(1) else {
                        return Err(corrupt());
                    };
                    self.btree_recycle(recycle_page);
                }
                // Allocating may have reshaped the tree.
                result = self.btree_search(first_page);
                debug_assert!(result.split_pages <= self.btree_recycle_count as usize);
            }

            if result.split_pages > 0 {
                self.split_and_insert(result.page, first_page, npages);
                self.push_span_leader(first_page, npages);
                return Ok(npages);
            }
        }

        debug_assert!((*result.page).hdr.nused < ITEMS_PER_PAGE);
        insert_leaf(result.page, result.index, first_page, npages);
        if result.index == 0 {
            self.adjust_ancestor_keys(result.page);
        }
        self.push_span_leader(first_page, npages);
        Ok(npages)
    }

    /// Splits the full leaf `split_target` (and full ancestors as needed)
    /// and inserts the key. Enough pages must be on the recycle list.
    unsafe fn split_and_insert(
        &mut self,
        mut split_target: *mut BtreePage,
        first_page: usize,
        npages: usize,
    ) {
        let mut child: *mut BtreePage = ptr::null_mut();
        let mut key = first_page;

        loop {
            let parent = self.access::<BtreePage>((*split_target).hdr.parent);
            let newsibling = self.split_page(split_target);

            // Carry the pending insertion: the new key on the first pass, the
            // downlink for the previous split afterwards.
            let insert_into = if key < (*newsibling).keys[0].first_page {
                split_target
            } else {
                newsibling
            };
            let index = (*insert_into).search(key);
            if child.is_null() {
                insert_leaf(insert_into, index, key, npages);
            } else {
                self.insert_internal(insert_into, index, key, child);
                (*child).hdr.parent = self.rel(insert_into);
            }
            if index == 0 && insert_into == split_target {
                self.adjust_ancestor_keys(split_target);
            }

            if parent.is_null() {
                let newroot = self.get_recycled();
                (*newroot).hdr.magic = INTERNAL_MAGIC;
                (*newroot).hdr.nused = 2;
                (*newroot).hdr.parent = RelPtr::NULL;
                (*newroot).keys[0].first_page = (*split_target).first_key();
                (*newroot).set_child(0, self.rel(split_target));
                (*split_target).hdr.parent = self.rel(newroot);
                (*newroot).keys[1].first_page = (*newsibling).first_key();
                (*newroot).set_child(1, self.rel(newsibling));
                (*newsibling).hdr.parent = self.rel(newroot);
                self.btree_root = self.rel(newroot);
                self.btree_depth += 1;
                break;
            }

            key = (*newsibling).first_key();
            if (*parent).hdr.nused < ITEMS_PER_PAGE {
                let index = (*parent).search(key);
                self.insert_internal(parent, index, key, newsibling);
                (*newsibling).hdr.parent = self.rel(parent);
                if index == 0 {
                    self.adjust_ancestor_keys(parent);
                }
                break;
            }

            child = newsibling;
            split_target = parent;
        }
    }

    // -- Freelists ----------------------------------------------------------

    unsafe fn pop_span_leader(&mut self, pageno: usize) {
        let span = self.page_to_ptr::<SpanLeader>(pageno);
        let next = self.access::<SpanLeader>((*span).next);
        let prev = self.access::<SpanLeader>((*span).prev);
        if !next.is_null() {
            (*next).prev = (*span).prev;
        }
        if !prev.is_null() {
            (*prev).next = (*span).next;
        } else {
            let f = (*span).npages.min(FPM_NUM_FREELISTS) - 1;
            debug_assert_eq!(self.freelist[f].offset(), Some(pageno * FPM_PAGE_SIZE));
            self.freelist[f] = (*span).next;
        }
    }

    unsafe fn push_span_leader(&mut self, first_page: usize, npages: usize) {
        let f = npages.min(FPM_NUM_FREELISTS) - 1;
        let head = self.access::<SpanLeader>(self.freelist[f]);
        let span = self.page_to_ptr::<SpanLeader>(first_page);
        span.write(SpanLeader {
            magic: SPAN_LEADER_MAGIC,
            npages,
            prev: RelPtr::NULL,
            next: self.freelist[f],
        });
        if !head.is_null() {
            (*head).prev = self.rel(span);
        }
        self.freelist[f] = self.rel(span);
    }

    // -- Btree maintenance --------------------------------------------------

    /// Propagates a changed first key of `btp` to the ancestors whose
    /// separator is that key.
    unsafe fn adjust_ancestor_keys(&mut self, btp: *mut BtreePage) {
        let first_page = (*btp).first_key();
        let mut child = btp;
        loop {
            let parent = self.access::<BtreePage>((*child).hdr.parent);
            if parent.is_null() {
                break;
            }
            let mut s = (*parent).search(first_page);
            if s >= (*parent).hdr.nused {
                s -= 1;
            } else if self.access::<BtreePage>((*parent).child(s)) != child {
                debug_assert!(s > 0);
                s -= 1;
            }
            debug_assert_eq!(self.access::<BtreePage>((*parent).child(s)), child);
            (*parent).keys[s].first_page = first_page;
            if s > 0 {
                break;
            }
            child = parent;
        }
    }

    /// Shrinks the btree where possible and gives recycled btree pages back
    /// to the freelists. Returns the largest run this created.
    unsafe fn btree_cleanup(&mut self) -> usize {
        let mut max_contiguous_pages = 0;

        while !self.btree_root.is_null() {
            let root = self.access::<BtreePage>(self.btree_root);
            if (*root).hdr.nused == 1 {
                self.btree_depth -= 1;
                if (*root).is_leaf() {
                    self.btree_root = RelPtr::NULL;
                    self.singleton_first_page = (*root).keys[0].first_page;
                    self.singleton_npages = (*root).keys[0].value;
                } else {
                    self.btree_root = (*root).child(0);
                    let newroot = self.access::<BtreePage>(self.btree_root);
                    (*newroot).hdr.parent = RelPtr::NULL;
                }
                self.btree_recycle(self.ptr_to_page(root));
            } else if (*root).hdr.nused == 2 && (*root).is_leaf() {
                let end_of_first = (*root).keys[0].first_page + (*root).keys[0].value;
                let start_of_second = (*root).keys[1].first_page;

                // The root page itself is the only gap between the two runs.
                if end_of_first + 1 == start_of_second && end_of_first == self.ptr_to_page(root)
                {
                    let first = (*root).keys[0];
                    let second = (*root).keys[1];
                    self.pop_span_leader(first.first_page);
                    self.pop_span_leader(second.first_page);
                    self.singleton_first_page = first.first_page;
                    self.singleton_npages = first.value + second.value + 1;
                    self.btree_depth = 0;
                    self.btree_root = RelPtr::NULL;
                    self.push_span_leader(self.singleton_first_page, self.singleton_npages);
                    max_contiguous_pages = self.singleton_npages;
                }
                break;
            } else {
                break;
            }
        }

        // Only the head of the recycle list is retried, and only when it fits
        // without a split.
        while self.btree_recycle_count > 0 {
            let btp = self.get_recycled();
            let first_page = self.ptr_to_page(btp);
            // Soft insertions never allocate, so they cannot fail.
            let contiguous_pages = self.put_internal(first_page, 1, true).unwrap_or(0);
            if contiguous_pages == 0 {
                self.btree_recycle(first_page);
                break;
            }
            max_contiguous_pages = max_contiguous_pages.max(contiguous_pages);
        }

        max_contiguous_pages
    }

    /// Merges `btp` into a sibling when it is less than a third full.
    unsafe fn btree_consolidate(&mut self, btp: *mut BtreePage) {
        let max = ITEMS_PER_PAGE;
        if (*btp).hdr.nused >= max / 3 {
            return;
        }

        let np = self.find_right_sibling(btp);
        if !np.is_null() && (*btp).hdr.nused + (*np).hdr.nused <= max {
            let used = (*btp).hdr.nused;
            let moving = (*np).hdr.nused;
            ptr::copy_nonoverlapping(
                (*np).keys.as_ptr(),
                (*btp).keys.as_mut_ptr().add(used),
                moving,
            );
            (*btp).hdr.nused += moving;
            if !(*btp).is_leaf() {
                self.update_parent_pointers(btp);
            }
            self.btree_remove_page(np);
            return;
        }

        // Move our keys left rather than theirs right; no ancestor changes.
        let np = self.find_left_sibling(btp);
        if !np.is_null() && (*btp).hdr.nused + (*np).hdr.nused <= max {
            let used = (*np).hdr.nused;
            let moving = (*btp).hdr.nused;
            ptr::copy_nonoverlapping(
                (*btp).keys.as_ptr(),
                (*np).keys.as_mut_ptr().add(used),
                moving,
            );
            (*np).hdr.nused += moving;
            if !(*np).is_leaf() {
                self.update_parent_pointers(np);
            }
            self.btree_remove_page(btp);
        }
    }

    unsafe fn find_left_sibling(&self, btp: *mut BtreePage) -> *mut BtreePage {
        let mut p = btp;
        let mut levels = 0;
        loop {
            let first_page = (*p).first_key();
            p = self.access((*p).hdr.parent);
            if p.is_null() {
                return ptr::null_mut();
            }
            let index = (*p).search(first_page);
            if index > 0 {
                p = self.access((*p).child(index - 1));
                break;
            }
            levels += 1;
        }
        while levels > 0 {
            p = self.access((*p).child((*p).hdr.nused - 1));
            levels -= 1;
        }
        p
    }

    unsafe fn find_right_sibling(&self, btp: *mut BtreePage) -> *mut BtreePage {
        let mut p = btp;
        let mut levels = 0;
        loop {
            let first_page = (*p).first_key();
            p = self.access((*p).hdr.parent);
            if p.is_null() {
                return ptr::null_mut();
            }
            let index = (*p).search(first_page);
            if index < (*p).hdr.nused - 1 {
                p = self.access((*p).child(index + 1));
                break;
            }
            levels += 1;
        }
        while levels > 0 {
            p = self.access((*p).child(0));
            levels -= 1;
        }
        p
    }

    unsafe fn get_recycled(&mut self) -> *mut BtreePage {
        let victim = self.access::<SpanLeader>(self.btree_recycle);
        debug_assert!(!victim.is_null());
        let newhead = self.access::<SpanLeader>((*victim).next);
        if !newhead.is_null() {
            (*newhead).prev = (*victim).prev;
        }
        self.btree_recycle = self.rel(newhead);
        self.btree_recycle_count -= 1;
        victim.cast()
    }

    unsafe fn btree_recycle(&mut self, pageno: usize) {
        let head = self.access::<SpanLeader>(self.btree_recycle);
        let span = self.page_to_ptr::<SpanLeader>(pageno);
        span.write(SpanLeader {
            magic: SPAN_LEADER_MAGIC,
            npages: 1,
            prev: RelPtr::NULL,
            next: self.btree_recycle,
        });
        if !head.is_null() {
            (*head).prev = self.rel(span);
        }
        self.btree_recycle = self.rel(span);
        self.btree_recycle_count += 1;
    }

    unsafe fn insert_internal(
        &self,
        btp: *mut BtreePage,
        index: usize,
        first_page: usize,
        child: *mut BtreePage,
    ) {
        debug_assert_eq!((*btp).hdr.magic, INTERNAL_MAGIC);
        let nused = (*btp).hdr.nused;
        let keys = (*btp).keys.as_mut_ptr();
        ptr::copy(keys.add(index), keys.add(index + 1), nused - index);
        (*btp).keys[index].first_page = first_page;
        (*btp).set_child(index, self.rel(child));
        (*btp).hdr.nused += 1;
    }

    /// Removes the leaf key at `index`, dropping the page when it empties.
    unsafe fn btree_remove(&mut self, btp: *mut BtreePage, index: usize) {
        debug_assert!((*btp).is_leaf());
        if (*btp).hdr.nused == 1 {
            self.btree_remove_page(btp);
            return;
        }
        (*btp).hdr.nused -= 1;
        let nused = (*btp).hdr.nused;
        if index < nused {
            let keys = (*btp).keys.as_mut_ptr();
            ptr::copy(keys.add(index + 1), keys.add(index), nused - index);
        }
        if index == 0 {
            self.adjust_ancestor_keys(btp);
        }
        self.btree_consolidate(btp);
    }

    /// Unlinks `btp` (whose keys the caller has already moved) from its
    /// parent and recycles it, removing single-child ancestors too.
    unsafe fn btree_remove_page(&mut self, mut btp: *mut BtreePage) {
        let parent = loop {
            let parent = self.access::<BtreePage>((*btp).hdr.parent);
            if parent.is_null() {
                self.btree_root = RelPtr::NULL;
                self.btree_depth = 0;
                return;
            }
            if (*parent).hdr.nused > 1 {
                break parent;
            }
            self.btree_recycle(self.ptr_to_page(btp));
            btp = parent;
        };

        let first_page = (*btp).first_key();
        let index = (*parent).search(first_page);
        debug_assert!(index < (*parent).hdr.nused);
        let nused = (*parent).hdr.nused;
        if index < nused - 1 {
            let keys = (*parent).keys.as_mut_ptr();
            ptr::copy(keys.add(index + 1), keys.add(index), nused - index - 1);
        }
        (*parent).hdr.nused -= 1;

        self.btree_recycle(self.ptr_to_page(btp));
        if index == 0 {
            self.adjust_ancestor_keys(parent);
        }
        self.btree_consolidate(parent);
    }

    unsafe fn btree_search(&self, first_page: usize) -> SearchResult {
        let mut btp = self.access::<BtreePage>(self.btree_root);
        let mut split_pages = 1;
        if btp.is_null() {
            return SearchResult {
                page: ptr::null_mut(),
                index: 0,
                found: false,
                split_pages,
            };
        }

        while !(*btp).is_leaf() {
            let mut index = (*btp).search(first_page);
            let found_exact =
                index < (*btp).hdr.nused && (*btp).keys[index].first_page == first_page;
            // Without an exact match, go left so the insertion point is at
            // that child's high end.
            if !found_exact && index > 0 {
                index -= 1;
            }
            if (*btp).hdr.nused >= ITEMS_PER_PAGE {
                split_pages += 1;
            } else {
                split_pages = 0;
            }
            btp = self.access((*btp).child(index));
        }

        if (*btp).hdr.nused >= ITEMS_PER_PAGE {
            split_pages += 1;
        } else {
            split_pages = 0;
        }

        let index = (*btp).search(first_page);
        SearchResult {
            page: btp,
            index,
            found: index < (*btp).hdr.nused && (*btp).keys[index].first_page == first_page,
            split_pages,
        }
    }

    /// Moves the upper half of `btp` to a recycled page and returns it; the
    /// caller adds the downlink.
    unsafe fn split_page(&mut self, btp: *mut BtreePage) -> *mut BtreePage {
        let newsibling = self.get_recycled();
        (*newsibling).hdr.magic = (*btp).hdr.magic;
        (*newsibling).hdr.nused = (*btp).hdr.nused / 2;
        (*newsibling).hdr.parent = (*btp).hdr.parent;
        (*btp).hdr.nused -= (*newsibling).hdr.nused;
        ptr::copy_nonoverlapping(
            (*btp).keys.as_ptr().add((*btp).hdr.nused),
            (*newsibling).keys.as_mut_ptr(),
            (*newsibling).hdr.nused,
        );
        if !(*btp).is_leaf() {
            self.update_parent_pointers(newsibling);
        }
        newsibling
    }

    unsafe fn update_parent_pointers(&self, btp: *mut BtreePage) {
        debug_assert_eq!((*btp).hdr.magic, INTERNAL_MAGIC);
        for i in 0..(*btp).hdr.nused {
            let child = self.access::<BtreePage>((*btp).child(i));
            (*child).hdr.parent = self.rel(btp);
        }
    }

    // -- Diagnostics --------------------------------------------------------

    /// Human-readable description of the manager's state.
    pub fn dump(&self) -> String {
        let mut buf = String::new();
        let _ = writeln!(
            buf,
            "metadata: self {} max contiguous pages = {}",
            self.self_ptr.offset().unwrap_or(0),
            self.contiguous_pages
        );
        // SAFETY: established by `initialize`.
        unsafe {
            if self.btree_depth > 0 {
                let _ = writeln!(buf, "btree depth {}:", self.btree_depth);
                let root = self.access::<BtreePage>(self.btree_root);
                self.dump_btree(root, ptr::null_mut(), 0, &mut buf);
            } else if self.singleton_npages > 0 {
                let _ = writeln!(
                    buf,
                    "singleton: {}({})",
                    self.singleton_first_page, self.singleton_npages
                );
            }

            if !self.btree_recycle.is_null() {
                buf.push_str("btree recycle:");
                self.dump_spans(self.access(self.btree_recycle), 1, &mut buf);
            }

            let mut dumped_any_freelist = false;
            for (f, head) in self.freelist.iter().enumerate() {
                if head.is_null() {
                    continue;
                }
                if !dumped_any_freelist {
                    buf.push_str("freelists:\n");
                    dumped_any_freelist = true;
                }
                let _ = write!(buf, "  {}:", f + 1);
                self.dump_spans(self.access(*head), f + 1, &mut buf);
            }
        }
        buf
    }

    unsafe fn dump_btree(
        &self,
        btp: *mut BtreePage,
        parent: *mut BtreePage,
        level: usize,
        buf: &mut String,
    ) {
        let check_parent = self.access::<BtreePage>((*btp).hdr.parent);
        let _ = write!(
            buf,
            "  {}@{} {}",
            self.ptr_to_page(btp),
            level,
            if (*btp).is_leaf() { 'l' } else { 'i' }
        );
        if parent != check_parent {
            let _ = write!(
                buf,
                " [actual parent {}, expected {}]",
                self.ptr_to_page(check_parent),
                self.ptr_to_page(parent)
            );
        }
        buf.push(':');
        for index in 0..(*btp).hdr.nused {
            let key = (*btp).keys[index];
            if (*btp).is_leaf() {
                let _ = write!(buf, " {}({})", key.first_page, key.value);
            } else {
                let child = (*btp).child(index).offset().unwrap_or(0) / FPM_PAGE_SIZE;
                let _ = write!(buf, " {}->{}", key.first_page, child);
            }
        }
        buf.push('\n');
        if !(*btp).is_leaf() {
            for index in 0..(*btp).hdr.nused {
                self.dump_btree(self.access((*btp).child(index)), btp, level + 1, buf);
            }
        }
    }

    unsafe fn dump_spans(&self, mut span: *mut SpanLeader, expected_pages: usize, buf: &mut String) {
        while !span.is_null() {
            if (*span).npages != expected_pages {
                let _ = write!(buf, " {}({})", self.ptr_to_page(span), (*span).npages);
            } else {
                let _ = write!(buf, " {}", self.ptr_to_page(span));
            }
            span = self.access((*span).next);
        }
        buf.push('\n');
    }

    /// Pages held by the manager: free runs, btree pages and recycled pages.
    #[cfg(test)]
    pub(crate) fn sum_free_pages(&self) -> usize {
        unsafe fn recurse(fpm: &FreePageManager, btp: *mut BtreePage, sum: &mut usize) {
            *sum += 1;
            if !(*btp).is_leaf() {
                for index in 0..(*btp).hdr.nused {
                    recurse(fpm, fpm.access((*btp).child(index)), sum);
                }
            }
        }

        let mut sum = 0;
        unsafe {
            for head in &self.freelist {
                let mut candidate = self.access::<SpanLeader>(*head);
                while !candidate.is_null() {
                    sum += (*candidate).npages;
                    candidate = self.access((*candidate).next);
                }
            }
            if self.btree_depth > 0 {
                recurse(self, self.access(self.btree_root), &mut sum);
            }
            let mut recycle = self.access::<SpanLeader>(self.btree_recycle);
            while !recycle.is_null() {
                sum += 1;
                recycle = self.access((*recycle).next);
            }
        }
        sum
    }

    #[cfg(test)]
    pub(crate) fn freelist_is_empty(&self, index: usize) -> bool {
        self.freelist[index].is_null()
    }

    #[cfg(test)]
    pub(crate) fn btree_depth(&self) -> u32 {
        self.btree_depth
    }
}

unsafe fn insert_leaf(btp: *mut BtreePage, index: usize, first_page: usize, npages: usize) {
    debug_assert!((*btp).is_leaf());
    let nused = (*btp).hdr.nused;
    let keys = (*btp).keys.as_mut_ptr();
    ptr::copy(keys.add(index), keys.add(index + 1), nused - index);
    (*btp).keys[index] = BtreeKey {
        first_page,
        value: npages,
    };
    (*btp).hdr.nused += 1;
}

fn corrupt() -> DsaError {
    DsaError::Corrupted("free page manager btree is corrupt".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// A page-aligned buffer with the manager header in page 0.
    fn make_region(npages: usize) -> (Vec<u8>, *mut FreePageManager) {
        let mut buf = vec![0u8; (npages + 1) * FPM_PAGE_SIZE];
        let addr = buf.as_mut_ptr() as usize;
        let base = ((addr + FPM_PAGE_SIZE - 1) & !(FPM_PAGE_SIZE - 1)) as *mut u8;
        let fpm = base as *mut FreePageManager;
        unsafe { FreePageManager::initialize(fpm, base) };
        (buf, fpm)
    }

    #[test]
    fn coalesce_into_singleton() {
        let (_buf, fpm) = make_region(16);
        let fpm = unsafe { &mut *fpm };
        assert_eq!(fpm.put(4, 2).unwrap(), 2);
        assert_eq!(fpm.put(6, 3).unwrap(), 5);
        assert_eq!(fpm.put(2, 2).unwrap(), 7);
        assert_eq!(fpm.largest(), 7);
        for f in 0..FPM_NUM_FREELISTS {
            assert_eq!(fpm.freelist_is_empty(f), f != 6, "freelist {f}");
        }
        assert_eq!(fpm.btree_depth(), 0);
        assert!(fpm.dump().contains("singleton: 2(7)"));
    }

    #[test]
    fn fragmentation_builds_a_btree() {
        let (_buf, fpm) = make_region(64);
        let fpm = unsafe { &mut *fpm };
        fpm.put(1, 63).unwrap();
        let a = fpm.get(4).unwrap();
        let b = fpm.get(4).unwrap();
        assert_eq!((a, b), (1, 5));
        fpm.put(a, 4).unwrap();
        // Two runs now; one page went to the btree root.
        assert_eq!(fpm.btree_depth(), 1);
        assert_eq!(fpm.sum_free_pages(), 59);
        fpm.put(b, 4).unwrap();
        // Everything is contiguous again and the btree is gone.
        assert_eq!(fpm.btree_depth(), 0);
        assert_eq!(fpm.largest(), 63);
        assert_eq!(fpm.sum_free_pages(), 63);
    }

    #[test]
    fn best_fit_and_exhaustion() {
        let (_buf, fpm) = make_region(32);
        let fpm = unsafe { &mut *fpm };
        fpm.put(1, 31).unwrap();
        assert_eq!(fpm.get(32), None);
        let big = fpm.get(20).unwrap();
        assert_eq!(big, 1);
        assert_eq!(fpm.largest(), 11);
        assert_eq!(fpm.get(11), Some(21));
        assert_eq!(fpm.largest(), 0);
        assert_eq!(fpm.get(1), None);
    }

    #[test]
    fn many_fragments_split_leaves() {
        // Enough alternating holes to need more than one leaf page.
        let npages = 2 * ITEMS_PER_PAGE * 3;
        let (_buf, fpm) = make_region(npages + 1);
        let fpm = unsafe { &mut *fpm };
        fpm.put(1, npages).unwrap();
        let mut taken = Vec::new();
        while let Some(page) = fpm.get(1) {
            taken.push(page);
        }
        for &page in taken.iter().step_by(2) {
            fpm.put(page, 1).unwrap();
        }
        assert!(fpm.btree_depth() >= 2, "{}", fpm.dump());
        for &page in taken.iter().skip(1).step_by(2) {
            fpm.put(page, 1).unwrap();
        }
        // Every page is either free or holds btree bookkeeping.
        assert_eq!(fpm.sum_free_pages(), npages);
        assert!(!fpm.dump().contains("actual parent"));
        assert!(fpm.largest() > 1);
    }

    #[test]
    fn fuzz_against_model() {
        const NPAGES: usize = 256;
        bolero::check!()
            .with_type::<Vec<(bool, u8)>>()
            .for_each(|ops| {
                let (_buf, fpm) = make_region(NPAGES);
                let fpm = unsafe { &mut *fpm };
                fpm.put(1, NPAGES - 1).unwrap();
                let mut allocated: Vec<(usize, usize)> = Vec::new();
                for &(alloc, n) in ops {
                    if alloc || allocated.is_empty() {
                        let npages = (n as usize % 24) + 1;
                        let largest = fpm.largest();
                        match fpm.get(npages) {
                            Some(first) => {
                                assert!(npages <= largest);
                                allocated.push((first, npages));
                            }
                            None => assert!(npages > largest),
                        }
                    } else {
                        let (first, npages) = allocated.swap_remove(n as usize % allocated.len());
                        fpm.put(first, npages).unwrap();
                    }

                    // Allocations never overlap.
                    let mut seen = BTreeSet::new();
                    for &(first, npages) in &allocated {
                        for p in first..first + npages {
                            assert!(p >= 1 && p < NPAGES);
                            assert!(seen.insert(p));
                        }
                    }
                    let used: usize = allocated.iter().map(|(_, n)| n).sum();
                    assert_eq!(fpm.sum_free_pages() + used, NPAGES - 1);
                }
                for (first, npages) in allocated.drain(..) {
                    fpm.put(first, npages).unwrap();
                }
                assert_eq!(fpm.largest(), NPAGES - 1);
            });
    }
}
