// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hash table whose buckets, items and control block live in a
//! [`DsaArea`].
//!
//! # Layout
//!
//! ```text
//! control:  | handle | magic | partitions[128] | tranche | size_log2 | buckets |
//! buckets:  | DsaPointer; 1 << size_log2 |
//! item:     | next | hash | entry (key first) |
//! ```
//!
//! Each bucket is a singly linked list of items. The top 7 bits of a key's
//! hash pick one of 128 partitions and the top `size_log2` bits pick the
//! bucket, so every bucket belongs to exactly one partition. Each partition
//! has a lock guarding its buckets and a count of its items.
//!
//! Growing the table takes every partition lock, which is also why holding
//! any single partition lock is enough to read `size_log2` and `buckets`.

use crate::DshashError;
use core::cell::Cell;
use core::cmp::Ordering;
use core::fmt::Write as _;
use core::mem::size_of;
use core::ptr;
use libdd_dsa::{AllocFlags, DsaArea, DsaPointer, MAX_ALLOC_SIZE};
use libdd_dsm::{LwLock, LwLockGuard, LwLockMode};

pub const DSHASH_NUM_PARTITIONS_LOG2: usize = 7;
pub const DSHASH_NUM_PARTITIONS: usize = 1 << DSHASH_NUM_PARTITIONS_LOG2;

const DSHASH_MAGIC: u32 = 0x75ff_6a20;
const HASH_BITS: usize = u32::BITS as usize;

/// A table is identified by the [`DsaPointer`] of its control block.
pub type DshashHandle = DsaPointer;

pub type HashFunction = fn(key: &[u8]) -> u32;
pub type CompareFunction = fn(a: &[u8], b: &[u8]) -> Ordering;

/// Shape of a table. Every process attaching to a table must pass the same
/// parameters.
#[derive(Clone, Copy, Debug)]
pub struct DshashParameters {
    /// Leading bytes of an entry that form the key.
    pub key_size: usize,
    /// Whole entry, key included.
    pub entry_size: usize,
    pub hash_function: HashFunction,
    pub compare_function: CompareFunction,
    pub tranche_id: u32,
}

impl DshashParameters {
    /// Keys compared and hashed as raw bytes.
    pub fn memory(key_size: usize, entry_size: usize, tranche_id: u32) -> Self {
        DshashParameters {
            key_size,
            entry_size,
            hash_function: crate::memhash,
            compare_function: crate::memcmp,
            tranche_id,
        }
    }

    /// Keys holding NUL-terminated strings.
    pub fn string(key_size: usize, entry_size: usize, tranche_id: u32) -> Self {
        DshashParameters {
            key_size,
            entry_size,
            hash_function: crate::strhash,
            compare_function: crate::strcmp,
            tranche_id,
        }
    }

    fn validate(&self) -> Result<(), DshashError> {
        if self.key_size == 0 || self.key_size > self.entry_size {
            return Err(DshashError::Misuse(format!(
                "hash table key size {} must be between 1 and the entry size {}",
                self.key_size, self.entry_size
            )));
        }
        if self.entry_size > MAX_ALLOC_SIZE - ITEM_HEADER_SIZE {
            return Err(DshashError::Misuse(format!(
                "hash table entry size {} is too large",
                self.entry_size
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared structures
// ---------------------------------------------------------------------------

#[repr(C)]
struct Partition {
    lock: LwLock,
    /// Items in this partition's buckets.
    count: usize,
}

#[repr(C)]
struct Control {
    handle: DsaPointer,
    magic: u32,
    partitions: [Partition; DSHASH_NUM_PARTITIONS],
    lwlock_tranche_id: u32,
    /// Written only with every partition lock held.
    size_log2: usize,
    buckets: DsaPointer,
}

#[repr(C)]
struct Item {
    next: DsaPointer,
    hash: u32,
}

const ITEM_HEADER_SIZE: usize = (size_of::<Item>() + 7) & !7;

const _: () = assert!(ITEM_HEADER_SIZE == 16);

const fn num_splits(size_log2: usize) -> usize {
    size_log2 - DSHASH_NUM_PARTITIONS_LOG2
}

const fn buckets_per_partition(size_log2: usize) -> usize {
    1 << num_splits(size_log2)
}

/// Items a partition may hold before the table grows: a 75% load factor.
const fn max_count_per_partition(size_log2: usize) -> usize {
    buckets_per_partition(size_log2) / 2 + buckets_per_partition(size_log2) / 4
}

const fn partition_for_hash(hash: u32) -> usize {
    (hash >> (HASH_BITS - DSHASH_NUM_PARTITIONS_LOG2)) as usize
}

/// Each doubling reveals one more high bit of the hash, so a bucket splits
/// into two adjacent buckets of the same partition.
const fn bucket_index_for_hash(hash: u32, size_log2: usize) -> usize {
    (hash as u64 >> (HASH_BITS - size_log2)) as usize
}

const fn bucket_index_for_partition(partition: usize, size_log2: usize) -> usize {
    partition << num_splits(size_log2)
}

const fn partition_for_bucket_index(bucket: usize, size_log2: usize) -> usize {
    bucket >> num_splits(size_log2)
}

fn bucket_array_flags(size_log2: usize) -> AllocFlags {
    if size_of::<DsaPointer>() << size_log2 > MAX_ALLOC_SIZE {
        AllocFlags::ZERO | AllocFlags::HUGE
    } else {
        AllocFlags::ZERO
    }
}

// ---------------------------------------------------------------------------
// DsHash
// ---------------------------------------------------------------------------

/// This process's handle on a shared hash table.
///
/// Handles are cheap; each thread attaches its own. Dropping one detaches
/// without touching the table.
pub struct DsHash<'a> {
    area: &'a DsaArea,
    params: DshashParameters,
    control: *mut Control,
    /// Local copies of the control's bucket array, refreshed whenever a
    /// partition lock is taken and `size_log2` has moved on.
    buckets: Cell<*mut DsaPointer>,
    size_log2: Cell<usize>,
}

// SAFETY: the control block is shared memory guarded by partition locks; the
// cached pointers only refer to that memory.
unsafe impl Send for DsHash<'_> {}

impl<'a> DsHash<'a> {
    pub fn create(area: &'a DsaArea, params: DshashParameters) -> Result<Self, DshashError> {
        params.validate()?;
        let control_pointer = area.allocate(size_of::<Control>())?;
        let nbuckets = DSHASH_NUM_PARTITIONS;
        let buckets = area.allocate_extended(
            size_of::<DsaPointer>() * nbuckets,
            AllocFlags::NO_OOM | AllocFlags::ZERO,
        )?;
        if buckets.is_null() {
            area.free(control_pointer)?;
            return Err(DshashError::Dsa(libdd_dsa::DsaError::OutOfMemory {
                requested: size_of::<DsaPointer>() * nbuckets,
            }));
        }

        let control = area.get_address(control_pointer)?.cast::<Control>();
        // SAFETY: freshly allocated and large enough for a control block.
        unsafe {
            control.write(Control {
                handle: control_pointer,
                magic: DSHASH_MAGIC,
                partitions: core::array::from_fn(|_| Partition {
                    lock: LwLock::new(params.tranche_id),
                    count: 0,
                }),
                lwlock_tranche_id: params.tranche_id,
                size_log2: DSHASH_NUM_PARTITIONS_LOG2,
                buckets,
            });
        }
        tracing::debug!(handle = %control_pointer, "created shared hash table");
        Ok(DsHash {
            area,
            params,
            control,
            buckets: Cell::new(area.get_address(buckets)?.cast()),
            size_log2: Cell::new(DSHASH_NUM_PARTITIONS_LOG2),
        })
    }

    pub fn attach(
        area: &'a DsaArea,
        params: DshashParameters,
        handle: DshashHandle,
    ) -> Result<Self, DshashError> {
        params.validate()?;
        let control = area.get_address(handle)?.cast::<Control>();
        if control.is_null() {
            return Err(DshashError::Misuse(
                "cannot attach to a null hash table handle".to_owned(),
            ));
        }
        // SAFETY: magic and handle are written once at creation.
        unsafe {
            if (*control).magic != DSHASH_MAGIC || (*control).handle != handle {
                return Err(DshashError::Corrupted(format!(
                    "no hash table found at {handle:?}"
                )));
            }
        }
        Ok(DsHash {
            area,
            params,
            control,
            buckets: Cell::new(ptr::null_mut()),
            size_log2: Cell::new(0),
        })
    }

    pub fn handle(&self) -> DshashHandle {
        // SAFETY: immutable after creation.
        unsafe { (*self.control).handle }
    }

    pub fn params(&self) -> &DshashParameters {
        &self.params
    }

    /// Frees every item and the table itself. No other process may use the
    /// table afterwards.
    pub fn destroy(self) -> Result<(), DshashError> {
        let guards = self.lock_all(LwLockMode::Exclusive);
        self.ensure_valid_bucket_pointers()?;
        let size = 1usize << self.size_log2.get();
        for index in 0..size {
            // SAFETY: every partition lock is held.
            let mut item_pointer = unsafe { self.buckets.get().add(index).read() };
            while !item_pointer.is_null() {
                let item = self.item(item_pointer)?;
                // SAFETY: the item stays allocated until the free below.
                let next = unsafe { (*item).next };
                self.area.free(item_pointer)?;
                item_pointer = next;
            }
        }
        // SAFETY: as above.
        let control = self.control;
        let (buckets, handle) = unsafe {
            (*control).magic = 0;
            ((*control).buckets, (*control).handle)
        };
        drop(guards);
        self.area.free(buckets)?;
        self.area.free(handle)?;
        tracing::debug!(%handle, "destroyed shared hash table");
        Ok(())
    }

    /// Looks `key` up, locking its partition in shared or exclusive mode.
    /// The lock is held until the returned entry is dropped; the caller must
    /// not look up anything else in the meantime.
    pub fn find(
        &self,
        key: &[u8],
        exclusive: bool,
    ) -> Result<Option<DshashEntry<'_, 'a>>, DshashError> {
        let key = self.key(key)?;
        let hash = (self.params.hash_function)(key);
        let partition = partition_for_hash(hash);
        let mode = if exclusive {
            LwLockMode::Exclusive
        } else {
            LwLockMode::Shared
        };
        let guard = self.partition_lock(partition).acquire(mode);
        self.ensure_valid_bucket_pointers()?;
        let bucket = self.bucket_for_hash(hash);
        // SAFETY: the partition lock is held.
        let head = unsafe { bucket.read() };
        match self.find_in_bucket(key, head)? {
            Some((item_pointer, item)) => Ok(Some(DshashEntry {
                table: self,
                item_pointer,
                item,
                guard,
            })),
            None => Ok(None),
        }
    }

    /// Looks `key` up in exclusive mode, inserting an entry for it if it is
    /// missing. Returns the entry and whether it already existed. A new
    /// entry holds the key followed by zeroes.
    pub fn find_or_insert(&self, key: &[u8]) -> Result<(DshashEntry<'_, 'a>, bool), DshashError> {
        let key = self.key(key)?;
        let hash = (self.params.hash_function)(key);
        let partition_index = partition_for_hash(hash);

        loop {
            let guard = self.partition_lock(partition_index).write();
            self.ensure_valid_bucket_pointers()?;
            let bucket = self.bucket_for_hash(hash);
            // SAFETY: the partition lock is held.
            let head = unsafe { bucket.read() };
            if let Some((item_pointer, item)) = self.find_in_bucket(key, head)? {
                let entry = DshashEntry {
                    table: self,
                    item_pointer,
                    item,
                    guard,
                };
                return Ok((entry, true));
            }

            // SAFETY: the partition lock is held.
            let count = unsafe { (*self.partition(partition_index)).count };
            if count > max_count_per_partition(self.size_log2.get()) {
                // Growing takes every partition lock, ours included.
                drop(guard);
                self.resize(self.size_log2.get() + 1)?;
                continue;
            }

            let item_pointer = self
                .area
                .allocate_zeroed(ITEM_HEADER_SIZE + self.params.entry_size)?;
            let item = self.item(item_pointer)?;
            // SAFETY: the new item is ours; the bucket and count are
            // protected by the partition lock.
            unsafe {
                entry_of(item).copy_from_nonoverlapping(key.as_ptr(), key.len());
                item.write(Item {
                    next: bucket.read(),
                    hash,
                });
                bucket.write(item_pointer);
                (*self.partition(partition_index)).count += 1;
            }
            let entry = DshashEntry {
                table: self,
                item_pointer,
                item,
                guard,
            };
            return Ok((entry, false));
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete_key(&self, key: &[u8]) -> Result<bool, DshashError> {
        let key = self.key(key)?;
        let hash = (self.params.hash_function)(key);
        let partition = partition_for_hash(hash);

        let _guard = self.partition_lock(partition).write();
        self.ensure_valid_bucket_pointers()?;
        let mut link = self.bucket_for_hash(hash);
        // SAFETY: the bucket chain is protected by the partition lock.
        unsafe {
            while !link.read().is_null() {
                let item_pointer = link.read();
                let item = self.item(item_pointer)?;
                if self.equal_keys(key, item) {
                    link.write((*item).next);
                    self.area.free(item_pointer)?;
                    self.decrement_count(partition)?;
                    return Ok(true);
                }
                link = ptr::addr_of_mut!((*item).next);
            }
        }
        Ok(false)
    }

    /// Describes the table's size and per-partition, per-bucket item
    /// counts.
    pub fn dump(&self) -> Result<String, DshashError> {
        let _guards = self.lock_all(LwLockMode::Shared);
        self.ensure_valid_bucket_pointers()?;
        let size_log2 = self.size_log2.get();
        let mut out = String::new();
        let _ = writeln!(out, "hash table size = {}", 1usize << size_log2);
        for partition in 0..DSHASH_NUM_PARTITIONS {
            // SAFETY: every partition lock is held.
            let count = unsafe { (*self.partition(partition)).count };
            let _ = writeln!(out, "  partition {partition}");
            let _ = writeln!(out, "    active buckets (key count = {count})");
            let begin = bucket_index_for_partition(partition, size_log2);
            let end = bucket_index_for_partition(partition + 1, size_log2);
            for bucket in begin..end {
                let mut keys = 0;
                // SAFETY: as above.
                let mut item_pointer = unsafe { self.buckets.get().add(bucket).read() };
                while !item_pointer.is_null() {
                    // SAFETY: as above.
                    item_pointer = unsafe { (*self.item(item_pointer)?).next };
                    keys += 1;
                }
                let _ = writeln!(out, "      bucket {bucket} (key count = {keys})");
            }
        }
        Ok(out)
    }

    /// Starts a scan over every entry. The scan holds one partition lock at
    /// a time, in `exclusive` mode if entries are to be modified or deleted.
    pub fn seq_scan(&self, exclusive: bool) -> SeqScan<'_, 'a> {
        SeqScan {
            table: self,
            mode: if exclusive {
                LwLockMode::Exclusive
            } else {
                LwLockMode::Shared
            },
            guard: None,
            partition: 0,
            bucket: 0,
            nbuckets: 0,
            next_item: DsaPointer::NULL,
            current: None,
            started: false,
        }
    }

    fn key<'k>(&self, key: &'k [u8]) -> Result<&'k [u8], DshashError> {
        key.get(..self.params.key_size).ok_or_else(|| {
            DshashError::Misuse(format!(
                "hash table key has {} bytes, expected {}",
                key.len(),
                self.params.key_size
            ))
        })
    }

    fn partition(&self, index: usize) -> *mut Partition {
        // SAFETY: in bounds of the control block.
        unsafe { ptr::addr_of_mut!((*self.control).partitions[index]) }
    }

    fn partition_lock(&self, index: usize) -> &LwLock {
        // SAFETY: the control block outlives this handle; the lock is only
        // touched through atomics.
        unsafe { &(*self.partition(index)).lock }
    }

    fn lock_all(&self, mode: LwLockMode) -> Vec<LwLockGuard<'_>> {
        (0..DSHASH_NUM_PARTITIONS)
            .map(|i| self.partition_lock(i).acquire(mode))
            .collect()
    }

    fn decrement_count(&self, partition: usize) -> Result<(), DshashError> {
        // SAFETY: called with the partition lock held.
        unsafe {
            let count = &mut (*self.partition(partition)).count;
            *count = count.checked_sub(1).ok_or_else(|| {
                DshashError::Corrupted(format!("partition {partition} item count underflow"))
            })?;
        }
        Ok(())
    }

    /// Refreshes the cached bucket array if the table grew. Must be called
    /// with at least one partition lock held.
    fn ensure_valid_bucket_pointers(&self) -> Result<(), DshashError> {
        // SAFETY: a partition lock keeps these from changing.
        let (size_log2, buckets) = unsafe { ((*self.control).size_log2, (*self.control).buckets) };
        if self.size_log2.get() != size_log2 {
            self.buckets.set(self.area.get_address(buckets)?.cast());
            self.size_log2.set(size_log2);
        }
        Ok(())
    }

    fn bucket_for_hash(&self, hash: u32) -> *mut DsaPointer {
        self.buckets
            .get()
            .wrapping_add(bucket_index_for_hash(hash, self.size_log2.get()))
    }

    fn item(&self, item_pointer: DsaPointer) -> Result<*mut Item, DshashError> {
        Ok(self.area.get_address(item_pointer)?.cast())
    }

    /// # Safety
    /// `item` must be a live item of this table.
    unsafe fn equal_keys(&self, key: &[u8], item: *mut Item) -> bool {
        let stored = core::slice::from_raw_parts(entry_of(item), self.params.key_size);
        (self.params.compare_function)(key, stored) == Ordering::Equal
    }

    fn find_in_bucket(
        &self,
        key: &[u8],
        mut item_pointer: DsaPointer,
    ) -> Result<Option<(DsaPointer, *mut Item)>, DshashError> {
        while !item_pointer.is_null() {
            let item = self.item(item_pointer)?;
            // SAFETY: the caller holds the partition lock of this bucket.
            unsafe {
                if self.equal_keys(key, item) {
                    return Ok(Some((item_pointer, item)));
                }
                item_pointer = (*item).next;
            }
        }
        Ok(None)
    }

    /// Unlinks and frees `item`. Must be called with its partition lock held
    /// exclusively.
    fn delete_item(&self, item_pointer: DsaPointer, item: *mut Item) -> Result<(), DshashError> {
        // SAFETY: the partition lock is held exclusively.
        unsafe {
            let hash = (*item).hash;
            let mut link = self.bucket_for_hash(hash);
            while !link.read().is_null() {
                let current = link.read();
                if current == item_pointer {
                    link.write((*item).next);
                    self.area.free(item_pointer)?;
                    return self.decrement_count(partition_for_hash(hash));
                }
                link = ptr::addr_of_mut!((*self.item(current)?).next);
            }
        }
        Err(DshashError::Corrupted(format!(
            "item {item_pointer:?} is not in its bucket"
        )))
    }

    /// Doubles the bucket array, unless another process already grew the
    /// table to at least `new_size_log2`.
    fn resize(&self, new_size_log2: usize) -> Result<(), DshashError> {
        let mut guards = Vec::with_capacity(DSHASH_NUM_PARTITIONS);
        for i in 0..DSHASH_NUM_PARTITIONS {
            guards.push(self.partition_lock(i).write());
            // SAFETY: partition 0 is locked.
            if i == 0 && unsafe { (*self.control).size_log2 } >= new_size_log2 {
                // Someone else's resize covers ours.
                return Ok(());
            }
        }
        self.ensure_valid_bucket_pointers()?;
        let old_size_log2 = self.size_log2.get();

        let new_size = 1usize << new_size_log2;
        let new_buckets_pointer = self.area.allocate_extended(
            size_of::<DsaPointer>() * new_size,
            bucket_array_flags(new_size_log2),
        )?;
        let new_buckets = self.area.get_address(new_buckets_pointer)?.cast::<DsaPointer>();

        // SAFETY: every partition lock is held; the new array has new_size
        // slots.
        unsafe {
            for index in 0..1usize << old_size_log2 {
                let mut item_pointer = self.buckets.get().add(index).read();
                while !item_pointer.is_null() {
                    let item = self.item(item_pointer)?;
                    let next = (*item).next;
                    let bucket = new_buckets.add(bucket_index_for_hash((*item).hash, new_size_log2));
                    (*item).next = bucket.read();
                    bucket.write(item_pointer);
                    item_pointer = next;
                }
            }

            let old_buckets = (*self.control).buckets;
            (*self.control).buckets = new_buckets_pointer;
            (*self.control).size_log2 = new_size_log2;
            self.buckets.set(new_buckets);
            self.size_log2.set(new_size_log2);
            self.area.free(old_buckets)?;
        }
        tracing::debug!(
            handle = %self.handle(),
            size_log2 = new_size_log2,
            "grew shared hash table"
        );
        Ok(())
    }

    #[cfg(test)]
    fn current_size_log2(&self) -> usize {
        let _guard = self.partition_lock(0).read();
        // SAFETY: partition 0 is locked.
        unsafe { (*self.control).size_log2 }
    }
}

/// Entry bytes following the item header.
fn entry_of(item: *mut Item) -> *mut u8 {
    item.cast::<u8>().wrapping_add(ITEM_HEADER_SIZE)
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// An entry found in or inserted into a [`DsHash`], with its partition lock
/// held until drop.
pub struct DshashEntry<'t, 'a> {
    table: &'t DsHash<'a>,
    item_pointer: DsaPointer,
    item: *mut Item,
    guard: LwLockGuard<'t>,
}

impl DshashEntry<'_, '_> {
    /// The whole entry, key first.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the partition lock keeps the item alive and stable.
        unsafe { core::slice::from_raw_parts(entry_of(self.item), self.table.params.entry_size) }
    }

    pub fn key(&self) -> &[u8] {
        &self.bytes()[..self.table.params.key_size]
    }

    /// Mutable access to the entry, available when the partition is locked
    /// exclusively. The key must not be changed.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.guard.mode() != LwLockMode::Exclusive {
            return None;
        }
        // SAFETY: the partition lock is held exclusively.
        Some(unsafe {
            core::slice::from_raw_parts_mut(entry_of(self.item), self.table.params.entry_size)
        })
    }

    /// Location of the item in the area.
    pub fn pointer(&self) -> DsaPointer {
        self.item_pointer
    }

    pub fn hash(&self) -> u32 {
        // SAFETY: the partition lock keeps the item alive.
        unsafe { (*self.item).hash }
    }

    /// Removes the entry from the table and releases its partition lock.
    pub fn delete(self) -> Result<(), DshashError> {
        if self.guard.mode() != LwLockMode::Exclusive {
            return Err(DshashError::Misuse(
                "cannot delete an entry found in shared mode".to_owned(),
            ));
        }
        self.table.delete_item(self.item_pointer, self.item)
    }

    /// Releases the partition lock.
    pub fn release(self) {}
}

// ---------------------------------------------------------------------------
// Sequential scan
// ---------------------------------------------------------------------------

/// Walks every entry of a table, partition by partition. The next
/// partition's lock is taken before the current one is released, so the
/// table cannot grow while the scan is in progress.
pub struct SeqScan<'t, 'a> {
    table: &'t DsHash<'a>,
    mode: LwLockMode,
    guard: Option<LwLockGuard<'t>>,
    partition: usize,
    bucket: usize,
    nbuckets: usize,
    next_item: DsaPointer,
    current: Option<(DsaPointer, *mut Item)>,
    started: bool,
}

impl SeqScan<'_, '_> {
    /// Moves to the next entry and returns it, or `None` once every entry
    /// has been seen.
    pub fn next(&mut self) -> Result<Option<&[u8]>, DshashError> {
        let table = self.table;
        let mut item_pointer = if !self.started {
            self.started = true;
            self.partition = 0;
            self.bucket = 0;
            self.guard = Some(table.partition_lock(0).acquire(self.mode));
            table.ensure_valid_bucket_pointers()?;
            self.nbuckets = 1 << table.size_log2.get();
            // SAFETY: partition 0 is locked.
            unsafe { table.buckets.get().read() }
        } else if self.guard.is_none() {
            return Ok(None);
        } else {
            self.next_item
        };

        while item_pointer.is_null() {
            self.bucket += 1;
            if self.bucket >= self.nbuckets {
                self.guard = None;
                self.current = None;
                return Ok(None);
            }
            let partition = partition_for_bucket_index(self.bucket, table.size_log2.get());
            if partition != self.partition {
                let next_guard = table.partition_lock(partition).acquire(self.mode);
                self.guard = Some(next_guard);
                self.partition = partition;
            }
            // SAFETY: the bucket's partition is locked.
            item_pointer = unsafe { table.buckets.get().add(self.bucket).read() };
        }

        let item = table.item(item_pointer)?;
        // SAFETY: as above.
        self.next_item = unsafe { (*item).next };
        self.current = Some((item_pointer, item));
        // SAFETY: as above.
        Ok(Some(unsafe {
            core::slice::from_raw_parts(entry_of(item), table.params.entry_size)
        }))
    }

    /// Mutable access to the entry last returned by [`SeqScan::next`], in an
    /// exclusive scan.
    pub fn current_mut(&mut self) -> Option<&mut [u8]> {
        if self.mode != LwLockMode::Exclusive {
            return None;
        }
        let (_, item) = self.current?;
        // SAFETY: the partition lock is held exclusively.
        Some(unsafe {
            core::slice::from_raw_parts_mut(entry_of(item), self.table.params.entry_size)
        })
    }

    /// Deletes the entry last returned by [`SeqScan::next`].
    pub fn delete_current(&mut self) -> Result<(), DshashError> {
        if self.mode != LwLockMode::Exclusive {
            return Err(DshashError::Misuse(
                "cannot delete during a shared sequential scan".to_owned(),
            ));
        }
        let Some((item_pointer, item)) = self.current.take() else {
            return Err(DshashError::Misuse(
                "no current entry to delete".to_owned(),
            ));
        };
        self.table.delete_item(item_pointer, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_dsa::DsaConfig;
    use libdd_dsm::{Dsm, DsmConfig, DsmImpl};
    use std::collections::BTreeMap;

    fn session(dir: &tempfile::TempDir) -> Dsm {
        Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir.path())).unwrap()
    }

    /// Keys are big-endian u32s that serve as their own hash.
    fn identity_hash(key: &[u8]) -> u32 {
        u32::from_be_bytes([key[0], key[1], key[2], key[3]])
    }

    fn identity_params() -> DshashParameters {
        DshashParameters {
            key_size: 4,
            entry_size: 16,
            hash_function: identity_hash,
            compare_function: crate::memcmp,
            tranche_id: 0,
        }
    }

    #[test]
    fn bucket_math() {
        assert_eq!(partition_for_hash(u32::MAX), DSHASH_NUM_PARTITIONS - 1);
        assert_eq!(partition_for_hash(1 << 25), 1);
        assert_eq!(bucket_index_for_hash(1 << 24, 8), 1);
        assert_eq!(bucket_index_for_hash(1 << 24, 7), 0);
        assert_eq!(max_count_per_partition(7), 0);
        assert_eq!(max_count_per_partition(9), 3);
        assert_eq!(partition_for_bucket_index(bucket_index_for_partition(5, 10), 10), 5);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_find_delete() {
        let dir = tempfile::tempdir().unwrap();
        let dsm = session(&dir);
        let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();
        let table = DsHash::create(&area, DshashParameters::memory(8, 24, 0)).unwrap();

        for i in 0u64..1000 {
            let (mut entry, found) = table.find_or_insert(&i.to_le_bytes()).unwrap();
            assert!(!found);
            entry.bytes_mut().unwrap()[8..16].copy_from_slice(&(i * 3).to_le_bytes());
        }
        let (entry, found) = table.find_or_insert(&7u64.to_le_bytes()).unwrap();
        assert!(found);
        drop(entry);

        for i in 0u64..1000 {
            let mut entry = table.find(&i.to_le_bytes(), false).unwrap().unwrap();
            assert_eq!(entry.key(), i.to_le_bytes());
            assert_eq!(entry.bytes()[8..16], (i * 3).to_le_bytes());
            assert!(entry.bytes_mut().is_none());
        }
        assert!(table.find(&5000u64.to_le_bytes(), true).unwrap().is_none());

        assert!(table.delete_key(&10u64.to_le_bytes()).unwrap());
        assert!(!table.delete_key(&10u64.to_le_bytes()).unwrap());
        let entry = table.find(&11u64.to_le_bytes(), false).unwrap().unwrap();
        assert!(matches!(entry.delete(), Err(DshashError::Misuse(_))));
        let entry = table.find(&11u64.to_le_bytes(), true).unwrap().unwrap();
        entry.delete().unwrap();
        assert!(table.find(&11u64.to_le_bytes(), false).unwrap().is_none());

        assert!(matches!(table.find(&[1, 2], false), Err(DshashError::Misuse(_))));
        table.destroy().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn one_partition_growth() {
        let dir = tempfile::tempdir().unwrap();
        let dsm = session(&dir);
        let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();
        let table = DsHash::create(&area, identity_params()).unwrap();
        assert_eq!(table.current_size_log2(), 7);

        // Spread over partition 0's bucket range at every size.
        let hashes: Vec<u32> = (0..97u32).map(|i| i.wrapping_mul(0x0002_9a5f) & 0x01ff_ffff).collect();
        table.find_or_insert(&hashes[0].to_be_bytes()).unwrap();
        assert_eq!(table.current_size_log2(), 7);
        // One bucket per partition allows no second item.
        table.find_or_insert(&hashes[1].to_be_bytes()).unwrap();
        assert_eq!(table.current_size_log2(), 8);

        for h in &hashes[2..] {
            let (_, found) = table.find_or_insert(&h.to_be_bytes()).unwrap();
            assert!(!found);
        }
        let size_log2 = table.current_size_log2();
        assert!(max_count_per_partition(size_log2) >= 96);
        assert!(max_count_per_partition(size_log2 - 1) < 96);
        // SAFETY: test is single threaded.
        assert_eq!(unsafe { (*table.partition(0)).count }, 97);

        for h in &hashes {
            let entry = table.find(&h.to_be_bytes(), false).unwrap().unwrap();
            assert_eq!(entry.hash(), *h);
            // The item sits in the bucket named by the top size_log2 bits.
            let bucket = unsafe { table.buckets.get().add(bucket_index_for_hash(*h, size_log2)) };
            let mut p = unsafe { bucket.read() };
            let mut seen = false;
            while !p.is_null() {
                seen |= p == entry.pointer();
                p = unsafe { (*table.item(p).unwrap()).next };
            }
            assert!(seen);
        }
        assert!(table
            .dump()
            .unwrap()
            .contains(&format!("hash table size = {}", 1usize << size_log2)));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn seq_scan_visits_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let dsm = session(&dir);
        let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();
        let table = DsHash::create(&area, DshashParameters::memory(4, 8, 0)).unwrap();
        for i in 0u32..500 {
            let (mut entry, _) = table.find_or_insert(&i.to_le_bytes()).unwrap();
            entry.bytes_mut().unwrap()[4..].copy_from_slice(&i.to_le_bytes());
        }

        let mut scan = table.seq_scan(false);
        let mut seen = Vec::new();
        while let Some(entry) = scan.next().unwrap() {
            seen.push(u32::from_le_bytes(entry[..4].try_into().unwrap()));
        }
        assert!(scan.next().unwrap().is_none());
        assert!(matches!(scan.delete_current(), Err(DshashError::Misuse(_))));
        drop(scan);
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());

        let mut scan = table.seq_scan(true);
        while let Some(entry) = scan.next().unwrap() {
            let key = u32::from_le_bytes(entry[..4].try_into().unwrap());
            if key % 2 == 0 {
                scan.delete_current().unwrap();
            } else {
                scan.current_mut().unwrap()[4..].copy_from_slice(&(key + 1).to_le_bytes());
            }
        }
        drop(scan);
        for i in 0u32..500 {
            let entry = table.find(&i.to_le_bytes(), false).unwrap();
            match entry {
                Some(entry) => {
                    assert_eq!(i % 2, 1);
                    assert_eq!(entry.bytes()[4..], (i + 1).to_le_bytes());
                }
                None => assert_eq!(i % 2, 0),
            }
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn fuzz_against_btreemap() {
        let dir = tempfile::tempdir().unwrap();
        let dsm = session(&dir);
        let area = DsaArea::create(&dsm, DsaConfig::default()).unwrap();
        let area = std::panic::AssertUnwindSafe(&area);
        bolero::check!()
            .with_type::<Vec<(bool, u16, u32)>>()
            .for_each(|ops| {
                let table = DsHash::create(&area, DshashParameters::memory(2, 8, 0)).unwrap();
                let mut model = BTreeMap::new();
                for &(insert, key, value) in ops {
                    if insert {
                        let (mut entry, found) = table.find_or_insert(&key.to_le_bytes()).unwrap();
                        assert_eq!(found, model.contains_key(&key));
                        entry.bytes_mut().unwrap()[4..].copy_from_slice(&value.to_le_bytes());
                        model.insert(key, value);
                    } else {
                        assert_eq!(
                            table.delete_key(&key.to_le_bytes()).unwrap(),
                            model.remove(&key).is_some()
                        );
                    }
                }
                for (key, value) in &model {
                    let entry = table.find(&key.to_le_bytes(), false).unwrap().unwrap();
                    assert_eq!(entry.bytes()[4..], value.to_le_bytes());
                }
                let mut scan = table.seq_scan(false);
                let mut count = 0;
                while scan.next().unwrap().is_some() {
                    count += 1;
                }
                drop(scan);
                assert_eq!(count, model.len());
                table.destroy().unwrap();
            });
    }
}
