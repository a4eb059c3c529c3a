// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trees in a DSA area, shared by every process attached to it.
//!
//! The control block and every node live in the area and refer to each
//! other by arena pointer. One reader/writer lock in the control block
//! protects the whole tree; it is taken through [`SharedRadixTree::lock_share`]
//! and [`SharedRadixTree::lock_exclusive`] and released when the guard is
//! dropped.

use crate::iter::Iter;
use crate::memory::{NodeMemory, SharedMemory};
use crate::node::INVALID_CHILD;
use crate::tree::{Control, RadixTree, RadixTreeHandle, RadixTreeStats, RADIX_TREE_MAGIC};
use crate::value::TreeValue;
use crate::RadixTreeError;
use core::fmt;
use core::mem::size_of;
use core::ops::Deref;
use core::ptr::NonNull;
use libdd_dsa::DsaArea;
use libdd_dsm::LwLockGuard;

pub type SharedRadixTree<'a, V> = RadixTree<V, SharedMemory<'a>>;

impl<'a, V: TreeValue> RadixTree<V, SharedMemory<'a>> {
    /// Creates an empty tree in `area`. The tree lock is reported under
    /// `tranche_id`.
    pub fn create(area: &'a DsaArea, tranche_id: u32) -> Result<Self, RadixTreeError> {
        let handle = area.allocate_zeroed(size_of::<Control>())?;
        let control = match NonNull::new(area.get_address(handle)?.cast::<Control>()) {
            Some(control) => control,
            None => {
                area.free(handle)?;
                return Err(RadixTreeError::Corrupted(format!(
                    "control block at {handle:?} does not resolve"
                )));
            }
        };
        // SAFETY: freshly allocated and large enough for a control block.
        unsafe { control.as_ptr().write(Control::new(handle, tranche_id)) };
        let tree = Self::from_parts(SharedMemory::new(area), control);
        // SAFETY: nobody else knows the handle yet.
        if let Err(err) = unsafe { tree.init_root() } {
            area.free(handle)?;
            return Err(err);
        }
        tracing::debug!(%handle, tranche_id, "created shared radix tree");
        Ok(tree)
    }

    /// Attaches to a tree created, possibly by another process, in `area`.
    pub fn attach(area: &'a DsaArea, handle: RadixTreeHandle) -> Result<Self, RadixTreeError> {
        if handle.is_null() {
            return Err(RadixTreeError::Corrupted(
                "cannot attach to a null radix tree handle".into(),
            ));
        }
        let control = NonNull::new(area.get_address(handle)?.cast::<Control>()).ok_or_else(|| {
            RadixTreeError::Corrupted(format!("no radix tree found at {handle:?}"))
        })?;
        // SAFETY: magic and handle are written once at creation.
        unsafe {
            let ctl = control.as_ptr();
            if (*ctl).magic != RADIX_TREE_MAGIC || (*ctl).handle != handle {
                return Err(RadixTreeError::Corrupted(format!(
                    "no radix tree found at {handle:?}"
                )));
            }
        }
        tracing::debug!(%handle, "attached to shared radix tree");
        Ok(Self::from_parts(SharedMemory::new(area), control))
    }

    pub fn handle(&self) -> RadixTreeHandle {
        // SAFETY: immutable after creation.
        unsafe { (*self.ctl()).handle }
    }

    pub fn area(&self) -> &'a DsaArea {
        self.memory.area()
    }

    /// Frees every node, leaf and the control block. No other process may
    /// use the tree afterwards.
    pub fn free(self) -> Result<(), RadixTreeError> {
        let ctl = self.ctl();
        // SAFETY: the exclusive lock is held while the nodes go away.
        let handle = unsafe {
            let _guard = (*ctl).lock.write();
            self.free_recurse((*ctl).root, (*ctl).start_shift)?;
            (*ctl).root = INVALID_CHILD;
            (*ctl).magic = 0;
            (*ctl).handle
        };
        self.memory.area().free(handle)?;
        tracing::debug!(%handle, "freed shared radix tree");
        Ok(())
    }

    pub fn lock_share(&self) -> TreeReadGuard<'_, V, SharedMemory<'a>> {
        // SAFETY: the control block outlives every handle to the tree.
        let guard = unsafe { (*self.ctl()).lock.read() };
        TreeReadGuard {
            tree: self,
            _guard: guard,
        }
    }

    pub fn lock_exclusive(&self) -> TreeWriteGuard<'_, V, SharedMemory<'a>> {
        // SAFETY: as above.
        let guard = unsafe { (*self.ctl()).lock.write() };
        TreeWriteGuard {
            read: TreeReadGuard {
                tree: self,
                _guard: guard,
            },
        }
    }
}

impl<V: TreeValue> fmt::Debug for RadixTree<V, SharedMemory<'_>> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRadixTree")
            .field("handle", &self.handle())
            .finish_non_exhaustive()
    }
}

// SAFETY: every access to the shared state goes through the tree lock, and
// the area itself is `Sync`.
unsafe impl<V: TreeValue + Send + Sync> Send for RadixTree<V, SharedMemory<'_>> {}
// SAFETY: as above.
unsafe impl<V: TreeValue + Send + Sync> Sync for RadixTree<V, SharedMemory<'_>> {}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Shared access to a tree. Readers in any process may hold one at the same
/// time.
pub struct TreeReadGuard<'g, V: TreeValue, M: NodeMemory> {
    tree: &'g RadixTree<V, M>,
    _guard: LwLockGuard<'g>,
}

impl<'g, V: TreeValue, M: NodeMemory> TreeReadGuard<'g, V, M> {
    pub fn find(&self, key: u64) -> Result<Option<&V>, RadixTreeError> {
        // SAFETY: the lock is held for as long as the value is borrowed.
        unsafe { Ok(self.tree.find_inner(key)?.map(|value| &*value.as_ptr())) }
    }

    pub fn iter(&self) -> Iter<'_, V, M> {
        Iter::new(self.tree)
    }

    pub fn num_keys(&self) -> u64 {
        // SAFETY: the lock is held.
        unsafe { (*self.tree.ctl()).num_keys }
    }

    pub fn stats(&self) -> RadixTreeStats {
        // SAFETY: the lock is held.
        unsafe { self.tree.stats_inner() }
    }

    pub fn dump(&self) -> Result<String, RadixTreeError> {
        // SAFETY: the lock is held.
        unsafe { self.tree.dump_inner() }
    }

    pub fn verify(&self) -> Result<(), RadixTreeError> {
        // SAFETY: the lock is held.
        unsafe { self.tree.verify_inner() }
    }
}

impl<'g, V: TreeValue, M: NodeMemory> TreeReadGuard<'g, V, M> {
    /// Iterates while holding on to the lock, for callers that keep the
    /// iterator without its guard.
    pub fn into_locked_iter(self) -> LockedIter<'g, V, M> {
        LockedIter {
            iter: Iter::new(self.tree),
            _guard: self._guard,
        }
    }
}

/// An [`Iter`] owning the shared lock. Entries borrow the iterator, so none
/// outlive the lock.
pub struct LockedIter<'g, V: TreeValue, M: NodeMemory> {
    iter: Iter<'g, V, M>,
    _guard: LwLockGuard<'g>,
}

impl<V: TreeValue, M: NodeMemory> LockedIter<'_, V, M> {
    pub fn next_entry(&mut self) -> Option<Result<(u64, &V), RadixTreeError>> {
        self.iter.next()
    }
}

/// Exclusive access to a tree.
pub struct TreeWriteGuard<'g, V: TreeValue, M: NodeMemory> {
    read: TreeReadGuard<'g, V, M>,
}

impl<'g, V: TreeValue, M: NodeMemory> TreeWriteGuard<'g, V, M> {
    /// Stores a copy of `value` under `key`. Returns whether the key was
    /// already present.
    pub fn set(&mut self, key: u64, value: &V) -> Result<bool, RadixTreeError> {
        // SAFETY: the exclusive lock is held and `&mut self` rules out
        // outstanding borrows of values.
        unsafe { self.read.tree.set_inner(key, value) }
    }

    pub fn delete(&mut self, key: u64) -> Result<bool, RadixTreeError> {
        // SAFETY: as above.
        unsafe { self.read.tree.delete_inner(key) }
    }
}

impl<'g, V: TreeValue, M: NodeMemory> Deref for TreeWriteGuard<'g, V, M> {
    type Target = TreeReadGuard<'g, V, M>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libdd_dsa::{DsaConfig, DsaPointer};
    use libdd_dsm::{Dsm, DsmConfig, DsmImpl};

    fn area(dir: &tempfile::TempDir) -> (Dsm, DsaConfig) {
        let dsm = Dsm::new(DsmConfig::new(DsmImpl::Anonymous, dir.path())).unwrap();
        (dsm, DsaConfig::default())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn create_set_find_free() {
        let dir = tempfile::tempdir().unwrap();
        let (dsm, config) = area(&dir);
        let area = DsaArea::create(&dsm, config).unwrap();
        let tree = SharedRadixTree::<u64>::create(&area, 7).unwrap();
        {
            let mut writer = tree.lock_exclusive();
            for key in 0..5000u64 {
                assert!(!writer.set(key * 3, &key).unwrap());
            }
            writer.verify().unwrap();
            assert!(writer.delete(3).unwrap());
            assert_eq!(writer.num_keys(), 4999);
        }
        {
            let reader = tree.lock_share();
            assert_eq!(reader.find(3).unwrap(), None);
            assert_eq!(reader.find(6).unwrap(), Some(&2));
            assert_eq!(reader.iter().count(), 4999);
        }
        assert!(tree.memory_usage() >= area.total_size());
        tree.free().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn attach_checks_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (dsm, config) = area(&dir);
        let area = DsaArea::create(&dsm, config).unwrap();
        let tree = SharedRadixTree::<u32>::create(&area, 7).unwrap();
        tree.lock_exclusive().set(1, &10).unwrap();

        let again = SharedRadixTree::<u32>::attach(&area, tree.handle()).unwrap();
        assert_eq!(again.lock_share().find(1).unwrap(), Some(&10));

        let other = area.allocate_zeroed(64).unwrap();
        assert!(matches!(
            SharedRadixTree::<u32>::attach(&area, other),
            Err(RadixTreeError::Corrupted(_))
        ));
        assert!(SharedRadixTree::<u32>::attach(&area, DsaPointer::NULL).is_err());

        let handle = tree.handle();
        drop(again);
        tree.free().unwrap();
        assert!(SharedRadixTree::<u32>::attach(&area, handle).is_err());
        area.free(other).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn shared_nodes_use_area_size_classes() {
        let dir = tempfile::tempdir().unwrap();
        let (dsm, config) = area(&dir);
        let area = DsaArea::create(&dsm, config).unwrap();
        let tree = SharedRadixTree::<u64>::create(&area, 7).unwrap();
        let mut writer = tree.lock_exclusive();
        for key in 0..40u64 {
            writer.set(key, &key).unwrap();
        }
        // 15, then 32 children, then a node48 holding up to 62.
        assert_eq!(writer.stats().num_nodes, [0, 0, 0, 1, 0]);
        for key in 40..256u64 {
            writer.set(key, &key).unwrap();
        }
        assert_eq!(writer.stats().num_nodes, [0, 0, 0, 0, 1]);
        for key in 45..256u64 {
            writer.delete(key).unwrap();
        }
        // 256 shrinks at 62 / 4 * 3 = 45 children.
        assert_eq!(writer.stats().num_nodes, [0, 0, 0, 1, 0]);
        writer.verify().unwrap();
        drop(writer);
        tree.free().unwrap();
    }
}
