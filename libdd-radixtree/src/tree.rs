// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tree itself: search, insertion with node growth, deletion with node
//! shrinking, and the diagnostics walkers.
//!
//! Every operation below works on raw node pointers and is `unsafe`; the
//! safe surface is the local API at the bottom of this file and the lock
//! guards of [`crate::shared`]. The contract is the same throughout: the
//! caller has exclusive access for anything that modifies the tree and at
//! least shared access for anything that reads it.

use crate::iter::Iter;
use crate::memory::{LocalMemory, NodeMemory};
use crate::node::{
    class_info_of, key_chunk, key_get_shift, shift_get_max_val, ChildPtr, Node, NodeKind,
    SizeClass, INVALID_CHILD, MAX_SHIFT, NUM_SIZE_CLASSES, SPAN,
};
use crate::value::{check_alignment, child_is_value, is_embeddable, TreeValue};
use crate::RadixTreeError;
use core::fmt::{self, Write};
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{self, addr_of_mut, NonNull};
use libdd_dsa::DsaPointer;
use libdd_dsm::LwLock;

pub(crate) const RADIX_TREE_MAGIC: u32 = 0x54A4_8167;

/// Arena pointer to the control block of a shared tree. Passing it to
/// another process lets it attach.
pub type RadixTreeHandle = DsaPointer;

#[repr(C)]
pub(crate) struct Control {
    pub(crate) handle: RadixTreeHandle,
    pub(crate) magic: u32,
    pub(crate) lock: LwLock,
    pub(crate) root: ChildPtr,
    pub(crate) max_val: u64,
    pub(crate) num_keys: u64,
    pub(crate) start_shift: u32,
    pub(crate) num_nodes: [u64; NUM_SIZE_CLASSES],
    pub(crate) num_leaves: u64,
}

impl Control {
    pub(crate) fn new(handle: RadixTreeHandle, tranche_id: u32) -> Self {
        Control {
            handle,
            magic: RADIX_TREE_MAGIC,
            lock: LwLock::new(tranche_id),
            root: INVALID_CHILD,
            max_val: shift_get_max_val(0),
            num_keys: 0,
            start_shift: 0,
            num_nodes: [0; NUM_SIZE_CLASSES],
            num_leaves: 0,
        }
    }
}

/// An adaptive radix tree mapping `u64` keys to values of type `V`.
///
/// With the default [`LocalMemory`] the tree is private to its owner and is
/// freed on drop. A [`crate::SharedRadixTree`] lives in a DSA area instead
/// and is reached through its lock guards.
pub struct RadixTree<V: TreeValue, M: NodeMemory = LocalMemory> {
    pub(crate) memory: M,
    pub(crate) control: NonNull<Control>,
    _values: PhantomData<V>,
}

/// Counters and shape of a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RadixTreeStats {
    pub max_val: u64,
    pub num_keys: u64,
    /// Levels of inner nodes, the root included.
    pub height: u32,
    pub start_shift: u32,
    /// Live nodes per size class, in [`SizeClass::ALL`] order.
    pub num_nodes: [u64; NUM_SIZE_CLASSES],
    pub num_leaves: u64,
}

impl fmt::Display for RadixTreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max_val = {}, num_keys = {}, height = {}",
            self.max_val, self.num_keys, self.height
        )?;
        for (class, count) in SizeClass::ALL.iter().zip(self.num_nodes) {
            write!(f, ", {} = {count}", class.name())?;
        }
        write!(f, ", leaves = {}", self.num_leaves)
    }
}

impl<V: TreeValue, M: NodeMemory> RadixTree<V, M> {
    pub(crate) fn from_parts(memory: M, control: NonNull<Control>) -> Self {
        const { check_alignment::<V>() };
        RadixTree {
            memory,
            control,
            _values: PhantomData,
        }
    }

    pub(crate) fn ctl(&self) -> *mut Control {
        self.control.as_ptr()
    }

    pub(crate) fn node(&self, ptr: ChildPtr) -> Result<Node, RadixTreeError> {
        Ok(Node::from_ptr(self.memory.resolve(ptr)?))
    }

    /// Bytes reserved for the tree. For a shared tree this is the whole
    /// area.
    pub fn memory_usage(&self) -> usize {
        self.memory.memory_usage()
    }

    // ---------------------------------------------------------------------
    // Allocation bookkeeping
    // ---------------------------------------------------------------------

    unsafe fn alloc_node(
        &self,
        kind: NodeKind,
        class: SizeClass,
    ) -> Result<(ChildPtr, Node), RadixTreeError> {
        let alloc = self.memory.allocate_node(class)?;
        let node = self.node(alloc)?;
        node.init(kind, class_info_of(class, M::SHARED).fanout);
        (*self.ctl()).num_nodes[class as usize] += 1;
        Ok((alloc, node))
    }

    /// Like [`Self::alloc_node`], but running out of memory is not an error:
    /// shrinking is an optimization and the old node stays usable.
    unsafe fn alloc_for_shrink(
        &self,
        kind: NodeKind,
        class: SizeClass,
    ) -> Result<Option<(ChildPtr, Node)>, RadixTreeError> {
        match self.alloc_node(kind, class) {
            Ok(allocated) => Ok(Some(allocated)),
            Err(err) if err.is_out_of_memory() => {
                tracing::debug!(%err, class = class.name(), "keeping radix tree node unshrunk");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    unsafe fn free_node(&self, alloc: ChildPtr, node: Node) -> Result<(), RadixTreeError> {
        let class = node.size_class(M::SHARED)?;
        self.memory.free_node(class, alloc)?;
        let count = &mut (*self.ctl()).num_nodes[class as usize];
        *count = count.saturating_sub(1);
        Ok(())
    }

    /// Bytes behind a leaf pointer.
    unsafe fn leaf_size(&self, leaf: ChildPtr) -> Result<usize, RadixTreeError> {
        if V::VARIABLE_LENGTH {
            let value = self.memory.resolve(leaf)?.cast::<V>();
            Ok(value.as_ref().value_size())
        } else {
            Ok(size_of::<V>())
        }
    }

    unsafe fn alloc_leaf(&self, value: &V) -> Result<ChildPtr, RadixTreeError> {
        let size = value.value_size();
        let leaf = self.memory.allocate_leaf(size)?;
        let dst = match self.memory.resolve(leaf) {
            Ok(dst) => dst,
            Err(err) => {
                self.memory.free_leaf(leaf, size)?;
                return Err(err);
            }
        };
        ptr::copy_nonoverlapping((value as *const V).cast::<u8>(), dst.as_ptr(), size);
        (*self.ctl()).num_leaves += 1;
        Ok(leaf)
    }

    unsafe fn free_leaf(&self, leaf: ChildPtr) -> Result<(), RadixTreeError> {
        let size = self.leaf_size(leaf)?;
        self.memory.free_leaf(leaf, size)?;
        let count = &mut (*self.ctl()).num_leaves;
        *count = count.saturating_sub(1);
        Ok(())
    }

    /// Writes the root node of an empty tree.
    pub(crate) unsafe fn init_root(&self) -> Result<(), RadixTreeError> {
        let (root, _) = self.alloc_node(NodeKind::Node4, SizeClass::Node4)?;
        let ctl = self.ctl();
        (*ctl).root = root;
        (*ctl).start_shift = 0;
        (*ctl).max_val = shift_get_max_val(0);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Search
    // ---------------------------------------------------------------------

    /// Address of the value stored under `key`.
    pub(crate) unsafe fn find_inner(&self, key: u64) -> Result<Option<NonNull<V>>, RadixTreeError> {
        let ctl = self.ctl();
        if key > (*ctl).max_val {
            return Ok(None);
        }
        let mut child = (*ctl).root;
        let mut shift = (*ctl).start_shift;
        loop {
            let node = self.node(child)?;
            let Some(slot) = node.search(key_chunk(key, shift))? else {
                return Ok(None);
            };
            if shift == 0 {
                return self.value_at(slot).map(Some);
            }
            child = *slot;
            shift -= SPAN;
        }
    }

    /// Address of the value a leaf-level slot refers to.
    pub(crate) unsafe fn value_at(&self, slot: *mut ChildPtr) -> Result<NonNull<V>, RadixTreeError> {
        if child_is_value::<V>(*slot) {
            Ok(NonNull::new_unchecked(slot).cast())
        } else {
            Ok(self.memory.resolve(*slot)?.cast())
        }
    }

    // ---------------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------------

    /// Stores a copy of `value` under `key`. Returns whether the key was
    /// already present.
    pub(crate) unsafe fn set_inner(&self, key: u64, value: &V) -> Result<bool, RadixTreeError> {
        let leaf = if is_embeddable(value) {
            None
        } else {
            Some(self.alloc_leaf(value)?)
        };
        let (slot, found) = match self.slot_for_insert(key) {
            Ok(found) => found,
            Err(err) => {
                if let Some(leaf) = leaf {
                    self.free_leaf(leaf)?;
                }
                return Err(err);
            }
        };
        if found && !child_is_value::<V>(*slot) {
            self.free_leaf(*slot)?;
        }
        match leaf {
            Some(leaf) => *slot = leaf,
            None => {
                *slot = INVALID_CHILD;
                ptr::copy_nonoverlapping(
                    (value as *const V).cast::<u8>(),
                    slot.cast::<u8>(),
                    value.value_size(),
                );
                if V::VARIABLE_LENGTH {
                    *slot |= 1;
                }
            }
        }
        if !found {
            (*self.ctl()).num_keys += 1;
        }
        Ok(found)
    }

    /// The leaf-level slot for `key`, created if missing, and whether it was
    /// there already. A new slot holds [`INVALID_CHILD`].
    unsafe fn slot_for_insert(&self, key: u64) -> Result<(*mut ChildPtr, bool), RadixTreeError> {
        let ctl = self.ctl();
        if key > (*ctl).max_val {
            if (*ctl).num_keys == 0 {
                return self.insert_into_empty(key);
            }
            self.extend_up(key)?;
        }

        let mut parent_slot: *mut ChildPtr = addr_of_mut!((*ctl).root);
        let mut shift = (*ctl).start_shift;
        loop {
            let node_ptr = *parent_slot;
            let node = self.node(node_ptr)?;
            let chunk = key_chunk(key, shift);
            if let Some(slot) = node.search(chunk)? {
                if shift == 0 {
                    return Ok((slot, true));
                }
                parent_slot = slot;
                shift -= SPAN;
                continue;
            }

            // Build the missing path first so a failure leaves the tree as
            // it was.
            let chain = if shift > 0 {
                Some(self.new_chain(key, shift)?)
            } else {
                None
            };
            let slot = match self.node_insert(parent_slot, node_ptr, node, chunk) {
                Ok(slot) => slot,
                Err(err) => {
                    if let Some((head, _)) = chain {
                        self.free_chain(head)?;
                    }
                    return Err(err);
                }
            };
            return Ok(match chain {
                Some((head, leaf_slot)) => {
                    *slot = head;
                    (leaf_slot, false)
                }
                None => (slot, false),
            });
        }
    }

    /// First key of an empty tree: the root is reused at the height the key
    /// needs instead of growing the tree one level at a time.
    unsafe fn insert_into_empty(&self, key: u64) -> Result<(*mut ChildPtr, bool), RadixTreeError> {
        let ctl = self.ctl();
        let start_shift = key_get_shift(key);
        let root = self.node((*ctl).root)?;
        if root.kind()? != NodeKind::Node4 || root.count() != 0 {
            return Err(RadixTreeError::Corrupted(
                "tree without keys has a non-empty root".into(),
            ));
        }
        let (head, leaf_slot) = self.new_chain(key, start_shift)?;
        *root.add_child(key_chunk(key, start_shift))? = head;
        (*ctl).start_shift = start_shift;
        (*ctl).max_val = shift_get_max_val(start_shift);
        Ok((leaf_slot, false))
    }

    /// A path of node4s holding only `key`, for the levels below `shift`.
    /// Returns its top node and the empty leaf-level slot at its bottom.
    unsafe fn new_chain(
        &self,
        key: u64,
        shift: u32,
    ) -> Result<(ChildPtr, *mut ChildPtr), RadixTreeError> {
        let (bottom, bottom_node) = self.alloc_node(NodeKind::Node4, SizeClass::Node4)?;
        let leaf_slot = bottom_node.add_child(key_chunk(key, 0))?;
        let mut head = bottom;
        let mut level_shift = SPAN;
        while level_shift < shift {
            let (alloc, node) = match self.alloc_node(NodeKind::Node4, SizeClass::Node4) {
                Ok(allocated) => allocated,
                Err(err) => {
                    self.free_chain(head)?;
                    return Err(err);
                }
            };
            *node.add_child(key_chunk(key, level_shift))? = head;
            head = alloc;
            level_shift += SPAN;
        }
        Ok((head, leaf_slot))
    }

    /// Frees a path built by [`Self::new_chain`] before any value went in.
    unsafe fn free_chain(&self, head: ChildPtr) -> Result<(), RadixTreeError> {
        let mut current = head;
        while current != INVALID_CHILD {
            let node = self.node(current)?;
            let mut idx = 0;
            let next = match node.next_child(&mut idx)? {
                Some((_, slot)) => *slot,
                None => INVALID_CHILD,
            };
            self.free_node(current, node)?;
            current = next;
        }
        Ok(())
    }

    /// Adds levels above the root until `key` is in range.
    unsafe fn extend_up(&self, key: u64) -> Result<(), RadixTreeError> {
        let ctl = self.ctl();
        let target_shift = key_get_shift(key);
        while (*ctl).start_shift < target_shift {
            let (alloc, node) = self.alloc_node(NodeKind::Node4, SizeClass::Node4)?;
            *node.add_child(0)? = (*ctl).root;
            (*ctl).root = alloc;
            (*ctl).start_shift += SPAN;
            (*ctl).max_val = shift_get_max_val((*ctl).start_shift);
        }
        Ok(())
    }

    /// Adds `chunk` to the node at `*parent_slot`, replacing the node with a
    /// larger one when it is full.
    unsafe fn node_insert(
        &self,
        parent_slot: *mut ChildPtr,
        node_ptr: ChildPtr,
        node: Node,
        chunk: u8,
    ) -> Result<*mut ChildPtr, RadixTreeError> {
        let kind = node.kind()?;
        if kind == NodeKind::Node256 || !node.must_grow() {
            return node.add_child(chunk);
        }
        match kind {
            NodeKind::Node4 => {
                self.grow_sorted(parent_slot, node_ptr, node, SizeClass::Node16Lo, chunk)
            }
            NodeKind::Node16
                if node.fanout() < class_info_of(SizeClass::Node16Hi, M::SHARED).fanout =>
            {
                self.grow_sorted(parent_slot, node_ptr, node, SizeClass::Node16Hi, chunk)
            }
            NodeKind::Node16 => {
                let (new_ptr, new) = self.alloc_node(NodeKind::Node48, SizeClass::Node48)?;
                let slot = new.grow_48_from(node, chunk);
                *parent_slot = new_ptr;
                self.free_node(node_ptr, node)?;
                Ok(slot)
            }
            NodeKind::Node48 | NodeKind::Node256 => {
                let (new_ptr, new) = self.alloc_node(NodeKind::Node256, SizeClass::Node256)?;
                new.grow_256_from(node);
                *parent_slot = new_ptr;
                self.free_node(node_ptr, node)?;
                new.add_child(chunk)
            }
        }
    }

    unsafe fn grow_sorted(
        &self,
        parent_slot: *mut ChildPtr,
        node_ptr: ChildPtr,
        node: Node,
        class: SizeClass,
        chunk: u8,
    ) -> Result<*mut ChildPtr, RadixTreeError> {
        let (new_ptr, new) = self.alloc_node(NodeKind::Node16, class)?;
        let slot = new.grow_sorted_from(node, chunk)?;
        *parent_slot = new_ptr;
        self.free_node(node_ptr, node)?;
        Ok(slot)
    }

    // ---------------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------------

    /// Removes `key`. Returns whether it was present.
    pub(crate) unsafe fn delete_inner(&self, key: u64) -> Result<bool, RadixTreeError> {
        let ctl = self.ctl();
        if key > (*ctl).max_val {
            return Ok(false);
        }
        let deleted = self.delete_recursive(addr_of_mut!((*ctl).root), key, (*ctl).start_shift)?;
        if deleted {
            (*ctl).num_keys -= 1;
        }
        Ok(deleted)
    }

    unsafe fn delete_recursive(
        &self,
        parent_slot: *mut ChildPtr,
        key: u64,
        shift: u32,
    ) -> Result<bool, RadixTreeError> {
        let node_ptr = *parent_slot;
        let node = self.node(node_ptr)?;
        let chunk = key_chunk(key, shift);
        let Some(slot) = node.search(chunk)? else {
            return Ok(false);
        };
        if shift == 0 {
            if !child_is_value::<V>(*slot) {
                self.free_leaf(*slot)?;
            }
        } else {
            if !self.delete_recursive(slot, key, shift - SPAN)? {
                return Ok(false);
            }
            // The child survived, nothing to remove here.
            if *slot != INVALID_CHILD {
                return Ok(true);
            }
        }
        self.node_delete(parent_slot, node_ptr, node, chunk, slot)?;
        Ok(true)
    }

    /// Removes `chunk`, found at `slot`, from the node at `*parent_slot`. A
    /// node left empty is freed and `*parent_slot` cleared so the caller
    /// removes it in turn; the root is emptied but kept.
    unsafe fn node_delete(
        &self,
        parent_slot: *mut ChildPtr,
        node_ptr: ChildPtr,
        node: Node,
        chunk: u8,
        slot: *mut ChildPtr,
    ) -> Result<(), RadixTreeError> {
        let ctl = self.ctl();
        match node.kind()? {
            NodeKind::Node4 => {
                if node.count() > 1 {
                    return node.remove_sorted(node.slot_position(slot)?);
                }
                if parent_slot == addr_of_mut!((*ctl).root) {
                    node.remove_sorted(0)?;
                    (*ctl).start_shift = 0;
                    (*ctl).max_val = shift_get_max_val(0);
                } else {
                    self.free_node(node_ptr, node)?;
                    *parent_slot = INVALID_CHILD;
                }
            }
            NodeKind::Node16 => {
                let deletepos = node.slot_position(slot)?;
                let shrunk = node.count() <= class_info_of(SizeClass::Node4, M::SHARED).fanout
                    && self.replace_with_smaller(
                        parent_slot,
                        node_ptr,
                        node,
                        SizeClass::Node4,
                        |new| new.shrink_4_from(node, deletepos),
                    )?;
                if !shrunk {
                    node.remove_sorted(deletepos)?;
                }
            }
            NodeKind::Node48 => {
                node.remove_48(chunk);
                if node.count() <= class_info_of(SizeClass::Node16Lo, M::SHARED).fanout / 4 * 3 {
                    self.replace_with_smaller(parent_slot, node_ptr, node, SizeClass::Node16Lo, |new| {
                        new.shrink_16_from(node);
                        Ok(())
                    })?;
                }
            }
            NodeKind::Node256 => {
                node.remove_256(chunk);
                let threshold =
                    (class_info_of(SizeClass::Node48, M::SHARED).fanout / 4 * 3).min(64);
                if node.count() <= threshold {
                    self.replace_with_smaller(parent_slot, node_ptr, node, SizeClass::Node48, |new| {
                        new.shrink_48_from(node);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Copies the node at `*parent_slot` into a fresh node of `class` with
    /// `fill`, then swaps it in. The tree is left as it was when the copy
    /// cannot be allocated (`Ok(false)`) or filled (the error).
    unsafe fn replace_with_smaller(
        &self,
        parent_slot: *mut ChildPtr,
        node_ptr: ChildPtr,
        node: Node,
        class: SizeClass,
        fill: impl FnOnce(Node) -> Result<(), RadixTreeError>,
    ) -> Result<bool, RadixTreeError> {
        let Some((new_ptr, new)) = self.alloc_for_shrink(class.kind(), class)? else {
            return Ok(false);
        };
        if let Err(err) = fill(new) {
            self.free_node(new_ptr, new)?;
            return Err(err);
        }
        *parent_slot = new_ptr;
        self.free_node(node_ptr, node)?;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Teardown and diagnostics
    // ---------------------------------------------------------------------

    /// Frees the subtree rooted at `ptr`, which sits at level `shift`.
    pub(crate) unsafe fn free_recurse(&self, ptr: ChildPtr, shift: u32) -> Result<(), RadixTreeError> {
        let node = self.node(ptr)?;
        let mut idx = 0;
        while let Some((_, slot)) = node.next_child(&mut idx)? {
            let child = *slot;
            if shift > 0 {
                self.free_recurse(child, shift - SPAN)?;
            } else if !child_is_value::<V>(child) {
                self.free_leaf(child)?;
            }
        }
        self.free_node(ptr, node)
    }

    pub(crate) unsafe fn stats_inner(&self) -> RadixTreeStats {
        let ctl = self.ctl();
        RadixTreeStats {
            max_val: (*ctl).max_val,
            num_keys: (*ctl).num_keys,
            height: (*ctl).start_shift / SPAN + 1,
            start_shift: (*ctl).start_shift,
            num_nodes: (*ctl).num_nodes,
            num_leaves: (*ctl).num_leaves,
        }
    }

    pub(crate) unsafe fn dump_inner(&self) -> Result<String, RadixTreeError> {
        let ctl = self.ctl();
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.stats_inner());
        self.dump_node(&mut out, (*ctl).root, (*ctl).start_shift, 0)?;
        tracing::debug!(dump = %out, "radix tree state");
        Ok(out)
    }

    unsafe fn dump_node(
        &self,
        out: &mut String,
        ptr: ChildPtr,
        shift: u32,
        depth: usize,
    ) -> Result<(), RadixTreeError> {
        let node = self.node(ptr)?;
        let indent = "  ".repeat(depth);
        let _ = writeln!(
            out,
            "{indent}kind {}, fanout {}, count {}, shift {shift}:",
            node.kind()?.nominal_fanout(),
            node.fanout(),
            node.count(),
        );
        let mut idx = 0;
        while let Some((chunk, slot)) = node.next_child(&mut idx)? {
            if shift > 0 {
                let _ = writeln!(out, "{indent}  chunk {chunk:#04x} -> {:#x}", *slot);
                self.dump_node(out, *slot, shift - SPAN, depth + 1)?;
            } else if child_is_value::<V>(*slot) {
                let _ = writeln!(out, "{indent}  chunk {chunk:#04x} value {:#018x}", *slot);
            } else {
                let _ = writeln!(out, "{indent}  chunk {chunk:#04x} leaf {:#x}", *slot);
            }
        }
        Ok(())
    }

    /// Walks the whole tree checking every node and the key count.
    pub(crate) unsafe fn verify_inner(&self) -> Result<(), RadixTreeError> {
        let ctl = self.ctl();
        if (*ctl).start_shift > MAX_SHIFT || (*ctl).start_shift % SPAN != 0 {
            return Err(RadixTreeError::Corrupted(format!(
                "invalid start shift {}",
                (*ctl).start_shift
            )));
        }
        if (*ctl).max_val != shift_get_max_val((*ctl).start_shift) {
            return Err(RadixTreeError::Corrupted(format!(
                "max_val {} does not match start shift {}",
                (*ctl).max_val,
                (*ctl).start_shift
            )));
        }
        let keys = self.verify_node((*ctl).root, (*ctl).start_shift, true)?;
        if keys != (*ctl).num_keys {
            return Err(RadixTreeError::Corrupted(format!(
                "tree holds {keys} keys but counts {}",
                (*ctl).num_keys
            )));
        }
        Ok(())
    }

    unsafe fn verify_node(&self, ptr: ChildPtr, shift: u32, is_root: bool) -> Result<u64, RadixTreeError> {
        let node = self.node(ptr)?;
        node.verify()?;
        if !is_root && node.count() == 0 {
            return Err(RadixTreeError::Corrupted("empty inner node".into()));
        }
        if shift == 0 {
            return Ok(node.count() as u64);
        }
        let mut keys = 0;
        let mut idx = 0;
        while let Some((_, slot)) = node.next_child(&mut idx)? {
            keys += self.verify_node(*slot, shift - SPAN, false)?;
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Local trees
// ---------------------------------------------------------------------------

impl<V: TreeValue> RadixTree<V, LocalMemory> {
    pub fn new() -> Result<Self, RadixTreeError> {
        Self::create_local(false)
    }

    /// A tree whose keys are never deleted or overwritten. Leaves are
    /// carved from a bump allocator that only gives memory back on drop.
    pub fn new_insert_only() -> Result<Self, RadixTreeError> {
        Self::create_local(true)
    }

    fn create_local(insert_only: bool) -> Result<Self, RadixTreeError> {
        let memory = LocalMemory::new::<V>(insert_only)?;
        let control = NonNull::from(Box::leak(Box::new(Control::new(DsaPointer::NULL, 0))));
        let tree = Self::from_parts(memory, control);
        // SAFETY: nobody else can see the tree yet.
        unsafe { tree.init_root()? };
        Ok(tree)
    }

    pub fn find(&self, key: u64) -> Result<Option<&V>, RadixTreeError> {
        // SAFETY: `&self` excludes writers; the value lives until the next
        // `&mut self` call.
        unsafe { Ok(self.find_inner(key)?.map(|value| &*value.as_ptr())) }
    }

    /// Stores a copy of `value` under `key`, replacing any previous value.
    /// Returns whether the key was already present.
    pub fn set(&mut self, key: u64, value: &V) -> Result<bool, RadixTreeError> {
        // SAFETY: `&mut self` is exclusive.
        unsafe { self.set_inner(key, value) }
    }

    /// Returns whether the key was present.
    pub fn delete(&mut self, key: u64) -> Result<bool, RadixTreeError> {
        // SAFETY: `&mut self` is exclusive.
        unsafe { self.delete_inner(key) }
    }

    /// Every key and value in ascending key order.
    pub fn iter(&self) -> Iter<'_, V, LocalMemory> {
        Iter::new(self)
    }

    pub fn num_keys(&self) -> u64 {
        // SAFETY: `&self` excludes writers.
        unsafe { (*self.ctl()).num_keys }
    }

    pub fn stats(&self) -> RadixTreeStats {
        // SAFETY: `&self` excludes writers.
        unsafe { self.stats_inner() }
    }

    /// Describes every node. Also emitted as a debug event.
    pub fn dump(&self) -> Result<String, RadixTreeError> {
        // SAFETY: `&self` excludes writers.
        unsafe { self.dump_inner() }
    }

    pub fn verify(&self) -> Result<(), RadixTreeError> {
        // SAFETY: `&self` excludes writers.
        unsafe { self.verify_inner() }
    }
}

impl<V: TreeValue> fmt::Debug for RadixTree<V, LocalMemory> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixTree")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<V: TreeValue, M: NodeMemory> Drop for RadixTree<V, M> {
    fn drop(&mut self) {
        // Shared trees outlive their handles; see `SharedRadixTree::free`.
        if M::SHARED {
            return;
        }
        let ctl = self.ctl();
        // SAFETY: a local tree is owned, so dropping it is exclusive, and the
        // control block came from `Box::leak` in `create_local`.
        unsafe {
            if (*ctl).root != INVALID_CHILD {
                if let Err(err) = self.free_recurse((*ctl).root, (*ctl).start_shift) {
                    tracing::warn!(%err, "could not free radix tree");
                }
            }
            drop(Box::from_raw(ctl));
        }
    }
}

// SAFETY: a local tree owns its memory outright.
unsafe impl<V: TreeValue + Send> Send for RadixTree<V, LocalMemory> {}
