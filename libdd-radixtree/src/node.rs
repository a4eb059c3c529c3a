// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Node layouts and the operations that stay inside a single node.
//!
//! ```text
//! node4:   | kind fanout count | chunks[5]  | children[fanout]          |
//! node16:  | kind fanout count | chunks[32] | children[fanout]          |
//! node48:  | kind fanout count | isset: u64 | slot_idxs[256] | children |
//! node256: | kind fanout count | isset: [u64; 4] | children[256]        |
//! ```
//!
//! Nodes of kind 4 and 16 keep their chunks sorted, with the matching child
//! at the same index. Kind 48 maps a chunk to a child index through
//! `slot_idxs` and tracks used child indexes in `isset`. Kind 256 is
//! indexed by the chunk directly.
//!
//! A node is allocated with room for exactly `fanout` children, so the
//! child arrays are only ever reached through raw pointers. `fanout` and
//! `count` are bytes; for kind 256 a stored 0 means 256.

use crate::RadixTreeError;
use core::mem::{offset_of, size_of};
use core::ptr::{self, addr_of_mut, NonNull};

/// A child slot: a node or leaf pointer, or an embedded value at the leaf
/// level. Pointers are raw addresses in local trees and arena pointers in
/// shared ones; either way 0 is no child.
pub type ChildPtr = u64;

pub(crate) const INVALID_CHILD: ChildPtr = 0;
pub(crate) const SLOT_SIZE: usize = size_of::<ChildPtr>();

/// Key bits consumed per level.
pub(crate) const SPAN: u32 = 8;
pub(crate) const CHUNK_MASK: u64 = (1 << SPAN) - 1;
pub(crate) const NODE_MAX_SLOTS: usize = 1 << SPAN;
pub(crate) const MAX_LEVEL: usize = (u64::BITS / SPAN) as usize;
pub(crate) const MAX_SHIFT: u32 = key_get_shift(u64::MAX);

const BITS_PER_WORD: usize = u64::BITS as usize;
const INVALID_SLOT_IDX: u8 = 0xFF;

pub(crate) const fn key_chunk(key: u64, shift: u32) -> u8 {
    ((key >> shift) & CHUNK_MASK) as u8
}

/// Shift of the highest level needed to hold `key`.
pub(crate) const fn key_get_shift(key: u64) -> u32 {
    if key == 0 {
        0
    } else {
        ((u64::BITS - 1 - key.leading_zeros()) / SPAN) * SPAN
    }
}

/// Largest key a tree whose root sits at `shift` can hold.
pub(crate) const fn shift_get_max_val(shift: u32) -> u64 {
    if shift == MAX_SHIFT {
        u64::MAX
    } else {
        (1 << (shift + SPAN)) - 1
    }
}

// ---------------------------------------------------------------------------
// Layouts
// ---------------------------------------------------------------------------

#[repr(C)]
struct NodeHeader {
    kind: u8,
    fanout: u8,
    count: u8,
}

const FANOUT_4_MAX: usize = SLOT_SIZE - size_of::<NodeHeader>();
const FANOUT_16_MAX: usize = 32;
const FANOUT_48_MAX: usize = 64;

#[repr(C)]
struct Node4 {
    base: NodeHeader,
    chunks: [u8; FANOUT_4_MAX],
    children: [ChildPtr; 0],
}

#[repr(C)]
struct Node16 {
    base: NodeHeader,
    chunks: [u8; FANOUT_16_MAX],
    children: [ChildPtr; 0],
}

#[repr(C)]
struct Node48 {
    base: NodeHeader,
    isset: [u64; FANOUT_48_MAX / BITS_PER_WORD],
    slot_idxs: [u8; NODE_MAX_SLOTS],
    children: [ChildPtr; 0],
}

#[repr(C)]
struct Node256 {
    base: NodeHeader,
    isset: [u64; NODE_MAX_SLOTS / BITS_PER_WORD],
    children: [ChildPtr; NODE_MAX_SLOTS],
}

const _: () = assert!(offset_of!(Node4, children) == 8);
const _: () = assert!(offset_of!(Node16, children) == 40);
const _: () = assert!(offset_of!(Node48, children) == 272);
const _: () = assert!(size_of::<Node256>() == 2088);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Node4 = 0,
    Node16 = 1,
    Node48 = 2,
    Node256 = 3,
}

impl NodeKind {
    fn from_u8(kind: u8) -> Result<Self, RadixTreeError> {
        match kind {
            0 => Ok(NodeKind::Node4),
            1 => Ok(NodeKind::Node16),
            2 => Ok(NodeKind::Node48),
            3 => Ok(NodeKind::Node256),
            other => Err(RadixTreeError::Corrupted(format!("unknown node kind {other}"))),
        }
    }

    pub fn nominal_fanout(self) -> usize {
        match self {
            NodeKind::Node4 => 4,
            NodeKind::Node16 => 16,
            NodeKind::Node48 => 48,
            NodeKind::Node256 => 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Size classes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Node4,
    Node16Lo,
    Node16Hi,
    Node48,
    Node256,
}

pub const NUM_SIZE_CLASSES: usize = 5;

impl SizeClass {
    pub const ALL: [SizeClass; NUM_SIZE_CLASSES] = [
        SizeClass::Node4,
        SizeClass::Node16Lo,
        SizeClass::Node16Hi,
        SizeClass::Node48,
        SizeClass::Node256,
    ];

    pub fn kind(self) -> NodeKind {
        match self {
            SizeClass::Node4 => NodeKind::Node4,
            SizeClass::Node16Lo | SizeClass::Node16Hi => NodeKind::Node16,
            SizeClass::Node48 => NodeKind::Node48,
            SizeClass::Node256 => NodeKind::Node256,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeClass::Node4 => "node4",
            SizeClass::Node16Lo => "node16_lo",
            SizeClass::Node16Hi => "node16_hi",
            SizeClass::Node48 => "node48",
            SizeClass::Node256 => "node256",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    pub name: &'static str,
    pub fanout: usize,
    pub allocsize: usize,
}

const fn min(a: usize, b: usize) -> usize {
    if a < b {
        a
    } else {
        b
    }
}

const fn class_info(name: &'static str, header: usize, fanout: usize) -> SizeClassInfo {
    SizeClassInfo {
        name,
        fanout,
        allocsize: header + fanout * SLOT_SIZE,
    }
}

const FANOUT_4: usize = 4;

/// Local nodes use the nominal fanouts.
static LOCAL_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = [
    class_info("radix tree node4", size_of::<Node4>(), FANOUT_4),
    class_info("radix tree node16_lo", size_of::<Node16>(), 16),
    class_info("radix tree node16_hi", size_of::<Node16>(), FANOUT_16_MAX),
    class_info("radix tree node48", size_of::<Node48>(), FANOUT_48_MAX),
    SizeClassInfo {
        name: "radix tree node256",
        fanout: NODE_MAX_SLOTS,
        allocsize: size_of::<Node256>(),
    },
];

/// Shared nodes are sized to fill an arena size class exactly.
static SHARED_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = [
    class_info("radix tree node4", size_of::<Node4>(), FANOUT_4),
    class_info(
        "radix tree node16_lo",
        size_of::<Node16>(),
        (160 - offset_of!(Node16, children)) / SLOT_SIZE,
    ),
    class_info(
        "radix tree node16_hi",
        size_of::<Node16>(),
        min(FANOUT_16_MAX, (320 - offset_of!(Node16, children)) / SLOT_SIZE),
    ),
    class_info(
        "radix tree node48",
        size_of::<Node48>(),
        min(FANOUT_48_MAX, (768 - offset_of!(Node48, children)) / SLOT_SIZE),
    ),
    SizeClassInfo {
        name: "radix tree node256",
        fanout: NODE_MAX_SLOTS,
        allocsize: size_of::<Node256>(),
    },
];

pub(crate) fn size_classes(shared: bool) -> &'static [SizeClassInfo; NUM_SIZE_CLASSES] {
    if shared {
        &SHARED_CLASSES
    } else {
        &LOCAL_CLASSES
    }
}

pub(crate) fn class_info_of(class: SizeClass, shared: bool) -> &'static SizeClassInfo {
    &size_classes(shared)[class as usize]
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Resolved address of a node. All methods are unsafe: the caller
/// guarantees the node is live and initialized, and that it holds the tree
/// lock in a mode suitable for the access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Node(NonNull<u8>);

impl Node {
    pub(crate) fn from_ptr(ptr: NonNull<u8>) -> Node {
        Node(ptr)
    }

    fn header(self) -> *mut NodeHeader {
        self.0.as_ptr().cast()
    }

    fn n4(self) -> *mut Node4 {
        self.0.as_ptr().cast()
    }

    fn n16(self) -> *mut Node16 {
        self.0.as_ptr().cast()
    }

    fn n48(self) -> *mut Node48 {
        self.0.as_ptr().cast()
    }

    fn n256(self) -> *mut Node256 {
        self.0.as_ptr().cast()
    }

    /// Writes an empty node of `kind` over freshly allocated memory.
    pub(crate) unsafe fn init(self, kind: NodeKind, fanout: usize) {
        match kind {
            NodeKind::Node4 => ptr::write_bytes(self.0.as_ptr(), 0, size_of::<Node4>()),
            NodeKind::Node16 => ptr::write_bytes(self.0.as_ptr(), 0, size_of::<Node16>()),
            NodeKind::Node48 => {
                ptr::write_bytes(self.0.as_ptr(), 0, offset_of!(Node48, slot_idxs));
                ptr::write_bytes(
                    addr_of_mut!((*self.n48()).slot_idxs).cast::<u8>(),
                    INVALID_SLOT_IDX,
                    NODE_MAX_SLOTS,
                );
            }
            NodeKind::Node256 => {
                ptr::write_bytes(self.0.as_ptr(), 0, offset_of!(Node256, children))
            }
        }
        let header = self.header();
        (*header).kind = kind as u8;
        // 256 wraps to 0.
        (*header).fanout = fanout as u8;
    }

    pub(crate) unsafe fn kind(self) -> Result<NodeKind, RadixTreeError> {
        NodeKind::from_u8((*self.header()).kind)
    }

    /// Raw count byte; kind 256 stores 256 as 0.
    pub(crate) unsafe fn raw_count(self) -> u8 {
        (*self.header()).count
    }

    unsafe fn set_raw_count(self, count: u8) {
        (*self.header()).count = count;
    }

    pub(crate) unsafe fn count(self) -> usize {
        let count = self.raw_count() as usize;
        if count == 0 && (*self.header()).kind == NodeKind::Node256 as u8 {
            NODE_MAX_SLOTS
        } else {
            count
        }
    }

    pub(crate) unsafe fn fanout(self) -> usize {
        match (*self.header()).fanout {
            0 => NODE_MAX_SLOTS,
            fanout => fanout as usize,
        }
    }

    pub(crate) unsafe fn must_grow(self) -> bool {
        (*self.header()).count == (*self.header()).fanout
    }

    pub(crate) unsafe fn size_class(self, shared: bool) -> Result<SizeClass, RadixTreeError> {
        Ok(match self.kind()? {
            NodeKind::Node4 => SizeClass::Node4,
            NodeKind::Node16 => {
                if self.fanout() == class_info_of(SizeClass::Node16Lo, shared).fanout {
                    SizeClass::Node16Lo
                } else {
                    SizeClass::Node16Hi
                }
            }
            NodeKind::Node48 => SizeClass::Node48,
            NodeKind::Node256 => SizeClass::Node256,
        })
    }

    /// Chunk and child arrays of a kind 4 or kind 16 node.
    unsafe fn sorted_arrays(self, kind: NodeKind) -> (*mut u8, *mut ChildPtr) {
        if kind == NodeKind::Node4 {
            (
                addr_of_mut!((*self.n4()).chunks).cast(),
                addr_of_mut!((*self.n4()).children).cast(),
            )
        } else {
            (
                addr_of_mut!((*self.n16()).chunks).cast(),
                addr_of_mut!((*self.n16()).children).cast(),
            )
        }
    }

    unsafe fn children48(self) -> *mut ChildPtr {
        addr_of_mut!((*self.n48()).children).cast()
    }

    unsafe fn children256(self) -> *mut ChildPtr {
        addr_of_mut!((*self.n256()).children).cast()
    }

    unsafe fn is_used_256(self, chunk: u8) -> bool {
        let chunk = chunk as usize;
        (*self.n256()).isset[chunk / BITS_PER_WORD] & (1 << (chunk % BITS_PER_WORD)) != 0
    }

    unsafe fn slot_idx_48(self, chunk: u8) -> u8 {
        (*self.n48()).slot_idxs[chunk as usize]
    }

    // -- search -------------------------------------------------------------

    /// The slot holding the child for `chunk`, if there is one.
    pub(crate) unsafe fn search(self, chunk: u8) -> Result<Option<*mut ChildPtr>, RadixTreeError> {
        let kind = self.kind()?;
        Ok(match kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                let (chunks, children) = self.sorted_arrays(kind);
                let chunks = core::slice::from_raw_parts(chunks, self.count());
                chunks
                    .iter()
                    .position(|&c| c == chunk)
                    .map(|i| children.add(i))
            }
            NodeKind::Node48 => match self.slot_idx_48(chunk) {
                INVALID_SLOT_IDX => None,
                slot => Some(self.children48().add(slot as usize)),
            },
            NodeKind::Node256 => self
                .is_used_256(chunk)
                .then(|| self.children256().add(chunk as usize)),
        })
    }

    // -- insertion without growth -------------------------------------------

    /// Adds `chunk` to a node that has room for it and returns its slot.
    pub(crate) unsafe fn add_child(self, chunk: u8) -> Result<*mut ChildPtr, RadixTreeError> {
        let kind = self.kind()?;
        let slot = match kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                let (chunks, children) = self.sorted_arrays(kind);
                let count = self.count();
                let insertpos = core::slice::from_raw_parts(chunks, count)
                    .partition_point(|&c| c < chunk);
                let tail = count - insertpos;
                ptr::copy(chunks.add(insertpos), chunks.add(insertpos + 1), tail);
                ptr::copy(children.add(insertpos), children.add(insertpos + 1), tail);
                *chunks.add(insertpos) = chunk;
                children.add(insertpos)
            }
            NodeKind::Node48 => {
                let n48 = self.n48();
                let Some((word, bits)) = (*n48)
                    .isset
                    .iter()
                    .copied()
                    .enumerate()
                    .find(|&(_, w)| w != u64::MAX)
                else {
                    return Err(RadixTreeError::Corrupted("full node48 not grown".into()));
                };
                let insertpos = word * BITS_PER_WORD + bits.trailing_ones() as usize;
                // Sets the lowest clear bit.
                (*n48).isset[word] |= bits.wrapping_add(1);
                (*n48).slot_idxs[chunk as usize] = insertpos as u8;
                self.children48().add(insertpos)
            }
            NodeKind::Node256 => {
                let chunk_idx = chunk as usize;
                (*self.n256()).isset[chunk_idx / BITS_PER_WORD] |= 1 << (chunk_idx % BITS_PER_WORD);
                self.children256().add(chunk_idx)
            }
        };
        self.set_raw_count(self.raw_count().wrapping_add(1));
        *slot = INVALID_CHILD;
        Ok(slot)
    }

    // -- growth copies --------------------------------------------------------

    /// Fills the empty kind-16 node `self` with the entries of the full
    /// sorted node `old` plus `chunk`, returning the new chunk's slot.
    pub(crate) unsafe fn grow_sorted_from(
        self,
        old: Node,
        chunk: u8,
    ) -> Result<*mut ChildPtr, RadixTreeError> {
        let (src_chunks, src_children) = old.sorted_arrays(old.kind()?);
        let (dst_chunks, dst_children) = self.sorted_arrays(NodeKind::Node16);
        let count = old.count();
        let insertpos = core::slice::from_raw_parts(src_chunks, count)
            .partition_point(|&c| c < chunk);
        for i in 0..count {
            let dst = i + usize::from(i >= insertpos);
            *dst_chunks.add(dst) = *src_chunks.add(i);
            *dst_children.add(dst) = *src_children.add(i);
        }
        *dst_chunks.add(insertpos) = chunk;
        *dst_children.add(insertpos) = INVALID_CHILD;
        self.set_raw_count(count as u8 + 1);
        Ok(dst_children.add(insertpos))
    }

    /// Fills the empty kind-48 node `self` with the entries of the full
    /// kind-16 node `old` plus `chunk`.
    pub(crate) unsafe fn grow_48_from(self, old: Node, chunk: u8) -> *mut ChildPtr {
        let (src_chunks, src_children) = old.sorted_arrays(NodeKind::Node16);
        let count = old.count();
        let n48 = self.n48();
        for i in 0..count {
            (*n48).slot_idxs[*src_chunks.add(i) as usize] = i as u8;
        }
        ptr::copy_nonoverlapping(src_children, self.children48(), count);
        (*n48).isset[0] = (1u64 << count) - 1;
        (*n48).isset[count / BITS_PER_WORD] |= 1 << (count % BITS_PER_WORD);
        (*n48).slot_idxs[chunk as usize] = count as u8;
        let slot = self.children48().add(count);
        *slot = INVALID_CHILD;
        self.set_raw_count(count as u8 + 1);
        slot
    }

    /// Fills the empty kind-256 node `self` with the entries of the full
    /// kind-48 node `old`. The caller then adds the new chunk.
    pub(crate) unsafe fn grow_256_from(self, old: Node) {
        let n256 = self.n256();
        for (word_num, word) in (*n256).isset.iter_mut().enumerate() {
            let mut bitmap = 0u64;
            for bit in 0..BITS_PER_WORD {
                let chunk = (word_num * BITS_PER_WORD + bit) as u8;
                let offset = old.slot_idx_48(chunk);
                if offset != INVALID_SLOT_IDX {
                    bitmap |= 1 << bit;
                    *self.children256().add(chunk as usize) =
                        *old.children48().add(offset as usize);
                }
            }
            *word = bitmap;
        }
        self.set_raw_count(old.raw_count());
    }

    // -- removal --------------------------------------------------------------

    /// Index of `slot` in a sorted node's child array.
    pub(crate) unsafe fn slot_position(self, slot: *mut ChildPtr) -> Result<usize, RadixTreeError> {
        let (_, children) = self.sorted_arrays(self.kind()?);
        Ok(slot.offset_from(children) as usize)
    }

    /// Removes the entry at `deletepos` from a sorted node.
    pub(crate) unsafe fn remove_sorted(self, deletepos: usize) -> Result<(), RadixTreeError> {
        let (chunks, children) = self.sorted_arrays(self.kind()?);
        let count = self.count();
        let tail = count - deletepos - 1;
        ptr::copy(chunks.add(deletepos + 1), chunks.add(deletepos), tail);
        ptr::copy(children.add(deletepos + 1), children.add(deletepos), tail);
        self.set_raw_count(count as u8 - 1);
        Ok(())
    }

    pub(crate) unsafe fn remove_48(self, chunk: u8) {
        let n48 = self.n48();
        let deletepos = (*n48).slot_idxs[chunk as usize] as usize;
        (*n48).isset[deletepos / BITS_PER_WORD] &= !(1 << (deletepos % BITS_PER_WORD));
        (*n48).slot_idxs[chunk as usize] = INVALID_SLOT_IDX;
        self.set_raw_count(self.raw_count() - 1);
    }

    pub(crate) unsafe fn remove_256(self, chunk: u8) {
        let chunk = chunk as usize;
        (*self.n256()).isset[chunk / BITS_PER_WORD] &= !(1 << (chunk % BITS_PER_WORD));
        self.set_raw_count(self.raw_count().wrapping_sub(1));
    }

    // -- shrink copies --------------------------------------------------------

    /// Fills the empty kind-4 node `self` with every entry of the sorted
    /// node `old` except the one at `deletepos`.
    pub(crate) unsafe fn shrink_4_from(self, old: Node, deletepos: usize) -> Result<(), RadixTreeError> {
        let (src_chunks, src_children) = old.sorted_arrays(old.kind()?);
        let (dst_chunks, dst_children) = self.sorted_arrays(NodeKind::Node4);
        let count = old.count();
        for i in 0..count - 1 {
            let src = i + usize::from(i >= deletepos);
            *dst_chunks.add(i) = *src_chunks.add(src);
            *dst_children.add(i) = *src_children.add(src);
        }
        self.set_raw_count(count as u8 - 1);
        Ok(())
    }

    /// Fills the empty kind-16 node `self` with the entries of the kind-48
    /// node `old`, in chunk order.
    pub(crate) unsafe fn shrink_16_from(self, old: Node) {
        let (dst_chunks, dst_children) = self.sorted_arrays(NodeKind::Node16);
        let mut destidx = 0;
        for chunk in 0..NODE_MAX_SLOTS {
            let slot = old.slot_idx_48(chunk as u8);
            if slot != INVALID_SLOT_IDX {
                *dst_chunks.add(destidx) = chunk as u8;
                *dst_children.add(destidx) = *old.children48().add(slot as usize);
                destidx += 1;
            }
        }
        self.set_raw_count(destidx as u8);
    }

    /// Fills the empty kind-48 node `self` with the entries of the kind-256
    /// node `old`.
    pub(crate) unsafe fn shrink_48_from(self, old: Node) {
        let n48 = self.n48();
        let mut slot_idx = 0usize;
        for chunk in 0..NODE_MAX_SLOTS {
            if old.is_used_256(chunk as u8) {
                (*n48).slot_idxs[chunk] = slot_idx as u8;
                *self.children48().add(slot_idx) = *old.children256().add(chunk);
                slot_idx += 1;
            }
        }
        (*n48).isset[0] = if slot_idx == BITS_PER_WORD {
            u64::MAX
        } else {
            (1u64 << slot_idx) - 1
        };
        self.set_raw_count(slot_idx as u8);
    }

    // -- iteration ------------------------------------------------------------

    /// The first used entry at or after position `*idx`, in chunk order.
    /// Advances `*idx` past it.
    pub(crate) unsafe fn next_child(
        self,
        idx: &mut usize,
    ) -> Result<Option<(u8, *mut ChildPtr)>, RadixTreeError> {
        let kind = self.kind()?;
        let found = match kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                if *idx >= self.count() {
                    return Ok(None);
                }
                let (chunks, children) = self.sorted_arrays(kind);
                let entry = (*chunks.add(*idx), children.add(*idx));
                *idx += 1;
                entry
            }
            NodeKind::Node48 => {
                let Some(chunk) =
                    (*idx..NODE_MAX_SLOTS).find(|&c| self.slot_idx_48(c as u8) != INVALID_SLOT_IDX)
                else {
                    *idx = NODE_MAX_SLOTS;
                    return Ok(None);
                };
                *idx = chunk + 1;
                let slot = self.slot_idx_48(chunk as u8) as usize;
                (chunk as u8, self.children48().add(slot))
            }
            NodeKind::Node256 => {
                let Some(chunk) = (*idx..NODE_MAX_SLOTS).find(|&c| self.is_used_256(c as u8))
                else {
                    *idx = NODE_MAX_SLOTS;
                    return Ok(None);
                };
                *idx = chunk + 1;
                (chunk as u8, self.children256().add(chunk))
            }
        };
        Ok(Some(found))
    }

    // -- verification ---------------------------------------------------------

    /// Checks the structural invariants of this node.
    pub(crate) unsafe fn verify(self) -> Result<(), RadixTreeError> {
        let kind = self.kind()?;
        let count = self.count();
        let fanout = self.fanout();
        if count > fanout {
            return Err(RadixTreeError::Corrupted(format!(
                "node{} holds {count} children but has room for {fanout}",
                kind.nominal_fanout()
            )));
        }
        match kind {
            NodeKind::Node4 | NodeKind::Node16 => {
                let (chunks, _) = self.sorted_arrays(kind);
                let chunks = core::slice::from_raw_parts(chunks, count);
                if chunks.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(RadixTreeError::Corrupted(format!(
                        "node{} chunks are not strictly ascending: {chunks:?}",
                        kind.nominal_fanout()
                    )));
                }
            }
            NodeKind::Node48 => {
                let n48 = self.n48();
                let mut used = 0;
                for chunk in 0..NODE_MAX_SLOTS {
                    let slot = self.slot_idx_48(chunk as u8) as usize;
                    if slot == INVALID_SLOT_IDX as usize {
                        continue;
                    }
                    used += 1;
                    if slot >= fanout
                        || (*n48).isset[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) == 0
                    {
                        return Err(RadixTreeError::Corrupted(format!(
                            "node48 chunk {chunk} points at unused slot {slot}"
                        )));
                    }
                }
                let set: u32 = (*n48).isset.iter().map(|w| w.count_ones()).sum();
                if used != count || set as usize != count {
                    return Err(RadixTreeError::Corrupted(format!(
                        "node48 count {count} disagrees with {used} mapped chunks and {set} used slots"
                    )));
                }
            }
            NodeKind::Node256 => {
                let set: u32 = (*self.n256()).isset.iter().map(|w| w.count_ones()).sum();
                if set as usize != count {
                    return Err(RadixTreeError::Corrupted(format!(
                        "node256 count {count} disagrees with {set} used slots"
                    )));
                }
            }
        }
        Ok(())
    }
}
