// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use serde::{Deserialize, Serialize};

/// Bits of a [`DsaPointer`] used for the offset inside a segment.
pub const DSA_OFFSET_WIDTH: u32 = 40;
/// Segments an area can have at once.
pub const DSA_MAX_SEGMENTS: usize = 1024;
pub const DSA_OFFSET_BITMASK: u64 = (1 << DSA_OFFSET_WIDTH) - 1;
/// Largest segment a single pointer can address.
pub const DSA_MAX_SEGMENT_SIZE: usize = 1 << DSA_OFFSET_WIDTH;

/// Pointer into a dynamic shared memory area, valid in every attached
/// process. The high bits select a segment and the low
/// [`DSA_OFFSET_WIDTH`] bits are an offset inside it. Zero is null.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct DsaPointer(u64);

const _: () = assert!(DSA_MAX_SEGMENTS as u64 <= 1 << (64 - DSA_OFFSET_WIDTH));

impl DsaPointer {
    pub const NULL: DsaPointer = DsaPointer(0);

    pub const fn new(segment_index: usize, offset: usize) -> Self {
        DsaPointer(((segment_index as u64) << DSA_OFFSET_WIDTH) | offset as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        DsaPointer(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn segment_index(self) -> usize {
        (self.0 >> DSA_OFFSET_WIDTH) as usize
    }

    pub const fn segment_offset(self) -> usize {
        (self.0 & DSA_OFFSET_BITMASK) as usize
    }

    /// Pointer `bytes` further into the same segment.
    pub const fn add(self, bytes: usize) -> Self {
        DsaPointer(self.0 + bytes as u64)
    }
}

impl fmt::Debug for DsaPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("DsaPointer(null)")
        } else {
            write!(
                f,
                "DsaPointer({}:{:#x})",
                self.segment_index(),
                self.segment_offset()
            )
        }
    }
}

impl fmt::Display for DsaPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Offset from a base address, usable inside memory that is mapped at a
/// different address in each process. Stored as `offset + 1` so that zero
/// can mean null while offset zero stays addressable.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct RelPtr(usize);

impl RelPtr {
    pub const NULL: RelPtr = RelPtr(0);

    pub const fn from_offset(offset: usize) -> Self {
        RelPtr(offset.wrapping_add(1))
    }

    pub fn from_ptr<T>(base: *const u8, ptr: *const T) -> Self {
        if ptr.is_null() {
            RelPtr::NULL
        } else {
            RelPtr::from_offset((ptr as usize).wrapping_sub(base as usize))
        }
    }

    pub const fn from_raw(raw: usize) -> Self {
        RelPtr(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn offset(self) -> Option<usize> {
        self.0.checked_sub(1)
    }

    /// Turns the offset back into an address relative to `base`; null stays
    /// null.
    pub fn resolve<T>(self, base: *mut u8) -> *mut T {
        match self.offset() {
            Some(offset) => base.wrapping_add(offset).cast(),
            None => core::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_parts() {
        let p = DsaPointer::new(3, 0x1234);
        assert_eq!(p.segment_index(), 3);
        assert_eq!(p.segment_offset(), 0x1234);
        assert_eq!(p.add(8).segment_offset(), 0x123c);
        assert!(!p.is_null());
        assert!(DsaPointer::NULL.is_null());
        assert_eq!(DsaPointer::new(1023, 0).segment_index(), 1023);
        assert_eq!(format!("{:?}", DsaPointer::NULL), "DsaPointer(null)");
    }

    #[test]
    fn relptr_round_trip() {
        let mut buf = [0u64; 8];
        let base = buf.as_mut_ptr() as *mut u8;
        let at_base = RelPtr::from_ptr(base, base);
        assert!(!at_base.is_null());
        assert_eq!(at_base.offset(), Some(0));
        assert_eq!(at_base.resolve::<u8>(base), base);

        let third = unsafe { buf.as_mut_ptr().add(3) };
        let rel = RelPtr::from_ptr(base, third);
        assert_eq!(rel.offset(), Some(24));
        assert_eq!(rel.resolve::<u64>(base), third);

        let null = RelPtr::from_ptr::<u64>(base, core::ptr::null());
        assert!(null.is_null());
        assert!(null.resolve::<u64>(base).is_null());
    }
}
