// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::node::{ChildPtr, SLOT_SIZE};
use core::mem::{align_of, size_of};

/// Types a radix tree can map keys to.
///
/// Values are copied into the tree byte for byte and are never dropped by
/// it. A fixed-size value no larger than a child slot is kept in the slot
/// itself; anything else gets a leaf allocation of its own.
///
/// A variable-length type (`VARIABLE_LENGTH = true`) starts with a header
/// of type `Self` and continues with `value_size() - size_of::<Self>()`
/// trailing bytes. Such a value is kept in the slot when both the header
/// and the whole value fit, and the tree then sets bit 0 of its first byte
/// to tell it apart from a leaf pointer.
///
/// # Safety
/// `value_size` bytes starting at `self` must be readable for every value
/// passed to the tree. `value_size` must give the same answer for the copy
/// the tree stores. A variable-length type must leave bit 0 of its first
/// byte unused and must not depend on it in `value_size`. The alignment of
/// `Self` must not exceed 8.
pub unsafe trait TreeValue: Copy {
    const VARIABLE_LENGTH: bool = false;

    fn value_size(&self) -> usize {
        size_of::<Self>()
    }
}

macro_rules! impl_tree_value {
    ($($ty:ty),* $(,)?) => {
        $(
            // SAFETY: plain fixed-size data.
            unsafe impl TreeValue for $ty {}
        )*
    };
}

impl_tree_value!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, bool, f32, f64);

// SAFETY: plain fixed-size data.
unsafe impl<T: TreeValue, const N: usize> TreeValue for [T; N] {}

/// Whether every value of `V` lives in its child slot.
pub(crate) const fn always_embedded<V: TreeValue>() -> bool {
    !V::VARIABLE_LENGTH && size_of::<V>() <= SLOT_SIZE
}

pub(crate) const fn check_alignment<V: TreeValue>() {
    assert!(
        align_of::<V>() <= SLOT_SIZE,
        "radix tree values must not need more than 8-byte alignment"
    );
}

pub(crate) fn is_embeddable<V: TreeValue>(value: &V) -> bool {
    if V::VARIABLE_LENGTH {
        size_of::<V>() <= SLOT_SIZE && value.value_size() <= SLOT_SIZE
    } else {
        always_embedded::<V>()
    }
}

/// Whether a slot at the leaf level holds a value rather than a pointer to
/// one.
pub(crate) fn child_is_value<V: TreeValue>(child: ChildPtr) -> bool {
    if V::VARIABLE_LENGTH {
        child & 1 != 0
    } else {
        always_embedded::<V>()
    }
}
