// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ready-made hash and compare functions for [`DshashParameters`].
//!
//! Hashes must be deterministic across processes, so none of these use a
//! randomly seeded hasher.
//!
//! [`DshashParameters`]: crate::DshashParameters

use core::cmp::Ordering;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over all key bytes, followed by a final avalanche so that the high
/// bits, which pick the partition and bucket, depend on every input byte.
pub fn memhash(key: &[u8]) -> u32 {
    let mut h = FNV_OFFSET_BASIS;
    for &b in key {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    finalize(h)
}

pub fn memcmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Keys holding a NUL-terminated string; bytes after the first NUL are
/// ignored. A key without a NUL uses all of its bytes.
pub fn strhash(key: &[u8]) -> u32 {
    memhash(until_nul(key))
}

pub fn strcmp(a: &[u8], b: &[u8]) -> Ordering {
    until_nul(a).cmp(until_nul(b))
}

fn until_nul(key: &[u8]) -> &[u8] {
    match key.iter().position(|&b| b == 0) {
        Some(len) => &key[..len],
        None => key,
    }
}

fn finalize(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}
