// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_dsa::DsaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RadixTreeError {
    #[error("out of memory: failed on radix tree request of size {requested}")]
    OutOfMemory { requested: usize },
    #[error("radix tree is corrupted: {0}")]
    Corrupted(String),
    #[error(transparent)]
    Dsa(#[from] DsaError),
}

impl RadixTreeError {
    /// Whether the failure was running out of memory, locally or in the
    /// area.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            RadixTreeError::OutOfMemory { .. } | RadixTreeError::Dsa(DsaError::OutOfMemory { .. })
        )
    }
}
