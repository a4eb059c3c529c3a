// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::tid::OffsetNumber;
use libdd_dsa::DsaError;
use libdd_radixtree::RadixTreeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TidBitmapError {
    #[error("tuple offset out of range: {0}")]
    OffsetOutOfRange(OffsetNumber),
    #[error("tid bitmap is corrupted: {0}")]
    Corrupted(String),
    #[error("{0}")]
    Misuse(String),
    #[error(transparent)]
    RadixTree(#[from] RadixTreeError),
    #[error(transparent)]
    Dsa(#[from] DsaError),
}
