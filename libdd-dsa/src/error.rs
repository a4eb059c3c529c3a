// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_dsm::DsmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DsaError {
    #[error("out of memory: failed on dynamic shared memory request of size {requested}")]
    OutOfMemory { requested: usize },
    #[error("dynamic shared memory area is corrupted: {0}")]
    Corrupted(String),
    #[error("{0}")]
    Misuse(String),
    #[error(transparent)]
    Dsm(#[from] DsmError),
}
