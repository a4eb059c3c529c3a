// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_dsa::DsaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DshashError {
    #[error("hash table is corrupted: {0}")]
    Corrupted(String),
    #[error("{0}")]
    Misuse(String),
    #[error(transparent)]
    Dsa(#[from] DsaError),
}
