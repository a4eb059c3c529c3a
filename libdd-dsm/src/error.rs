// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::DsmHandle;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DsmError {
    #[error("out of shared memory: no free segment key for a {size} byte segment after {attempts} attempts")]
    OutOfMemory { size: usize, attempts: u32 },
    #[error("dynamic shared memory segment {handle} is corrupted: {reason}")]
    Corrupted {
        handle: DsmHandle,
        reason: &'static str,
    },
    #[error("dynamic shared memory segment {0} does not exist")]
    NotFound(DsmHandle),
    #[error("{0}")]
    Misuse(String),
    #[error("dynamic shared memory I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::Error> for DsmError {
    fn from(err: nix::Error) -> Self {
        DsmError::Io(err.into())
    }
}
