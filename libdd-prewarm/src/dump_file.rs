// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The block dump file.
//!
//! ```text
//! <<3>>
//! 0,1664,1262,0,0
//! 16384,1663,16385,0,0
//! 16384,1663,16385,0,1
//! ```
//!
//! The first line counts the records; each following line is one
//! [`BlockInfoRecord`]. Lines past the count are ignored.

use crate::record::BlockInfoRecord;
use anyhow::Context;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Writes `records` to `transient`, syncs it and renames it over `path`.
/// The transient file is removed if anything fails.
pub fn write(path: &Path, transient: &Path, records: &[BlockInfoRecord]) -> anyhow::Result<()> {
    let result = write_transient(transient, records).and_then(|()| {
        fs::rename(transient, path).with_context(|| {
            format!(
                "could not rename file {} to {}",
                transient.display(),
                path.display()
            )
        })
    });
    if let Err(err) = result {
        if let Err(unlink_err) = fs::remove_file(transient) {
            if unlink_err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(%unlink_err, path = %transient.display(), "could not remove transient dump file");
            }
        }
        return Err(err);
    }
    sync_parent(path);
    Ok(())
}

fn write_transient(transient: &Path, records: &[BlockInfoRecord]) -> anyhow::Result<()> {
    let file = File::create(transient)
        .with_context(|| format!("could not open file {}", transient.display()))?;
    let mut out = BufWriter::new(file);
    let write_err = || format!("could not write to file {}", transient.display());
    writeln!(out, "<<{}>>", records.len()).with_context(write_err)?;
    for record in records {
        writeln!(out, "{record}").with_context(write_err)?;
    }
    let file = out
        .into_inner()
        .map_err(io::IntoInnerError::into_error)
        .with_context(write_err)?;
    file.sync_all()
        .with_context(|| format!("could not fsync file {}", transient.display()))
}

/// Makes the rename durable. Best effort: the data itself is already synced.
fn sync_parent(path: &Path) {
    let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return;
    };
    if let Err(err) = File::open(dir).and_then(|dir| dir.sync_all()) {
        tracing::warn!(%err, dir = %dir.display(), "could not fsync dump file directory");
    }
}

/// Reads a dump file. A missing file is `Ok(None)`.
pub fn read(path: &Path) -> anyhow::Result<Option<Vec<BlockInfoRecord>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("could not read file {}", path.display()))
        }
    };
    let mut lines = BufReader::new(file).lines();
    let corrupted = |line: usize| {
        format!(
            "autoprewarm block dump file {} is corrupted at line {line}",
            path.display()
        )
    };

    let header = lines
        .next()
        .transpose()
        .with_context(|| format!("could not read from file {}", path.display()))?
        .unwrap_or_default();
    let count = parse_header(&header).with_context(|| corrupted(1))?;

    let mut records = Vec::with_capacity(count.min(1 << 20));
    for index in 0..count {
        let line_number = index + 2;
        let line = lines
            .next()
            .transpose()
            .with_context(|| format!("could not read from file {}", path.display()))?
            .with_context(|| corrupted(line_number))?;
        let record = line
            .parse::<BlockInfoRecord>()
            .with_context(|| corrupted(line_number))?;
        records.push(record);
    }
    Ok(Some(records))
}

fn parse_header(line: &str) -> anyhow::Result<usize> {
    let count = line
        .trim()
        .strip_prefix("<<")
        .and_then(|rest| rest.strip_suffix(">>"))
        .context("missing record count")?;
    count
        .trim()
        .parse::<usize>()
        .context("invalid record count")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAIN_FORKNUM;

    fn records() -> Vec<BlockInfoRecord> {
        (0..5)
            .map(|blocknum| BlockInfoRecord {
                database: 16384,
                tablespace: 1663,
                filenumber: 16385 + blocknum % 2,
                forknum: MAIN_FORKNUM,
                blocknum,
            })
            .collect()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoprewarm.blocks");
        let transient = dir.path().join("autoprewarm.blocks.tmp");
        write(&path, &transient, &records()).unwrap();
        assert!(!transient.exists());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("<<5>>\n16384,1663,16385,0,0\n16384,1663,16386,0,1\n"));
        assert_eq!(read(&path).unwrap(), Some(records()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(&dir.path().join("nothing")).unwrap(), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn corruption_reports_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let cases = [
            ("", 1),
            ("<<x>>\n", 1),
            ("3\n1,2,3,0,4\n", 1),
            ("<<2>>\n1,2,3,0,4\n1,2,3\n", 3),
            ("<<3>>\n1,2,3,0,4\n1,2,3,0,5\n", 4),
        ];
        for (text, line) in cases {
            fs::write(&path, text).unwrap();
            let err = read(&path).unwrap_err();
            assert!(
                err.to_string().ends_with(&format!("corrupted at line {line}")),
                "{text:?}: {err}"
            );
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn extra_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        fs::write(&path, "<<1>>\n1,2,3,0,4\nwhatever\n").unwrap();
        assert_eq!(read(&path).unwrap().unwrap().len(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn failed_rename_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        // Renaming a file over a non-empty directory fails.
        let path = dir.path().join("taken");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "").unwrap();
        let transient = dir.path().join("taken.tmp");
        assert!(write(&path, &transient, &records()).is_err());
        assert!(!transient.exists());
    }
}
