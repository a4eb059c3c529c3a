// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use core::fmt;
use core::str::FromStr;

pub type Oid = u32;
pub type BlockNumber = u32;
pub type ForkNumber = u32;

/// Database id of objects shared by every database.
pub const INVALID_OID: Oid = 0;

pub const MAIN_FORKNUM: ForkNumber = 0;
pub const FSM_FORKNUM: ForkNumber = 1;
pub const VISIBILITYMAP_FORKNUM: ForkNumber = 2;
pub const INIT_FORKNUM: ForkNumber = 3;
pub const MAX_FORKNUM: ForkNumber = INIT_FORKNUM;

/// One block found in the buffer pool. Records sort by database first, so a
/// sorted dump holds each database's blocks together, in file order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct BlockInfoRecord {
    pub database: Oid,
    pub tablespace: Oid,
    pub filenumber: u32,
    pub forknum: ForkNumber,
    pub blocknum: BlockNumber,
}

impl BlockInfoRecord {
    pub fn is_global(&self) -> bool {
        self.database == INVALID_OID
    }
}

/// The dump file line, without the newline.
impl fmt::Display for BlockInfoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.database, self.tablespace, self.filenumber, self.forknum, self.blocknum
        )
    }
}

impl FromStr for BlockInfoRecord {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.trim().split(',').map(|field| field.trim().parse::<u32>());
        let mut next = |name: &str| -> anyhow::Result<u32> {
            fields
                .next()
                .with_context(|| format!("missing {name}"))?
                .with_context(|| format!("invalid {name}"))
        };
        let record = BlockInfoRecord {
            database: next("database")?,
            tablespace: next("tablespace")?,
            filenumber: next("filenumber")?,
            forknum: next("fork number")?,
            blocknum: next("block number")?,
        };
        anyhow::ensure!(fields.next().is_none(), "trailing fields");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(database: Oid, filenumber: u32, blocknum: BlockNumber) -> BlockInfoRecord {
        BlockInfoRecord {
            database,
            tablespace: 1663,
            filenumber,
            forknum: MAIN_FORKNUM,
            blocknum,
        }
    }

    #[test]
    fn sorts_by_database_then_location() {
        let mut records = vec![record(5, 2, 0), record(0, 9, 1), record(5, 1, 7), record(5, 1, 3)];
        records.sort();
        assert_eq!(
            records,
            vec![record(0, 9, 1), record(5, 1, 3), record(5, 1, 7), record(5, 2, 0)]
        );
        assert!(records[0].is_global());
    }

    #[test]
    fn line_format() {
        let rec = BlockInfoRecord {
            database: 16384,
            tablespace: 1663,
            filenumber: 16385,
            forknum: VISIBILITYMAP_FORKNUM,
            blocknum: 42,
        };
        assert_eq!(rec.to_string(), "16384,1663,16385,2,42");
        assert_eq!("16384,1663,16385,2,42".parse::<BlockInfoRecord>().unwrap(), rec);
        assert_eq!(" 16384, 1663,16385,2,42 \r".parse::<BlockInfoRecord>().unwrap(), rec);
    }

    #[test]
    fn rejects_malformed_lines() {
        for line in ["", "1,2,3,4", "1,2,3,4,5,6", "1,2,x,4,5", "1,2,3,-4,5", "1,2,3,4,99999999999"] {
            assert!(line.parse::<BlockInfoRecord>().is_err(), "{line:?}");
        }
    }
}
