//! Durable checkpoint/manifest persistence (§6's "complementary flat dump
//! file"): a full snapshot of every live COID, written to a flat file
//! (default `kv.dat`) using the same write-new-then-atomic-rename
//! discipline `storage::log_cask::LogCask::compact` uses for its own log
//! compaction, so a crash mid-write never leaves a half-written dump in
//! place of the previous good one.
//!
//! This replaces the teacher's all-`todo!()` `mani_fest_cstore.rs` stub,
//! which carried no working compaction logic to generalize.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::coid::Coid;
use crate::error::CResult;
use crate::mvcc::Version;
use crate::value::{Blob, Cell, KeyInfo, SuperValue, Value};

pub const DEFAULT_DUMP_FILENAME: &str = "kv.dat";

/// A value, flattened into a serializable shape. `SuperValue`'s `KeyInfo`
/// carries an optional comparator closure and so cannot round-trip through
/// serde; every super-value reloaded from a checkpoint gets the B-tree's
/// default ascending-numeric `KeyInfo` (see DESIGN.md).
#[derive(Clone, Debug, Serialize, Deserialize)]
enum DumpValue {
    Blob(Vec<u8>),
    Super { cells: Vec<Cell>, attrs: Vec<(u32, u64)> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DumpEntry {
    coid: Coid,
    version: Version,
    value: Option<DumpValue>,
}

fn to_dump_value(value: &Value) -> DumpValue {
    match value {
        Value::Blob(blob) => DumpValue::Blob(blob.as_slice().to_vec()),
        Value::Super(sv) => DumpValue::Super { cells: sv.cells().to_vec(), attrs: sv.attrs().collect() },
    }
}

fn from_dump_value(dump: DumpValue) -> Value {
    match dump {
        DumpValue::Blob(bytes) => Value::Blob(Blob::new(bytes)),
        DumpValue::Super { cells, attrs } => {
            let mut sv = SuperValue::new(KeyInfo::numeric_ascending());
            for cell in cells {
                sv.insert_cell(cell);
            }
            for (id, value) in attrs {
                sv.set_attr(id, value);
            }
            Value::Super(sv)
        }
    }
}

/// Reads and writes the full-snapshot dump file.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        CheckpointStore { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes a full snapshot of `entries` (coid -> (version, value)) to
    /// the dump file. `value: None` records a tombstoned COID.
    pub fn save(&self, entries: &HashMap<Coid, (Version, Option<Value>)>) -> CResult<()> {
        let dump: Vec<DumpEntry> = entries
            .iter()
            .map(|(&coid, (version, value))| DumpEntry {
                coid,
                version: *version,
                value: value.as_ref().map(to_dump_value),
            })
            .collect();
        let bytes = bincode::serialize(&dump)?;

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Loads the dump file, or an empty map if it has never been written.
    pub fn load(&self) -> CResult<HashMap<Coid, (Version, Option<Value>)>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&self.path)?;
        let dump: Vec<DumpEntry> = bincode::deserialize(&bytes)?;
        Ok(dump.into_iter().map(|e| (e.coid, (e.version, e.value.map(from_dump_value)))).collect())
    }
}
