//! Engine configuration: the knobs that control split policy, commit
//! protocol variant, log retention and checkpointing, and the server's
//! listening port. Loaded from a `key = value` text file (one setting per
//! line, `#`-prefixed lines ignored), whose path defaults to `config.txt`
//! but can be overridden with the `YESQUEL_CONFIG` environment variable.
//! Defaults mirror the source system's compile-time knobs in `options.h`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Env var naming an override config file path, matching the source
/// system's `GAIACONFIG_ENV`.
pub const CONFIG_ENV: &str = "YESQUEL_CONFIG";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.txt";

/// Where a B-tree node split is decided: by the client that noticed the
/// node got too big, or by the storage server hosting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitLocation {
    Client,
    Server,
}

impl fmt::Display for SplitLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitLocation::Client => write!(f, "client"),
            SplitLocation::Server => write!(f, "server"),
        }
    }
}

impl std::str::FromStr for SplitLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(SplitLocation::Client),
            "server" => Ok(SplitLocation::Server),
            other => Err(Error::Parse(format!("invalid split-location {other:?}, expected client or server"))),
        }
    }
}

/// Every setting from the configuration table, with the same defaults the
/// source system bakes in at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub split_location: SplitLocation,
    pub split_cells: u32,
    pub split_bytes: u32,
    pub load_splits: bool,
    pub write_on_prepare_bytes: u32,
    pub one_phase_commit: bool,
    pub occ: bool,
    pub non_commutative: bool,
    pub delrange_conflict_delrange: bool,
    pub log_retention_ms: u64,
    pub checkpoint_min_items: u32,
    pub checkpoint_min_adds: u32,
    pub checkpoint_min_delranges: u32,
    pub disk_log: bool,
    pub disk_log_fsync: bool,
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            split_location: SplitLocation::Server,
            split_cells: 50,
            split_bytes: 8000,
            load_splits: false,
            write_on_prepare_bytes: 4096,
            one_phase_commit: true,
            occ: false,
            non_commutative: false,
            delrange_conflict_delrange: true,
            log_retention_ms: 3000,
            checkpoint_min_items: 15,
            checkpoint_min_adds: 10,
            checkpoint_min_delranges: 1,
            disk_log: true,
            disk_log_fsync: false,
            server_port: 11223,
        }
    }
}

impl Config {
    /// Loads configuration from the path named by `YESQUEL_CONFIG`, falling
    /// back to `config.txt` in the current directory. Missing files are not
    /// an error: defaults apply and the file is simply never read.
    pub fn load() -> CResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILENAME.to_string());
        let mut config = Config::default();
        if Path::new(&path).exists() {
            let text = std::fs::read_to_string(&path)?;
            config.apply_text(&text)?;
        }
        config.fix_settings();
        Ok(config)
    }

    /// Parses `key = value` lines (blank lines and `#` comments ignored)
    /// and applies each setting, same shape as `ConfigLoad::inject_cmd` but
    /// for a flat on-disk file rather than an interactive `\set`.
    pub fn apply_text(&mut self, text: &str) -> CResult<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Parse(format!("malformed config line {line:?}, expected key = value")))?;
            self.inject_cmd(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Applies one named setting, used by both [`Config::apply_text`] and
    /// any future admin-CLI `set` command.
    pub fn inject_cmd(&mut self, name: &str, value: &str) -> CResult<()> {
        match name {
            "split-location" => self.split_location = value.parse()?,
            "split-cells" => self.split_cells = parse_int(name, value)?,
            "split-bytes" => self.split_bytes = parse_int(name, value)?,
            "load-splits" => self.load_splits = parse_bool(name, value)?,
            "write-on-prepare-bytes" => self.write_on_prepare_bytes = parse_int(name, value)?,
            "one-phase-commit" => self.one_phase_commit = parse_bool(name, value)?,
            "occ" => self.occ = parse_bool(name, value)?,
            "non-commutative" => self.non_commutative = parse_bool(name, value)?,
            "delrange-conflict-delrange" => self.delrange_conflict_delrange = parse_bool(name, value)?,
            "log-retention-ms" => self.log_retention_ms = parse_int(name, value)?,
            "checkpoint-min-items" => self.checkpoint_min_items = parse_int(name, value)?,
            "checkpoint-min-adds" => self.checkpoint_min_adds = parse_int(name, value)?,
            "checkpoint-min-delranges" => self.checkpoint_min_delranges = parse_int(name, value)?,
            "disk-log" => self.disk_log = parse_bool(name, value)?,
            "disk-log-fsync" => self.disk_log_fsync = parse_bool(name, value)?,
            "server-port" => self.server_port = parse_int(name, value)?,
            other => return Err(Error::Parse(format!("unknown config option {other:?}"))),
        }
        Ok(())
    }

    /// Enforces cross-setting consistency: fsync-on-log-write is meaningless
    /// without disk logging, and `load-splits` only applies to server-side
    /// splitting (mirrors `DTREE_LOADSPLITS`'s dependency on
    /// `DTREE_SPLIT_LOCATION==2` in the source system).
    pub fn fix_settings(&mut self) {
        if !self.disk_log {
            self.disk_log_fsync = false;
        }
        if self.split_location != SplitLocation::Server {
            self.load_splits = false;
        }
    }

    /// Dumps all settings back to `key = value` lines, in table order.
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        let mut m = HashMap::new();
        m.insert("split-location", self.split_location.to_string());
        m.insert("split-cells", self.split_cells.to_string());
        m.insert("split-bytes", self.split_bytes.to_string());
        m.insert("load-splits", self.load_splits.to_string());
        m.insert("write-on-prepare-bytes", self.write_on_prepare_bytes.to_string());
        m.insert("one-phase-commit", self.one_phase_commit.to_string());
        m.insert("occ", self.occ.to_string());
        m.insert("non-commutative", self.non_commutative.to_string());
        m.insert("delrange-conflict-delrange", self.delrange_conflict_delrange.to_string());
        m.insert("log-retention-ms", self.log_retention_ms.to_string());
        m.insert("checkpoint-min-items", self.checkpoint_min_items.to_string());
        m.insert("checkpoint-min-adds", self.checkpoint_min_adds.to_string());
        m.insert("checkpoint-min-delranges", self.checkpoint_min_delranges.to_string());
        m.insert("disk-log", self.disk_log.to_string());
        m.insert("disk-log-fsync", self.disk_log_fsync.to_string());
        m.insert("server-port", self.server_port.to_string());
        m
    }
}

fn parse_bool(name: &str, value: &str) -> CResult<bool> {
    value.parse().map_err(|_| Error::Parse(format!("{name} expects a bool, got {value:?}")))
}

fn parse_int<T: std::str::FromStr>(name: &str, value: &str) -> CResult<T> {
    value.parse().map_err(|_| Error::Parse(format!("{name} expects an integer, got {value:?}")))
}
