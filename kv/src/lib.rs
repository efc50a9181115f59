#![allow(non_camel_case_types)]

//! `kv` is a distributed, transactional key-value store: a multi-version
//! concurrency-controlled storage engine (below), a two-phase-commit
//! transaction runtime with a one-phase fast path (`mvcc`, `server`), and a
//! distributed B-tree layered on top of it (`btree`). [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use std::path::PathBuf;
//! use kv::error::Error;
//! use kv::storage::engine::Engine;
//! use kv::storage::log_cask::LogCask;
//!
//! fn run() -> Result<(), Error> {
//!     let storage_path = tempdir::TempDir::new("demo")?.path().join("kvdb");
//!
//!     let mut engine = LogCask::new(storage_path)?;
//!     engine.set(b"b", vec![0x01])?;
//!     engine.set(b"b", vec![0x02])?;
//!
//!     engine.set(b"e", vec![0x05])?;
//!     engine.delete(b"e")?;
//!
//!     // Make sure the scan yields the expected results.
//!     assert_eq!(
//!         vec![(b"b".to_vec(), vec![0x02])],
//!         engine.scan(..).collect::<Result<Vec<_>, Error>>()?,
//!     );
//!
//!     engine.flush()?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;
pub mod codec;
pub mod coid;
pub mod value;
pub mod config;
pub mod mvcc;
pub mod memkv;
pub mod server;
pub mod btree;
pub mod client;

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::storage::engine::Engine;
    use crate::storage::log_cask::LogCask;

    #[test]
    fn run() -> Result<(), Error> {
        let storage_path = "";
        let path = tempdir::TempDir::new("demo")?.path().join("whosdb");

        let mut engine = LogCask::new(path)?;
        engine.set(b"b", vec![0x01])?;
        engine.set(b"b", vec![0x02])?;

        engine.set(b"e", vec![0x05])?;
        engine.delete(b"e")?;

        engine.set(b"c", vec![0x00])?;
        engine.delete(b"c")?;
        engine.set(b"c", vec![0x03])?;

        engine.set(b"", vec![])?;

        engine.set(b"a", vec![0x01])?;

        engine.delete(b"f")?;

        engine.delete(b"d")?;
        engine.set(b"d", vec![0x04])?;

        // Make sure the scan yields the expected results.
        assert_eq!(
            vec![
                (b"".to_vec(), vec![]),
                (b"a".to_vec(), vec![0x01]),
                (b"b".to_vec(), vec![0x02]),
                (b"c".to_vec(), vec![0x03]),
                (b"d".to_vec(), vec![0x04]),
            ],
            engine.scan(..).collect::<Result<Vec<_>,Error>> ()?,
        );

        let rs = engine.flush();

        Ok(())
    }
}

