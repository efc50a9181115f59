pub mod mvcc;
pub mod scan;
pub mod transaction;

/// An MVCC version represents a logical timestamp. The latest version is incremented
/// when beginning each read-write transaction.
pub type Version = u64;
