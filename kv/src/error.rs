use std::fmt::{self, Display, Formatter};

/// Reasons a transaction can be forced to abort, matching the different
/// concurrency-control conflicts the commit protocol can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// another transaction committed a conflicting write first
    Conflict,
    /// the snapshot this transaction read from is no longer valid
    StaleRead,
    /// a participant rejected the prepare phase
    PrepareReject,
    /// the transaction ran past its deadline
    Timeout,
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Conflict => write!(f, "conflict"),
            AbortReason::StaleRead => write!(f, "stale read"),
            AbortReason::PrepareReject => write!(f, "prepare rejected"),
            AbortReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Errors returned by the core engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// the transaction could not be committed, see [`AbortReason`]
    TransactionAbort(AbortReason),
    /// a value was read or written with the wrong shape (blob vs super-value)
    WrongType,
    /// on-disk or in-memory state was found to be inconsistent; fatal
    Corruption(String),
    /// an I/O operation failed
    Io(String),
    /// a resource limit (disk, memory, id space) was exhausted
    OutOfResource(String),
    /// a catch-all internal error, usually a poisoned lock or a bug
    Internal(String),
    /// a malformed value was supplied by a caller
    Value(String),
    /// a (de)serialization error
    Parse(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransactionAbort(reason) => write!(f, "transaction aborted: {}", reason),
            Error::WrongType => write!(f, "wrong value type"),
            Error::Corruption(msg) => write!(f, "corruption: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::OutOfResource(msg) => write!(f, "out of resource: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Value(msg) => write!(f, "invalid value: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("poisoned lock: {}", err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

/// Exit codes for the admin CLI, per the external-interfaces contract:
/// 0 ok, 1 usage error, 2 engine/storage error, 3 transaction aborted,
/// 4 internal/corruption error.
impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::TransactionAbort(_) => 3,
            Error::WrongType | Error::Value(_) | Error::Parse(_) => 1,
            Error::Io(_) | Error::OutOfResource(_) => 2,
            Error::Corruption(_) | Error::Internal(_) => 4,
        }
    }
}

pub type CResult<T> = Result<T, Error>;
