//! The server-side transaction runtime: the per-COID cache and op log
//! (`cache`), durable checkpoint persistence (`checkpoint`), the commit
//! protocol (`commit`), and the client-facing channel abstraction
//! (`channel`).

pub mod cache;
pub mod channel;
pub mod checkpoint;
pub mod commit;
