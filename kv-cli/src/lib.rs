//! `yesquel` admin CLI. [Author fengyang]
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./yesquel
//!
//! ██  ██  █        █
//! ██ ██   ██      ██
//! ███      ██    ██
//! ██ ██     ██  ██
//! ██  ██     ████  KV Storage CLI
//!
//! Welcome to yesquel.
//! Connecting to local server state.
//!
//! yesquel > BEGIN
//! tx 1 started
//!
//! yesquel > PUT 1 7:1 hello
//! OK
//!
//! yesquel > GET 1 7:1
//! hello
//!
//! yesquel > COMMIT 1
//! committed at ts 2
//! ```

pub mod progressbar;
pub mod trace;
pub mod rusty;
pub mod show;
pub mod server;

use crate::progressbar::ProgressOutput;

/// The global progress bar and user-facing message output.
pub static PBAR: ProgressOutput = ProgressOutput::new();
