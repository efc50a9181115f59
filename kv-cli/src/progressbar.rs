//! Quiet-mode-aware status output, backed by `indicatif` for the spinner
//! shown while a long-running admin command (e.g. `SPLIT`) is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

pub struct ProgressOutput {
    quiet: AtomicBool,
    spinner: Mutex<Option<ProgressBar>>,
}

impl ProgressOutput {
    pub const fn new() -> Self {
        ProgressOutput { quiet: AtomicBool::new(false), spinner: Mutex::new(None) }
    }

    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::SeqCst);
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::SeqCst)
    }

    /// Starts a spinner with `message`, unless quiet mode is on.
    pub fn step(&self, message: &str) {
        if self.is_quiet() {
            return;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner:.green} {msg}").expect("valid template"));
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        *self.spinner.lock().expect("progress lock poisoned") = Some(pb);
    }

    /// Clears the current spinner, if any, printing `message` in its place.
    pub fn done(&self, message: &str) {
        if let Some(pb) = self.spinner.lock().expect("progress lock poisoned").take() {
            pb.finish_with_message(message.to_string());
        } else if !self.is_quiet() {
            eprintln!("{}", message);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{}", message);
    }
}

impl Default for ProgressOutput {
    fn default() -> Self {
        Self::new()
    }
}
