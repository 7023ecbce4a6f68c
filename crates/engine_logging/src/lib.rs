#![deny(missing_docs)]
//! Shared logging utilities for the downloader workspace.
//!
//! This crate provides the `engine_*` logging macros used across the codebase,
//! a per-thread poll tick counter that the orchestrator's poll loop stamps on
//! its tick-level diagnostics, and a minimal test initializer for the global
//! logger.

use std::cell::Cell;

#[doc(hidden)]
pub use log;

thread_local! {
    /// Poll tick of the loop running on the current thread.
    static POLL_TICK: Cell<u64> = const { Cell::new(0) };
}

/// Records the poll tick for the current thread.
/// The orchestrator's poll loop calls this once per tick.
pub fn set_poll_tick(tick: u64) {
    POLL_TICK.with(|v| v.set(tick));
}

/// Returns the poll tick recorded on the current thread, or 0 outside the poll loop.
pub fn poll_tick() -> u64 {
    POLL_TICK.with(|v| v.get())
}

/// Logs a trace-level message using the global logging facade.
#[macro_export]
macro_rules! engine_trace {
    ($($arg:tt)*) => {{
        $crate::log::trace!($($arg)*);
    }};
}

/// Logs a debug-level message using the global logging facade.
#[macro_export]
macro_rules! engine_debug {
    ($($arg:tt)*) => {{
        $crate::log::debug!($($arg)*);
    }};
}

/// Logs an info-level message using the global logging facade.
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => {{
        $crate::log::info!($($arg)*);
    }};
}

/// Logs a warn-level message using the global logging facade.
#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => {{
        $crate::log::warn!($($arg)*);
    }};
}

/// Logs an error-level message using the global logging facade.
#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => {{
        $crate::log::error!($($arg)*);
    }};
}

/// Initializes a terminal logger for use in tests.
///
/// Safe to call from every test: it no-ops once a logger is installed.
pub fn initialize_for_tests() {
    use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

    let level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let _ = TermLogger::init(level, Config::default(), TerminalMode::Mixed, ColorChoice::Never);
}

#[cfg(test)]
mod tests {
    use super::{poll_tick, set_poll_tick};

    #[test]
    fn poll_tick_is_per_thread() {
        set_poll_tick(7);
        assert_eq!(poll_tick(), 7);

        let other = std::thread::spawn(poll_tick).join().unwrap();
        assert_eq!(other, 0);
    }
}
