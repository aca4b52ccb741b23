//! Centralized error reporting.
//!
//! Every failure that must not crash the panel (device callbacks, automation steps,
//! interlocks, remote commands, data logging) is routed through [`ErrorReporter::report`].
//! The reporter emits a `tracing` error event under [`ERROR_TARGET`] so the console and the
//! persistent log file can treat reports separately, and keeps a bounded history that the
//! status view and tests can read back.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Tracing target used for every error report.
pub const ERROR_TARGET: &str = "daq_panel::errors";

const DEFAULT_HISTORY: usize = 200;

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// Opening or handshaking a device
    Handshake,
    /// Periodic poll
    Update,
    /// Pushing inputs to a device
    Confirm,
    /// Close callback
    Close,
    /// An automation step
    Automation,
    /// An await predicate
    AwaitCondition,
    /// An interlock check
    Interlock,
    /// Remote command server
    Socket,
    /// CSV logger
    DataLogging,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorSource::Handshake => "on_handshake",
            ErrorSource::Update => "on_update",
            ErrorSource::Confirm => "on_confirm",
            ErrorSource::Close => "on_close",
            ErrorSource::Automation => "automation",
            ErrorSource::AwaitCondition => "automation await",
            ErrorSource::Interlock => "interlock",
            ErrorSource::Socket => "socket",
            ErrorSource::DataLogging => "data logging",
        };
        f.write_str(tag)
    }
}

/// A single reported error.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Local time of the report
    pub timestamp: DateTime<Local>,
    /// Which part of the panel reported it
    pub source: ErrorSource,
    /// Widget nickname or interlock name, when there is one
    pub origin: Option<String>,
    /// Error chain, or the debug form with backtrace when stack traces are on
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} in {}",
            self.timestamp.format("%H:%M:%S"),
            self.source,
            self.origin.as_deref().unwrap_or("dashboard")
        )?;
        write!(f, ": {}", self.message)
    }
}

/// Thread-safe error sink shared by the foreground loop and every widget worker.
#[derive(Debug)]
pub struct ErrorReporter {
    print_stacktraces: bool,
    capacity: usize,
    history: Mutex<VecDeque<ErrorReport>>,
    total: AtomicU64,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(false, DEFAULT_HISTORY)
    }
}

impl ErrorReporter {
    /// Reporter keeping the last `capacity` reports. `print_stacktraces` keeps the debug form with backtrace.
    pub fn new(print_stacktraces: bool, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            print_stacktraces,
            capacity,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            total: AtomicU64::new(0),
        }
    }

    /// Report an error from `source`, optionally naming the widget or interlock involved.
    pub fn report(&self, source: ErrorSource, origin: Option<&str>, err: &anyhow::Error) {
        let message = if self.print_stacktraces {
            format!("{:?}", err)
        } else {
            format!("{:#}", err)
        };

        error!(
            target: ERROR_TARGET,
            source = %source,
            origin = origin.unwrap_or("dashboard"),
            "{}",
            message
        );

        let mut history = self.history.lock();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(ErrorReport {
            timestamp: Local::now(),
            source,
            origin: origin.map(str::to_string),
            message,
        });
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Recent reports, oldest first.
    pub fn recent(&self) -> Vec<ErrorReport> {
        self.history.lock().iter().cloned().collect()
    }

    /// Recent reports from one source.
    pub fn recent_from(&self, source: ErrorSource) -> Vec<ErrorReport> {
        self.history
            .lock()
            .iter()
            .filter(|r| r.source == source)
            .cloned()
            .collect()
    }

    /// Total number of reports since creation, including ones evicted from history.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Forget the kept reports. The total is unchanged.
    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn reports_are_kept_in_order_and_bounded() {
        let reporter = ErrorReporter::new(false, 2);
        reporter.report(ErrorSource::Update, Some("TC"), &anyhow!("first"));
        reporter.report(ErrorSource::Interlock, Some("overtemp"), &anyhow!("second"));
        reporter.report(ErrorSource::Socket, None, &anyhow!("third"));

        let recent = reporter.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].origin, None);
        assert_eq!(reporter.total(), 3);
        assert_eq!(reporter.recent_from(ErrorSource::Interlock).len(), 1);
    }

    #[test]
    fn chain_is_flattened_without_stacktraces() {
        let reporter = ErrorReporter::new(false, 10);
        let err = anyhow!("port vanished").context("Handshake failed on 'Relay'");
        reporter.report(ErrorSource::Handshake, Some("Relay"), &err);

        let report = &reporter.recent()[0];
        assert_eq!(report.message, "Handshake failed on 'Relay': port vanished");
        assert!(report.to_string().contains("on_handshake in Relay"));
    }

    #[test]
    fn source_tags() {
        assert_eq!(ErrorSource::AwaitCondition.to_string(), "automation await");
        assert_eq!(ErrorSource::Close.to_string(), "on_close");
    }
}
