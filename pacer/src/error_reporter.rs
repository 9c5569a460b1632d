use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Advisory, the run continues.
    Warning,
    /// Tears the whole run down.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub severity: Severity,
    pub source: String,
    pub message: String,
}

/// Collects errors from every worker and decides when a run must abort.
///
/// Only the first `max_retained` messages are kept; later ones are counted. The
/// abort flag is set by the first fatal report and never cleared, every suspension
/// point in the driver polls it.
#[derive(Debug)]
pub struct ConcurrentErrorReporter {
    errors: Mutex<Vec<ReportedError>>,
    max_retained: usize,
    dropped: AtomicUsize,
    aborted: AtomicBool,
}

impl ConcurrentErrorReporter {
    pub fn new(max_retained: usize) -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            max_retained,
            dropped: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn report(
        &self,
        severity: Severity,
        source: impl Into<String>,
        message: impl fmt::Display,
    ) {
        if severity == Severity::Fatal {
            self.aborted.store(true, Ordering::SeqCst);
        }
        let mut errors = self.errors.lock();
        if errors.len() < self.max_retained {
            errors.push(ReportedError {
                severity,
                source: source.into(),
                message: message.to_string(),
            });
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn warn(&self, source: impl Into<String>, message: impl fmt::Display) {
        self.report(Severity::Warning, source, message);
    }

    pub fn fatal(&self, source: impl Into<String>, message: impl fmt::Display) {
        self.report(Severity::Fatal, source, message);
    }

    /// `true` once any fatal error was reported.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    pub fn errors(&self) -> Vec<ReportedError> {
        self.errors.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.errors
            .lock()
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }
}

impl Default for ConcurrentErrorReporter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl fmt::Display for ConcurrentErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors = self.errors.lock();
        if errors.is_empty() {
            return write!(f, "no errors reported");
        }
        for (i, e) in errors.iter().enumerate() {
            let level = match e.severity {
                Severity::Warning => "warning",
                Severity::Fatal => "fatal",
            };
            writeln!(f, "{:>3}. [{level}] {}: {}", i + 1, e.source, e.message)?;
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            writeln!(f, "... and {dropped} more")?;
        }
        Ok(())
    }
}
