//! The capability handle passed to every plugin.
//!
//! Plugins never talk to the pipeline directly: they receive a
//! [`PluginContext`] at construction which carries the report sink, the
//! declared bitrate, the aborting flag and the joint-termination hooks.
//! All of it is safe to use from any thread; reporting never blocks the
//! caller on I/O (the tracing subscriber owns buffering and draining).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

/// Message severity for the plugin report sink, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl Severity {
    /// Parse a severity name as used by the control channel.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            "verbose" => Some(Severity::Verbose),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }
}

/// Thread-safe, stage-scoped report sink.
///
/// Each stage gets its own `Report` carrying the plugin name (and the
/// stage index when `log_plugin_index` is set) and its own maximum
/// severity, adjustable at runtime through the control channel.
#[derive(Clone)]
pub struct Report {
    prefix: Arc<str>,
    max_severity: Arc<AtomicU8>,
}

impl Report {
    /// Create a report sink with the given stage prefix.
    pub fn new(prefix: impl Into<String>, max_severity: Arc<AtomicU8>) -> Self {
        Self {
            prefix: prefix.into().into(),
            max_severity,
        }
    }

    /// A detached sink for tests and standalone plugin use.
    pub fn standalone(prefix: impl Into<String>) -> Self {
        Self::new(prefix, Arc::new(AtomicU8::new(Severity::Debug as u8)))
    }

    /// The stage prefix of this sink.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Adjust the maximum severity this sink lets through.
    pub fn set_max_severity(&self, severity: Severity) {
        self.max_severity.store(severity as u8, Ordering::Relaxed);
    }

    /// Emit a message at the given severity.
    pub fn log(&self, severity: Severity, message: &str) {
        if severity as u8 > self.max_severity.load(Ordering::Relaxed) {
            return;
        }
        match severity {
            Severity::Error => error!(stage = %self.prefix, "{message}"),
            Severity::Warning => warn!(stage = %self.prefix, "{message}"),
            Severity::Info => info!(stage = %self.prefix, "{message}"),
            Severity::Verbose => debug!(stage = %self.prefix, "{message}"),
            Severity::Debug => trace!(stage = %self.prefix, "{message}"),
        }
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }

    pub fn warning(&self, message: &str) {
        self.log(Severity::Warning, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn verbose(&self, message: &str) {
        self.log(Severity::Verbose, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Severity::Debug, message);
    }
}

/// State shared by every stage of one processing session.
///
/// The declared bitrate is published with a release store and read with an
/// acquire load so that stages never need a lock to query it.
pub struct SessionState {
    bitrate: AtomicU64,
    aborting: AtomicBool,
    joint_total: AtomicUsize,
    joint_done: AtomicUsize,
    ignore_joint: bool,
}

impl SessionState {
    /// Create the session state for one pipeline run.
    pub fn new(ignore_joint: bool) -> Arc<Self> {
        Arc::new(Self {
            bitrate: AtomicU64::new(0),
            aborting: AtomicBool::new(false),
            joint_total: AtomicUsize::new(0),
            joint_done: AtomicUsize::new(0),
            ignore_joint,
        })
    }

    /// The current declared bitrate in bits/second (0 = unknown).
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Acquire)
    }

    /// Publish a new declared bitrate.
    pub fn publish_bitrate(&self, bitrate: u64) {
        self.bitrate.store(bitrate, Ordering::Release);
    }

    /// Check if the pipeline is aborting.
    pub fn aborting(&self) -> bool {
        self.aborting.load(Ordering::Relaxed)
    }

    /// Flag the pipeline as aborting.
    pub fn set_aborting(&self) {
        self.aborting.store(true, Ordering::Relaxed);
    }

    /// Check if every joint-termination opt-in has declared completion.
    ///
    /// Always false when no plugin opted in, or when the user disabled
    /// joint termination.
    pub fn joint_complete(&self) -> bool {
        if self.ignore_joint {
            return false;
        }
        let total = self.joint_total.load(Ordering::Acquire);
        total > 0 && self.joint_done.load(Ordering::Acquire) >= total
    }
}

struct ContextInner {
    report: Report,
    session: Arc<SessionState>,
    joint_opted: AtomicBool,
    joint_declared: AtomicBool,
}

/// Per-stage capability handle given to a plugin at construction.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    /// Create the context for one stage.
    pub fn new(report: Report, session: Arc<SessionState>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                report,
                session,
                joint_opted: AtomicBool::new(false),
                joint_declared: AtomicBool::new(false),
            }),
        }
    }

    /// A detached context for tests and standalone plugin use.
    pub fn standalone(name: &str) -> Self {
        Self::new(Report::standalone(name), SessionState::new(false))
    }

    /// The stage-scoped report sink.
    pub fn report(&self) -> &Report {
        &self.inner.report
    }

    /// The current declared bitrate in bits/second (0 = unknown).
    pub fn bitrate(&self) -> u64 {
        self.inner.session.bitrate()
    }

    /// Check if the pipeline is aborting; long-running plugin operations
    /// should poll this and bail out early.
    pub fn aborting(&self) -> bool {
        self.inner.session.aborting()
    }

    /// Opt this stage into joint termination. Usually called from the
    /// plugin's `start` when its own option asks for it.
    pub fn use_joint_termination(&self) {
        if !self.inner.joint_opted.swap(true, Ordering::AcqRel) {
            self.inner.session.joint_total.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Declare that this stage has completed its work in the sense of
    /// joint termination. Packets keep flowing until every opt-in stage
    /// has declared.
    pub fn joint_terminate(&self) {
        if !self.inner.joint_opted.load(Ordering::Acquire) {
            return;
        }
        if !self.inner.joint_declared.swap(true, Ordering::AcqRel) {
            self.inner.session.joint_done.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Check if this stage opted into joint termination.
    pub fn uses_joint_termination(&self) -> bool {
        self.inner.joint_opted.load(Ordering::Acquire)
    }

    /// Check if this stage has declared joint completion.
    pub fn joint_terminated(&self) -> bool {
        self.inner.joint_declared.load(Ordering::Acquire)
    }

    /// The session state shared by all stages.
    pub fn session(&self) -> &Arc<SessionState> {
        &self.inner.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("warn"), Some(Severity::Warning));
        assert_eq!(Severity::parse("DEBUG"), Some(Severity::Debug));
        assert_eq!(Severity::parse("noise"), None);
    }

    #[test]
    fn test_bitrate_publish() {
        let session = SessionState::new(false);
        assert_eq!(session.bitrate(), 0);
        session.publish_bitrate(38_000_000);
        assert_eq!(session.bitrate(), 38_000_000);
    }

    #[test]
    fn test_joint_quorum() {
        let session = SessionState::new(false);
        let a = PluginContext::new(Report::standalone("a"), Arc::clone(&session));
        let b = PluginContext::new(Report::standalone("b"), Arc::clone(&session));
        a.use_joint_termination();
        b.use_joint_termination();
        assert!(!session.joint_complete());
        a.joint_terminate();
        assert!(!session.joint_complete());
        b.joint_terminate();
        assert!(session.joint_complete());
        // Declaring twice does not overcount.
        b.joint_terminate();
        assert!(session.joint_complete());
    }

    #[test]
    fn test_joint_requires_opt_in() {
        let session = SessionState::new(false);
        let ctx = PluginContext::new(Report::standalone("x"), Arc::clone(&session));
        // Declaring without opting in is a no-op.
        ctx.joint_terminate();
        assert!(!session.joint_complete());
        assert!(!ctx.joint_terminated());
    }

    #[test]
    fn test_joint_ignored() {
        let session = SessionState::new(true);
        let ctx = PluginContext::new(Report::standalone("x"), Arc::clone(&session));
        ctx.use_joint_termination();
        ctx.joint_terminate();
        assert!(!session.joint_complete());
    }
}
