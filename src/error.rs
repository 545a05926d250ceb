use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by every layer of the crate.
///
/// Composed actions wrap failures in [`CujError::Step`] so the rendered
/// message reads outermost step first (`"outer: inner: boom"`), while
/// [`CujError::kind`] still reports the root cause.
#[derive(Debug, Error)]
pub enum CujError {
    /// The channel to the device is broken.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote expression threw; `message` carries the thrown value's text.
    #[error("remote exception: {message}")]
    RemoteException { message: String },

    /// The remote expression did not parse.
    #[error("remote syntax error: {0}")]
    RemoteSyntax(String),

    #[error("timed out after {elapsed:?}: {last}")]
    Timeout { elapsed: Duration, last: String },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to find node with properties: {0}")]
    NotFound(String),

    #[error(
        "multiple nodes matched, if you expect this and only want the first use first(): {0}"
    )]
    TooGeneric(String),

    #[error("node is no longer valid: {0}")]
    Stale(String),

    #[error("histogram {0} has no samples")]
    EmptyHistogram(String),

    #[error("tab crash detected: {0}")]
    TabCrash(String),

    #[error("{0}")]
    ExpectationMiss(String),

    #[error("recorder used after close")]
    AfterClose,

    /// Breadcrumb added by a named step around an inner failure.
    #[error("{step}: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<CujError>,
    },

    /// Explicit failure raised by a scenario step.
    #[error("{0}")]
    Failed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode remote value: {0}")]
    Decode(#[from] serde_json::Error),

    /// Writing or reading run artifacts failed.
    #[error("{0:#}")]
    Output(#[from] anyhow::Error),
}

/// Coarse classification of a [`CujError`] root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    RemoteException,
    RemoteSyntax,
    Timeout,
    Cancelled,
    NotFound,
    TooGeneric,
    Stale,
    EmptyHistogram,
    TabCrash,
    ExpectationMiss,
    AfterClose,
    Failed,
    Config,
    Unsupported,
    Io,
    Decode,
    Output,
}

pub type Result<T, E = CujError> = std::result::Result<T, E>;

impl CujError {
    pub fn failed(message: impl Into<String>) -> Self {
        CujError::Failed(message.into())
    }

    pub fn timeout(elapsed: Duration, last: impl Into<String>) -> Self {
        CujError::Timeout {
            elapsed,
            last: last.into(),
        }
    }

    /// Prepend a step name to the failure chain.
    pub fn wrap(self, step: impl Into<String>) -> Self {
        CujError::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Root cause with every step wrapper removed.
    pub fn root(&self) -> &CujError {
        let mut current = self;
        while let CujError::Step { source, .. } = current {
            current = source;
        }
        current
    }

    /// Step names from the outermost wrapper inwards.
    pub fn chain(&self) -> Vec<&str> {
        let mut steps = Vec::new();
        let mut current = self;
        while let CujError::Step { step, source } = current {
            steps.push(step.as_str());
            current = source;
        }
        steps
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            CujError::Transport(_) => ErrorKind::Transport,
            CujError::RemoteException { .. } => ErrorKind::RemoteException,
            CujError::RemoteSyntax(_) => ErrorKind::RemoteSyntax,
            CujError::Timeout { .. } => ErrorKind::Timeout,
            CujError::Cancelled => ErrorKind::Cancelled,
            CujError::NotFound(_) => ErrorKind::NotFound,
            CujError::TooGeneric(_) => ErrorKind::TooGeneric,
            CujError::Stale(_) => ErrorKind::Stale,
            CujError::EmptyHistogram(_) => ErrorKind::EmptyHistogram,
            CujError::TabCrash(_) => ErrorKind::TabCrash,
            CujError::ExpectationMiss(_) => ErrorKind::ExpectationMiss,
            CujError::AfterClose => ErrorKind::AfterClose,
            CujError::Failed(_) => ErrorKind::Failed,
            CujError::Config(_) => ErrorKind::Config,
            CujError::Unsupported(_) => ErrorKind::Unsupported,
            CujError::Io(_) => ErrorKind::Io,
            CujError::Decode(_) => ErrorKind::Decode,
            CujError::Output(_) => ErrorKind::Output,
            CujError::Step { source, .. } => source.kind(),
        }
    }

    /// Failures that abort the whole scenario rather than a single attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport
                | ErrorKind::RemoteSyntax
                | ErrorKind::TabCrash
                | ErrorKind::AfterClose
                | ErrorKind::Cancelled
        )
    }

    /// Cancellation propagates the same way as an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Cancelled)
    }
}

/// Attach a step name to the error branch of a result.
pub trait StepExt<T> {
    fn step(self, name: &str) -> Result<T>;
    fn with_step<F: FnOnce() -> String>(self, name: F) -> Result<T>;
}

impl<T> StepExt<T> for Result<T> {
    fn step(self, name: &str) -> Result<T> {
        self.map_err(|err| err.wrap(name))
    }

    fn with_step<F: FnOnce() -> String>(self, name: F) -> Result<T> {
        self.map_err(|err| err.wrap(name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wrappers_render_outermost_first() {
        let err = CujError::failed("boom").wrap("inner").wrap("outer");
        assert_eq!(err.to_string(), "outer: inner: boom");
        assert_eq!(err.chain(), vec!["outer", "inner"]);
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(matches!(err.root(), CujError::Failed(msg) if msg == "boom"));
    }

    #[test]
    fn kind_looks_through_wrappers() {
        let err = CujError::TabCrash("Tabs.SadTab.CrashCreated advanced by 1".into()).wrap("run 0");
        assert_eq!(err.kind(), ErrorKind::TabCrash);
        assert!(err.is_fatal());
        assert!(!CujError::NotFound("role: button".into()).is_fatal());
    }

    #[test]
    fn cancellation_counts_as_timeout() {
        assert!(CujError::Cancelled.is_timeout());
        assert!(CujError::timeout(Duration::from_secs(1), "still waiting").is_timeout());
        assert!(!CujError::failed("x").is_timeout());
    }

    #[test]
    fn step_ext_wraps_only_errors() {
        let ok: Result<u8> = Ok(1);
        assert_eq!(ok.step("unused").ok(), Some(1));
        let err: Result<u8> = Err(CujError::Cancelled);
        let wrapped = err.with_step(|| format!("poll {}", 3)).unwrap_err();
        assert_eq!(wrapped.to_string(), "poll 3: cancelled");
    }
}
