//! Outcome classification for the orchestrator's run.
//!
//! Rather than a closed `enum` of error types (the causes are heterogeneous:
//! I/O errors, HTTP errors, process exit errors), failures are plain
//! [`anyhow::Error`] chains tagged with marker causes that `CLASSIFY` checks
//! for via [`anyhow::Error::chain`]. This mirrors the source system's use of
//! a sentinel wrapper type checked with `errors.As`.

use std::fmt;

/// Tags an error as one where the agent never reached a durable running
/// state: started-but-failed-early, never reached REPORT's unclaim path.
#[derive(Debug)]
pub struct Retryable;

impl fmt::Display for Retryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retryable")
    }
}
impl std::error::Error for Retryable {}

/// Tags an error as "the grace period elapsed with the agent still alive".
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task agent process is still running, which could interrupt the task. \
             Possible reasons include the Pod being evicted or deleted"
        )
    }
}
impl std::error::Error for Interrupted {}

/// Wrap `err` so that [`is_retryable`] reports true for it and everything
/// it's further wrapped in via `.context(...)`.
pub fn retryable(err: anyhow::Error) -> anyhow::Error {
    err.context(Retryable)
}

pub fn interrupted() -> anyhow::Error {
    anyhow::Error::new(Interrupted)
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Retryable>().is_some())
}

/// Combine two independent failures (e.g. the run error and a failed
/// unclaim call) into one, analogous to `errors.Join` in the source system.
#[derive(Debug)]
struct Joined(anyhow::Error, anyhow::Error);

impl fmt::Display for Joined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}; {:#}", self.0, self.1)
    }
}
impl std::error::Error for Joined {}

pub fn join(a: anyhow::Error, b: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(Joined(a, b))
}

/// Strip the characters the Runner API's fail endpoint treats as HTML-unsafe
/// before the message is sent as raw bytes.
pub fn sanitize_fail_message(message: &str) -> String {
    message.chars().filter(|c| !matches!(c, '<' | '>' | '&' | '\'' | '"')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn retryable_is_detected_through_context_layers() {
        let err = retryable(anyhow!("failed to start task agent command")).context("outer context");
        assert!(is_retryable(&err));
    }

    #[test]
    fn plain_errors_are_not_retryable() {
        let err = anyhow!("something else went wrong");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn join_keeps_both_messages() {
        let joined = join(anyhow!("first"), anyhow!("second"));
        let rendered = format!("{joined}");
        assert!(rendered.contains("first"));
        assert!(rendered.contains("second"));
    }

    #[test]
    fn sanitize_strips_html_unsafe_characters() {
        assert_eq!(
            sanitize_fail_message("<tag> & 'quote' \"double\""),
            "tag  quote double"
        );
    }
}
