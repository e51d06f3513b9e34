//! Error types for backup runs
//!
//! Collaborator seams (forge API, git, notifications) report failures as
//! `anyhow::Error`; the backup core classifies them into [`BackupError`] so the
//! caller gets one descriptive failure per run.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Every way a backup run, rotation or schedule can fail
#[derive(Error, Debug)]
pub enum BackupError {
    /// A listing request (user lookup, repository page, org member page) failed
    #[error("failed to fetch {target}")]
    Fetch {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// Unsupported run mode string
    #[error("invalid run type: {0}; must be one of `clone`, `fetch`, or `dry-run`")]
    InvalidRunType(String),

    /// Filesystem failure while rotating, creating or writing backup output
    #[error("{context} ({})", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One or more repositories failed to clone
    #[error("{} of {total} repositories failed to clone: {}", .failures.len(), CloneFailures(.failures))]
    Clone {
        total: usize,
        failures: Vec<CloneFailure>,
    },

    /// Malformed schedule interval
    #[error("invalid interval {input:?}: {reason}")]
    DurationParse { input: String, reason: String },

    /// Completion notification could not be delivered
    #[error("failed to send notification")]
    Notify {
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to serialize repository list")]
    Serialize(#[from] serde_json::Error),

    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The background schedule task stopped unexpectedly
    #[error("scheduler stopped: {0}")]
    Scheduler(String),
}

impl BackupError {
    /// This error followed by each of its causes, joined with `: `
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            message.push_str(": ");
            message.push_str(&e.to_string());
            cause = e.source();
        }
        message
    }

    pub(crate) fn fetch(target: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Fetch {
            target: target.into(),
            source,
        }
    }

    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// A single repository that could not be cloned
#[derive(Debug, Clone)]
pub struct CloneFailure {
    pub full_name: String,
    pub error: String,
}

impl fmt::Display for CloneFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.full_name, self.error)
    }
}

struct CloneFailures<'a>(&'a [CloneFailure]);

impl fmt::Display for CloneFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
