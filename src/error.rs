//! Error taxonomy for a run.
//!
//! Every problem a run can hit is an [`Error`]. Problems scoped to a single
//! file or example never abort the run. They are collected and handed back as
//! one [`AggregatedError`] that still lets callers print each member.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A single problem found while running examples.
#[derive(Error, Debug)]
pub enum Error {
    /// Language definitions or frob configuration could not be loaded.
    /// Fatal to the whole invocation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A markdown file's fencing is malformed.
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A markdown file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One example did not pass.
    #[error("{}: example #{index} (line {line}, {language}): {failure}", path.display())]
    Example {
        path: PathBuf,
        index: usize,
        line: usize,
        language: String,
        failure: ExampleFailure,
    },

    /// The number of examples found differs from the declared count.
    #[error("expected {expected} example(s) but found {found}")]
    CountMismatch { expected: usize, found: usize },
}

/// Why a single example failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExampleFailure {
    #[error("prepare failed: {0}")]
    Prepare(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("exited with {actual} (expected {expected})")]
    ExitStatus { expected: i32, actual: String },

    #[error("output mismatch\n--- expected\n{expected}\n--- actual\n{actual}")]
    OutputMismatch { expected: String, actual: String },
}

/// An ordered, non-empty collection of errors from one invocation.
#[derive(Debug)]
pub struct AggregatedError {
    errors: Vec<Error>,
}

impl AggregatedError {
    /// Collects errors in arrival order. An empty input means "no error".
    pub fn from_errors(errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} problem(s) found", self.errors.len())?;
        for error in &self.errors {
            write!(f, "\n  - {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedError {}

impl IntoIterator for AggregatedError {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregatedError {
    type Item = &'a Error;
    type IntoIter = std::slice::Iter<'a, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
