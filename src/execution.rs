use crate::error::{Error, ExampleFailure};
use crate::extractor::Example;
use crate::frob::{Frob, RawOutcome, Stage};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum size of a single code block in bytes (1MB)
pub const MAX_CODE_BLOCK_SIZE: usize = 1_000_000;

/// Terminal status of one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Passed => f.write_str("passed"),
            Status::Failed => f.write_str("failed"),
            Status::Skipped => f.write_str("skipped"),
        }
    }
}

/// Why an example was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The fence has no language tag
    NoLanguage,
    /// The tag is not a known language or alias
    UnknownLanguage(String),
    /// The language is known but no frob handles it
    NotSupported(String),
    /// A skip directive was given
    Directive,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoLanguage => f.write_str("no language tag"),
            SkipReason::UnknownLanguage(tag) => write!(f, "unknown language '{}'", tag),
            SkipReason::NotSupported(language) => write!(f, "no frob for language '{}'", language),
            SkipReason::Directive => f.write_str("skip directive"),
        }
    }
}

/// What the runner decided to do with an example.
pub enum Plan {
    Skip(SkipReason),
    Run {
        language: String,
        frob: Arc<dyn Frob>,
    },
}

/// One example together with everything needed to execute it independently.
pub struct ExampleTask {
    example: Example,
    source_order: usize,
    plan: Plan,
    timeout: Duration,
}

impl ExampleTask {
    pub fn new(example: Example, source_order: usize, plan: Plan, timeout: Duration) -> Self {
        Self {
            example,
            source_order,
            plan,
            timeout,
        }
    }

    /// Runs the example through prepare, run and cleanup, and consumes the
    /// task to produce exactly one result.
    ///
    /// Cleanup happens on every path that prepared something. A failure here
    /// never escapes as an error; it is recorded in the result.
    pub async fn execute(self) -> ExampleResult {
        let (language, frob) = match self.plan {
            Plan::Skip(reason) => {
                log::debug!(
                    "Skipping {} example #{}: {}",
                    self.example.path.display(),
                    self.example.index,
                    reason
                );
                return ExampleResult::skipped(self.example, self.source_order, reason);
            }
            Plan::Run { language, frob } => (language, frob),
        };

        let timeout = self.example.directives.timeout().unwrap_or(self.timeout);
        let mut result = ExampleResult {
            example: self.example,
            source_order: self.source_order,
            language: Some(language),
            frob: Some(frob.name().to_string()),
            status: Status::Failed,
            skip_reason: None,
            failure: None,
            stage: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        };

        log::debug!(
            "Running {} example #{} with frob {}",
            result.example.path.display(),
            result.example.index,
            frob.name()
        );

        let start = Instant::now();

        if result.example.code.len() > MAX_CODE_BLOCK_SIZE {
            result.failure = Some(ExampleFailure::Prepare(format!(
                "code block exceeds size limit of {} bytes ({} bytes)",
                MAX_CODE_BLOCK_SIZE,
                result.example.code.len()
            )));
            return result;
        }

        let unit = match frob.prepare(&result.example).await {
            Ok(unit) => unit,
            Err(e) => {
                result.failure = Some(ExampleFailure::Prepare(format!("{:#}", e)));
                result.duration = start.elapsed();
                return result;
            }
        };

        let outcome = frob.run(&unit, timeout).await;
        frob.cleanup(unit);
        result.duration = start.elapsed();

        match outcome {
            Ok(outcome) => result.apply(outcome, timeout),
            Err(e) => result.failure = Some(ExampleFailure::Execution(format!("{:#}", e))),
        }

        result
    }
}

/// Outcome of one example.
///
/// Captures the terminal status along with the captured output and timing
/// information for reporting.
#[derive(Debug, Clone)]
pub struct ExampleResult {
    example: Example,
    source_order: usize,
    language: Option<String>,
    frob: Option<String>,
    status: Status,
    skip_reason: Option<SkipReason>,
    failure: Option<ExampleFailure>,
    stage: Option<Stage>,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    duration: Duration,
}

impl ExampleResult {
    fn skipped(example: Example, source_order: usize, reason: SkipReason) -> Self {
        Self {
            example,
            source_order,
            language: None,
            frob: None,
            status: Status::Skipped,
            skip_reason: Some(reason),
            failure: None,
            stage: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Applies the example's expectations to what the frob produced.
    fn apply(&mut self, outcome: RawOutcome, timeout: Duration) {
        let directives = &self.example.directives;
        let captured = outcome.captured;

        self.stage = Some(outcome.stage);
        self.exit_code = captured.exit_code;

        self.failure = if captured.timed_out {
            Some(ExampleFailure::Timeout(timeout))
        } else if outcome.stage == Stage::Compile {
            Some(ExampleFailure::Execution(format!(
                "compile step {}",
                describe_exit(captured.exit_code)
            )))
        } else if captured.exit_code != Some(directives.expected_exit()) {
            Some(ExampleFailure::ExitStatus {
                expected: directives.expected_exit(),
                actual: exit_code_string(captured.exit_code),
            })
        } else {
            match directives.output {
                Some(ref expected) if !output_matches(expected, &captured.stdout) => {
                    Some(ExampleFailure::OutputMismatch {
                        expected: expected.clone(),
                        actual: captured.stdout.clone(),
                    })
                }
                _ => None,
            }
        };

        self.status = if self.failure.is_none() {
            Status::Passed
        } else {
            Status::Failed
        };
        self.stdout = captured.stdout;
        self.stderr = captured.stderr;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn success(&self) -> bool {
        self.status == Status::Passed
    }

    /// Whether the example was prepared and run (or at least tried to be).
    pub fn attempted(&self) -> bool {
        self.status != Status::Skipped
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(ExampleFailure::Timeout(_)))
    }

    pub fn example(&self) -> &Example {
        &self.example
    }

    pub fn path(&self) -> &Path {
        &self.example.path
    }

    /// Position of the example's file among the run's sources.
    pub fn source_order(&self) -> usize {
        self.source_order
    }

    /// Canonical language, when the example was attempted.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn frob(&self) -> Option<&str> {
        self.frob.as_deref()
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        self.skip_reason.as_ref()
    }

    pub fn failure(&self) -> Option<&ExampleFailure> {
        self.failure.as_ref()
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The result as an aggregatable error, if it failed.
    pub fn to_error(&self) -> Option<Error> {
        self.failure.as_ref().map(|failure| Error::Example {
            path: self.example.path.to_path_buf(),
            index: self.example.index,
            line: self.example.line,
            language: self
                .language
                .clone()
                .unwrap_or_else(|| self.example.language.clone()),
            failure: failure.clone(),
        })
    }
}

/// Compares expected and actual output, ignoring trailing whitespace on
/// every line and trailing blank lines.
pub fn output_matches(expected: &str, actual: &str) -> bool {
    normalize_output(expected) == normalize_output(actual)
}

fn normalize_output(s: &str) -> String {
    let lines: Vec<&str> = s.lines().map(str::trim_end).collect();
    lines.join("\n").trim_end().to_string()
}

fn exit_code_string(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

/// Executes all tasks with at most `jobs` running at once.
///
/// Execution order is unspecified; the returned results are sorted by source
/// file order, then by position within the file. Returns the results and the
/// wall-clock time the whole batch took.
pub async fn execute_tasks(tasks: Vec<ExampleTask>, jobs: usize) -> (Vec<ExampleResult>, Duration) {
    let start = Instant::now();

    let mut results: Vec<ExampleResult> = stream::iter(tasks)
        .map(ExampleTask::execute)
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;

    results.sort_by_key(|r| (r.source_order, r.example.index));
    (results, start.elapsed())
}
