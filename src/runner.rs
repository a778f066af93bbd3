//! Orchestrates a whole run: collect examples from every source, execute
//! them on a bounded pool, verify the expected count and gather every
//! problem into one [`AggregatedError`].

use crate::config::RunnerConfig;
use crate::error::{AggregatedError, Error};
use crate::execution::{execute_tasks, ExampleResult, Status};
use crate::frob::FrobRegistry;
use crate::language::LanguageRegistry;
use crate::task_collector::collect_tasks;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Per-example timeout when neither the config nor a directive sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Knobs for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Expected number of examples; 0 disables the check
    pub expected_count: usize,
    /// Examples executed concurrently
    pub jobs: usize,
    /// Per-example timeout unless a directive overrides it
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            expected_count: 0,
            jobs: num_cpus::get(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RunOptions {
    /// Defaults with the config file's `jobs` and `timeout_secs` applied.
    pub fn from_config(config: &RunnerConfig) -> Self {
        let defaults = Self::default();
        Self {
            expected_count: 0,
            jobs: config.jobs.unwrap_or(defaults.jobs),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Outcome of the expected-count verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountCheck {
    NotRequested,
    Satisfied,
    Mismatched { expected: usize, found: usize },
}

/// Compares the declared count with the number of examples found.
pub fn verify_count(expected: usize, found: usize) -> CountCheck {
    if expected == 0 {
        CountCheck::NotRequested
    } else if expected == found {
        CountCheck::Satisfied
    } else {
        CountCheck::Mismatched { expected, found }
    }
}

/// Aggregate outcome of one invocation.
#[derive(Debug)]
pub struct RunReport {
    results: Vec<ExampleResult>,
    found: usize,
    count_check: CountCheck,
    elapsed: Duration,
    errors: Option<AggregatedError>,
}

impl RunReport {
    /// Results in (source file, position in file) order.
    pub fn results(&self) -> &[ExampleResult] {
        &self.results
    }

    /// Examples found in all well-formed files, skipped ones included.
    pub fn found(&self) -> usize {
        self.found
    }

    pub fn attempted(&self) -> usize {
        self.results.iter().filter(|r| r.attempted()).count()
    }

    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status() == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(Status::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped)
    }

    pub fn count_check(&self) -> CountCheck {
        self.count_check
    }

    /// Wall-clock time spent executing examples.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Every problem found, or `None` when the run is clean.
    pub fn errors(&self) -> Option<&AggregatedError> {
        self.errors.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_none()
    }

    /// Takes the aggregated error out of the report, leaving the counts.
    pub fn take_errors(&mut self) -> Option<AggregatedError> {
        self.errors.take()
    }
}

/// Runs the examples of a set of markdown sources.
///
/// Registries are built once by the caller and shared read-only with every
/// worker.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), gfmxr::Error> {
/// use gfmxr::{default_frob_configs, FrobRegistry, LanguageRegistry, RunOptions, Runner};
/// use std::path::{Path, PathBuf};
///
/// let languages = LanguageRegistry::load(Path::new("languages.yml"), None).await?;
/// let frobs = FrobRegistry::from_configs(&default_frob_configs());
/// let runner = Runner::new(languages, frobs, RunOptions::default());
///
/// let report = runner.run(&[PathBuf::from("README.md")]).await;
/// if let Some(errors) = report.errors() {
///     for error in errors {
///         eprintln!("{}", error);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Runner {
    languages: Arc<LanguageRegistry>,
    frobs: Arc<FrobRegistry>,
    options: RunOptions,
}

impl Runner {
    pub fn new(languages: LanguageRegistry, frobs: FrobRegistry, options: RunOptions) -> Self {
        Self::with_shared(Arc::new(languages), Arc::new(frobs), options)
    }

    pub fn with_shared(
        languages: Arc<LanguageRegistry>,
        frobs: Arc<FrobRegistry>,
        options: RunOptions,
    ) -> Self {
        Self {
            languages,
            frobs,
            options,
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs every example of every source.
    ///
    /// Never fails as a whole: unreadable or malformed files, failing
    /// examples and a count mismatch all end up in the report's errors.
    pub async fn run(&self, sources: &[PathBuf]) -> RunReport {
        let collected =
            collect_tasks(sources, &self.languages, &self.frobs, self.options.timeout).await;

        log::info!(
            "Running {} example(s) from {} file(s) with {} job(s)",
            collected.tasks.len(),
            sources.len(),
            self.options.jobs
        );

        let (results, elapsed) = execute_tasks(collected.tasks, self.options.jobs).await;
        let count_check = verify_count(self.options.expected_count, collected.found);

        let errors = gather_errors(collected.file_errors, &results, count_check);

        RunReport {
            results,
            found: collected.found,
            count_check,
            elapsed,
            errors: AggregatedError::from_errors(errors),
        }
    }
}

/// Orders problems by source file (file errors first within a file, then
/// failed examples by position) and appends the count mismatch last.
fn gather_errors(
    file_errors: Vec<(usize, Error)>,
    results: &[ExampleResult],
    count_check: CountCheck,
) -> Vec<Error> {
    let mut ordered: Vec<(usize, usize, Error)> = file_errors
        .into_iter()
        .map(|(order, error)| (order, 0, error))
        .collect();

    ordered.extend(
        results
            .iter()
            .filter_map(|r| r.to_error().map(|e| (r.source_order(), r.example().index, e))),
    );
    ordered.sort_by_key(|(order, index, _)| (*order, *index));

    let mut errors: Vec<Error> = ordered.into_iter().map(|(_, _, e)| e).collect();

    if let CountCheck::Mismatched { expected, found } = count_check {
        errors.push(Error::CountMismatch { expected, found });
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_count() {
        assert_eq!(verify_count(0, 5), CountCheck::NotRequested);
        assert_eq!(verify_count(5, 5), CountCheck::Satisfied);
        assert_eq!(
            verify_count(4, 2),
            CountCheck::Mismatched {
                expected: 4,
                found: 2
            }
        );
    }

    #[test]
    fn test_options_from_config() {
        let config = RunnerConfig {
            timeout_secs: Some(9),
            jobs: Some(3),
            ..RunnerConfig::default()
        };
        let options = RunOptions::from_config(&config);
        assert_eq!(options.timeout, Duration::from_secs(9));
        assert_eq!(options.jobs, 3);
        assert_eq!(options.expected_count, 0);

        let options = RunOptions::from_config(&RunnerConfig::default());
        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert!(options.jobs >= 1);
    }

    #[tokio::test]
    async fn test_empty_run_with_count_reports_mismatch() {
        let runner = Runner::new(
            LanguageRegistry::default(),
            FrobRegistry::new(),
            RunOptions {
                expected_count: 1,
                ..RunOptions::default()
            },
        );

        let report = runner.run(&[]).await;
        assert_eq!(report.found(), 0);
        let errors: Vec<_> = report.errors().unwrap().iter().collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            Error::CountMismatch {
                expected: 1,
                found: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_run_without_count_is_clean() {
        let runner = Runner::new(
            LanguageRegistry::default(),
            FrobRegistry::new(),
            RunOptions::default(),
        );

        let report = runner.run(&[]).await;
        assert!(report.is_success());
        assert_eq!(report.count_check(), CountCheck::NotRequested);
    }
}
