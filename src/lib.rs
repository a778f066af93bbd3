//! gfmxr library
//!
//! Extracts the fenced code examples of GitHub-flavored Markdown documents and
//! runs each one with a per-language execution strategy (a "frob"), so that
//! documentation examples are verified to still work.
//!
//! ## Public API
//!
//! - [`extract_examples`] - Parse one document into ordered [`Example`]s
//! - [`LanguageRegistry`] - Linguist alias table resolving fence tags to canonical languages
//! - [`Frob`], [`FrobRegistry`] - Execution strategies keyed by canonical language
//! - [`Runner`] - Runs every example of a set of sources and produces a [`RunReport`]
//! - [`AggregatedError`] - Every problem of a run, enumerable one by one

mod config;
mod error;
mod execution;
mod extractor;
mod frob;
mod language;
mod process;
pub mod reporting;
mod runner;
mod task_collector;

pub use config::{default_languages_path, FrobConfig, RunnerConfig, DEFAULT_CONFIG_FILE};
pub use error::{AggregatedError, Error, ExampleFailure};
pub use execution::{output_matches, ExampleResult, SkipReason, Status, MAX_CODE_BLOCK_SIZE};
pub use extractor::{extract_examples, Directives, Example, MAX_BLOCKS_PER_FILE};
pub use frob::{default_frob_configs, CommandFrob, Frob, FrobRegistry, PreparedUnit, RawOutcome, Stage};
pub use language::{HttpFetcher, Language, LanguageRegistry, LanguagesFetcher, DEFAULT_LANGUAGES_URL};
pub use process::{spawn_and_capture, Captured};
pub use runner::{verify_count, CountCheck, RunOptions, RunReport, Runner, DEFAULT_TIMEOUT};
