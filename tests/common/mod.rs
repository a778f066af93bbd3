//! Common test utilities for integration tests
//!
//! This module contains shared test fixtures and helper functions used across
//! integration tests. These utilities are not compiled into the library.

#![allow(dead_code)]

use anyhow::Result;
use gfmxr::{LanguageRegistry, RunOptions, RunReport, Runner, RunnerConfig, FrobRegistry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Language definitions shared by every test.
pub const LANGUAGES_FIXTURE: &str = "tests/fixtures/languages.yml";

/// Isolated test fixture with automatic cleanup
///
/// Creates a temporary copy of a fixture directory, allowing tests to run
/// in parallel without interfering with each other.
pub struct TestFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl TestFixture {
    /// Create an empty fixture
    pub fn empty() -> Result<Self> {
        let dir = TempDir::new()?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            _dir: dir,
        })
    }

    /// Create a new test fixture from a specific source directory
    pub fn new(source: impl AsRef<Path>) -> Result<Self> {
        let fixture = Self::empty()?;
        copy_dir_all(source.as_ref(), &fixture.path)?;
        Ok(fixture)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the fixture
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Write a markdown document into the fixture and return its path
    pub fn write(&self, name: &str, markdown: &str) -> Result<PathBuf> {
        let path = self.file(name);
        std::fs::write(&path, markdown)?;
        Ok(path)
    }
}

/// Builds a runner over the fixture languages and the built-in frobs
pub struct RunnerTest {
    options: RunOptions,
    config: RunnerConfig,
}

impl RunnerTest {
    pub fn new() -> Self {
        Self {
            options: RunOptions {
                jobs: 2,
                timeout: Duration::from_secs(30),
                ..RunOptions::default()
            },
            config: RunnerConfig::default(),
        }
    }

    pub fn expected_count(mut self, count: usize) -> Self {
        self.options.expected_count = count;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.options.jobs = jobs;
        self
    }

    pub fn config(mut self, toml: &str) -> Result<Self> {
        self.config = RunnerConfig::from_toml(toml)?;
        Ok(self)
    }

    pub async fn build(self) -> Result<Runner> {
        let languages = LanguageRegistry::load(Path::new(LANGUAGES_FIXTURE), None).await?;
        let frobs = FrobRegistry::from_configs(&self.config.frob_configs());
        Ok(Runner::new(languages, frobs, self.options))
    }

    /// Build the runner and run it over `sources`
    pub async fn run(self, sources: &[PathBuf]) -> Result<RunReport> {
        let runner = self.build().await?;
        Ok(runner.run(sources).await)
    }
}

/// Recursively copy all files and directories from src to dst
fn copy_dir_all(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    std::fs::create_dir_all(&dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_dir_all(entry.path(), dst.as_ref().join(entry.file_name()))?;
        } else {
            std::fs::copy(entry.path(), dst.as_ref().join(entry.file_name()))?;
        }
    }
    Ok(())
}
