//! Per-language execution strategies.
//!
//! A [`Frob`] knows how to turn one [`Example`] into a running process:
//! `prepare` writes the code into a private scratch directory, `run` executes
//! it (compiling first where needed) and `cleanup` releases the scratch
//! directory. Frobs are registered in a [`FrobRegistry`] under canonical
//! language names.

use crate::config::FrobConfig;
use crate::extractor::Example;
use crate::process::{spawn_and_capture, Captured};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// An example materialized on disk, owned by exactly one worker.
///
/// Dropping the unit removes its scratch directory, so resources are
/// released even if the owning future is cancelled.
#[derive(Debug)]
pub struct PreparedUnit {
    dir: TempDir,
    source: PathBuf,
}

impl PreparedUnit {
    pub fn new(dir: TempDir, source: PathBuf) -> Self {
        Self { dir, source }
    }

    /// Scratch directory private to this example.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The written source file.
    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Which step of a frob produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => f.write_str("compile"),
            Stage::Run => f.write_str("run"),
        }
    }
}

/// What running a prepared unit produced, before any expectations are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutcome {
    pub stage: Stage,
    pub captured: Captured,
}

/// Execution strategy for one or more languages.
///
/// Implementations must not keep state between examples.
#[async_trait]
pub trait Frob: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Materializes the example in a fresh scratch directory.
    async fn prepare(&self, example: &Example) -> Result<PreparedUnit>;

    /// Executes a prepared unit, killing it once `timeout` has passed.
    ///
    /// Non-zero exits and timeouts are outcomes, not errors. Errors mean the
    /// process could not be started at all.
    async fn run(&self, unit: &PreparedUnit, timeout: Duration) -> Result<RawOutcome>;

    /// Releases the unit's resources. Best effort.
    fn cleanup(&self, unit: PreparedUnit) {
        let dir = unit.dir().to_path_buf();
        if let Err(e) = unit.dir.close() {
            log::warn!("Failed to remove scratch directory {}: {}", dir.display(), e);
        }
    }
}

/// A frob whose behavior is entirely determined by a [`FrobConfig`].
///
/// # Configuration-Driven Design
///
/// - Source file name or extension
/// - Optional preamble (prepended to every example)
/// - Optional compile command, run before the run command
/// - Run command, with `{file}` and `{dir}` placeholders
pub struct CommandFrob {
    name: String,
    config: FrobConfig,
}

impl CommandFrob {
    pub fn new(name: impl Into<String>, config: FrobConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn source_file_name(&self, example: &Example) -> String {
        if let Some(ref filename) = self.config.filename {
            return filename.clone();
        }
        let extension = self.config.extension.as_deref().unwrap_or(".txt");
        format!("example_{}{}", example.index, extension)
    }

    /// Writes source code with optional preamble to the scratch directory.
    async fn write_source_file(&self, code: &str, path: &Path) -> Result<()> {
        let mut file = File::create(path)
            .await
            .with_context(|| format!("Failed to create source file: {}", path.display()))?;

        if let Some(ref preamble) = self.config.preamble {
            file.write_all(preamble.as_bytes()).await?;
            file.write_all(b"\n\n").await?;
        }

        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    fn command(&self, argv: &[String], unit: &PreparedUnit) -> Command {
        let source = unit.source().to_string_lossy();
        let dir = unit.dir().to_string_lossy();
        let mut args = argv
            .iter()
            .map(|arg| arg.replace("{file}", &source).replace("{dir}", &dir));

        let program = args.next().unwrap_or_default();
        let mut cmd = Command::new(&program);
        cmd.args(args).current_dir(unit.dir());
        cmd
    }

    async fn run_step(
        &self,
        stage: Stage,
        argv: &[String],
        unit: &PreparedUnit,
        timeout: Duration,
    ) -> Result<Captured> {
        log::debug!("[{}] {} step: {:?}", self.name, stage, argv);
        spawn_and_capture(self.command(argv, unit), timeout)
            .await
            .with_context(|| {
                format!(
                    "Failed to execute {} command {:?} for frob '{}'",
                    stage, argv, self.name
                )
            })
    }
}

#[async_trait]
impl Frob for CommandFrob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, example: &Example) -> Result<PreparedUnit> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("gfmxr-{}-", self.name))
            .tempdir()
            .context("Failed to create scratch directory")?;

        let source = dir.path().join(self.source_file_name(example));
        self.write_source_file(&example.code, &source).await?;

        Ok(PreparedUnit::new(dir, source))
    }

    async fn run(&self, unit: &PreparedUnit, timeout: Duration) -> Result<RawOutcome> {
        let start = Instant::now();

        if !self.config.compile.is_empty() {
            let captured = self
                .run_step(Stage::Compile, &self.config.compile, unit, timeout)
                .await?;
            if captured.timed_out || captured.exit_code != Some(0) {
                return Ok(RawOutcome {
                    stage: Stage::Compile,
                    captured,
                });
            }
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        let captured = self
            .run_step(Stage::Run, &self.config.run, unit, remaining)
            .await?;

        Ok(RawOutcome {
            stage: Stage::Run,
            captured,
        })
    }
}

/// Registry of frobs keyed by canonical language name.
///
/// Built once at startup and shared read-only by all workers.
///
/// # Example
///
/// ```
/// use gfmxr::{default_frob_configs, FrobRegistry};
///
/// let registry = FrobRegistry::from_configs(&default_frob_configs());
/// assert!(registry.lookup("shell").is_some());
/// assert!(registry.lookup("cobol").is_none());
/// ```
#[derive(Clone, Default)]
pub struct FrobRegistry {
    frobs: BTreeMap<String, Arc<dyn Frob>>,
}

impl FrobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one [`CommandFrob`] per configuration, under its name and aliases.
    pub fn from_configs(configs: &BTreeMap<String, FrobConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in configs {
            let frob: Arc<dyn Frob> = Arc::new(CommandFrob::new(name.clone(), config.clone()));
            for alias in &config.aliases {
                registry.register(alias, Arc::clone(&frob));
            }
            registry.register(name, frob);
        }
        registry
    }

    /// Registers `frob` for a canonical language name. A later registration
    /// for the same name replaces the earlier one.
    pub fn register(&mut self, language: &str, frob: Arc<dyn Frob>) {
        self.frobs.insert(language.to_lowercase(), frob);
    }

    pub fn lookup(&self, language: &str) -> Option<Arc<dyn Frob>> {
        self.frobs.get(&language.to_lowercase()).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.frobs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.frobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frobs.is_empty()
    }
}

/// Built-in frob configurations, keyed by linguist's canonical language name.
///
/// Any of these can be replaced or disabled from `gfmxr.toml`.
pub fn default_frob_configs() -> BTreeMap<String, FrobConfig> {
    let frob = |extension: &str, run: &[&str]| FrobConfig {
        enabled: true,
        run: run.iter().map(|s| s.to_string()).collect(),
        compile: Vec::new(),
        extension: Some(extension.to_string()),
        filename: None,
        preamble: None,
        aliases: Vec::new(),
    };

    let mut configs = BTreeMap::new();
    configs.insert("shell".to_string(), frob(".sh", &["bash", "{file}"]));
    configs.insert("python".to_string(), frob(".py", &["python3", "{file}"]));
    configs.insert("ruby".to_string(), frob(".rb", &["ruby", "{file}"]));
    configs.insert("javascript".to_string(), frob(".js", &["node", "{file}"]));
    configs.insert("perl".to_string(), frob(".pl", &["perl", "{file}"]));
    configs.insert("php".to_string(), frob(".php", &["php", "{file}"]));
    configs.insert("lua".to_string(), frob(".lua", &["lua", "{file}"]));
    configs.insert("go".to_string(), frob(".go", &["go", "run", "{file}"]));
    configs.insert(
        "json".to_string(),
        frob(".json", &["python3", "-m", "json.tool", "{file}"]),
    );

    let mut java = frob(".java", &["java", "-cp", "{dir}", "Main"]);
    java.filename = Some("Main.java".to_string());
    java.compile = vec!["javac".to_string(), "{file}".to_string()];
    configs.insert("java".to_string(), java);

    let mut rust = frob(".rs", &["{dir}/main"]);
    rust.compile = ["rustc", "--edition", "2021", "-o", "{dir}/main", "{file}"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    configs.insert("rust".to_string(), rust);

    configs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::Directives;

    fn example(code: &str) -> Example {
        Example {
            path: Arc::new(PathBuf::from("README.md")),
            index: 3,
            line: 10,
            language: "bash".to_string(),
            code: code.to_string(),
            directives: Directives::default(),
        }
    }

    fn shell_frob() -> CommandFrob {
        CommandFrob::new("shell", default_frob_configs()["shell"].clone())
    }

    #[test]
    fn test_default_configs_are_valid() {
        for (name, config) in default_frob_configs() {
            config
                .validate()
                .unwrap_or_else(|e| panic!("built-in frob {name} is invalid: {e}"));
        }
    }

    #[test]
    fn test_registry_lookup_and_aliases() {
        let mut configs = default_frob_configs();
        configs.get_mut("python").unwrap().aliases = vec!["Python3".to_string()];

        let registry = FrobRegistry::from_configs(&configs);
        assert_eq!(registry.lookup("python").unwrap().name(), "python");
        assert_eq!(registry.lookup("python3").unwrap().name(), "python");
        assert_eq!(registry.lookup("SHELL").unwrap().name(), "shell");
        assert!(registry.lookup("made-up-lang").is_none());

        let names: Vec<_> = registry.names().collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"python3"));
    }

    #[tokio::test]
    async fn test_prepare_writes_code_in_isolated_dirs() {
        let frob = shell_frob();
        let first = frob.prepare(&example("echo one\n")).await.unwrap();
        let second = frob.prepare(&example("echo two\n")).await.unwrap();

        assert_ne!(first.dir(), second.dir());
        assert_eq!(
            first.source().file_name().unwrap().to_str().unwrap(),
            "example_3.sh"
        );
        assert_eq!(std::fs::read_to_string(first.source()).unwrap(), "echo one\n");

        let dir = first.dir().to_path_buf();
        frob.cleanup(first);
        assert!(!dir.exists());
        frob.cleanup(second);
    }

    #[tokio::test]
    async fn test_prepare_with_preamble_and_filename() {
        let mut config = default_frob_configs()["shell"].clone();
        config.preamble = Some("set -e".to_string());
        config.filename = Some("script.sh".to_string());
        let frob = CommandFrob::new("shell", config);

        let unit = frob.prepare(&example("echo hi\n")).await.unwrap();
        assert!(unit.source().ends_with("script.sh"));
        assert_eq!(
            std::fs::read_to_string(unit.source()).unwrap(),
            "set -e\n\necho hi\n"
        );
        frob.cleanup(unit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output() {
        let frob = shell_frob();
        let unit = frob
            .prepare(&example("echo hi\necho oops >&2\nexit 4\n"))
            .await
            .unwrap();

        let outcome = frob.run(&unit, Duration::from_secs(10)).await.unwrap();
        assert_eq!(outcome.stage, Stage::Run);
        assert_eq!(outcome.captured.exit_code, Some(4));
        assert_eq!(outcome.captured.stdout, "hi\n");
        assert_eq!(outcome.captured.stderr, "oops\n");
        frob.cleanup(unit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compile_failure_stops_before_run() {
        let mut config = default_frob_configs()["shell"].clone();
        config.compile = vec!["sh".to_string(), "-c".to_string(), "echo bad >&2; exit 2".to_string()];
        config.run = vec!["sh".to_string(), "-c".to_string(), "echo ran".to_string()];
        let frob = CommandFrob::new("compiled", config);

        let unit = frob.prepare(&example("")).await.unwrap();
        let outcome = frob.run(&unit, Duration::from_secs(10)).await.unwrap();
        assert_eq!(outcome.stage, Stage::Compile);
        assert_eq!(outcome.captured.exit_code, Some(2));
        assert_eq!(outcome.captured.stderr, "bad\n");
        assert!(outcome.captured.stdout.is_empty());
        frob.cleanup(unit);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_placeholders_expand() {
        let mut config = default_frob_configs()["shell"].clone();
        config.run = vec![
            "sh".to_string(),
            "-c".to_string(),
            "test -f \"$0\" && test -d \"$1\" && echo ok".to_string(),
            "{file}".to_string(),
            "{dir}".to_string(),
        ];
        let frob = CommandFrob::new("shell", config);

        let unit = frob.prepare(&example("true\n")).await.unwrap();
        let outcome = frob.run(&unit, Duration::from_secs(10)).await.unwrap();
        assert_eq!(outcome.captured.stdout, "ok\n");
        frob.cleanup(unit);
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let mut config = default_frob_configs()["shell"].clone();
        config.run = vec!["gfmxr-definitely-not-installed".to_string()];
        let frob = CommandFrob::new("missing", config);

        let unit = frob.prepare(&example("")).await.unwrap();
        let err = frob.run(&unit, Duration::from_secs(5)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("missing"));
        frob.cleanup(unit);
    }
}
