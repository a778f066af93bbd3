use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "gfmxr.toml";

/// Runner configuration.
///
/// Deserialized from `gfmxr.toml`. Every table under `frobs` defines or
/// overrides the frob registered for one canonical language.
///
/// # Example
///
/// ```toml
/// timeout_secs = 30
///
/// [frobs.python]
/// extension = ".py"
/// run = ["python3", "{file}"]
///
/// [frobs.rust]
/// extension = ".rs"
/// compile = ["rustc", "-o", "{dir}/main", "{file}"]
/// run = ["{dir}/main"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    /// Per-example timeout in seconds, unless overridden by a directive
    pub timeout_secs: Option<u64>,

    /// Number of examples run concurrently
    pub jobs: Option<usize>,

    /// Frob configurations indexed by canonical language name
    pub frobs: BTreeMap<String, FrobConfig>,
}

/// Configuration for the frob of one language.
///
/// `compile` and `run` are argument vectors; `{file}` is replaced with the
/// prepared source file and `{dir}` with its scratch directory. All entries
/// support environment variable expansion using `${VAR_NAME}` syntax.
///
/// # Security
///
/// Programs are validated to prevent command injection. They cannot contain
/// shell metacharacters or use parent directory traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrobConfig {
    /// Whether this frob is registered at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Command that runs the example
    pub run: Vec<String>,

    /// Optional command run before `run` (e.g. a compiler)
    #[serde(default)]
    pub compile: Vec<String>,

    /// Extension of the generated source file (e.g. ".py")
    #[serde(default)]
    pub extension: Option<String>,

    /// Exact name of the generated source file, for languages that care (e.g. "Main.java")
    #[serde(default)]
    pub filename: Option<String>,

    /// Optional preamble to prepend to every example
    #[serde(default)]
    pub preamble: Option<String>,

    /// Extra names the frob is registered under
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl FrobConfig {
    /// Validate the configuration for security and correctness
    pub fn validate(&self) -> Result<()> {
        if self.run.is_empty() {
            anyhow::bail!("Frob configuration must have a non-empty `run` command");
        }

        validate_program(&self.run[0])?;
        if let Some(program) = self.compile.first() {
            validate_program(program)?;
        }

        if let Some(ref filename) = self.filename {
            if filename.contains(['/', '\\']) || filename.is_empty() {
                anyhow::bail!("Source filename must be a plain file name: {}", filename);
            }
        }

        Ok(())
    }

    fn expand_env_vars(&mut self) {
        for arg in self.run.iter_mut().chain(self.compile.iter_mut()) {
            *arg = expand_env_vars(arg);
        }
    }
}

fn validate_program(program: &str) -> Result<()> {
    if program.is_empty() {
        anyhow::bail!("Program cannot be empty");
    }

    // Ensure program path doesn't contain shell metacharacters
    let dangerous_chars = [';', '|', '&', '`', '\n', '\r'];
    for ch in dangerous_chars {
        if program.contains(ch) {
            anyhow::bail!(
                "Program contains invalid character '{}': {}",
                ch.escape_default(),
                program
            );
        }
    }

    // Ensure program path doesn't use parent directory traversal
    for component in Path::new(program).components() {
        if matches!(component, std::path::Component::ParentDir) {
            anyhow::bail!("Program cannot contain '..': {}", program);
        }
    }

    Ok(())
}

impl RunnerConfig {
    /// Loads the configuration file.
    ///
    /// With an explicit path the file must exist. Without one,
    /// [`DEFAULT_CONFIG_FILE`] is used if present in the working directory,
    /// and the defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Path::new(DEFAULT_CONFIG_FILE),
            None => return Ok(Self::default()),
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parses configuration from TOML, expanding environment variables and
    /// validating every frob.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: RunnerConfig = toml::from_str(contents)?;

        if config.timeout_secs == Some(0) {
            anyhow::bail!("timeout_secs must be at least 1");
        }
        if config.jobs == Some(0) {
            anyhow::bail!("jobs must be at least 1");
        }

        for (name, frob) in config.frobs.iter_mut() {
            frob.expand_env_vars();
            frob.validate()
                .with_context(|| format!("Invalid configuration for frob '{}'", name))?;
        }

        Ok(config)
    }

    /// Built-in frobs overlaid with the configured ones, disabled ones removed.
    pub fn frob_configs(&self) -> BTreeMap<String, FrobConfig> {
        let mut frobs = crate::frob::default_frob_configs();
        for (name, frob) in &self.frobs {
            frobs.insert(name.to_lowercase(), frob.clone());
        }
        frobs.retain(|_, frob| frob.enabled);
        frobs
    }
}

/// Where `languages.yml` lives when `--languages` is not given.
pub fn default_languages_path() -> Result<PathBuf> {
    // XDG_CACHE_HOME wins on every platform
    if let Ok(xdg_cache_home) = env::var("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg_cache_home)
            .join("gfmxr")
            .join("languages.yml"));
    }

    let proj_dirs =
        ProjectDirs::from("", "", "gfmxr").context("Failed to determine project directories")?;
    Ok(proj_dirs.cache_dir().join("languages.yml"))
}

/// Expand environment variables in a string
/// Supports ${VAR_NAME} syntax
/// This function processes the string in a single pass to avoid re-processing expanded values
fn expand_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'

            let mut var_name = String::new();
            let mut found_close = false;

            for ch in chars.by_ref() {
                if ch == '}' {
                    found_close = true;
                    break;
                }
                var_name.push(ch);
            }

            if found_close {
                match env::var(&var_name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        log::warn!(
                            "Environment variable '{}' not found, leaving unexpanded",
                            var_name
                        );
                        result.push_str("${");
                        result.push_str(&var_name);
                        result.push('}');
                    }
                }
            } else {
                // No closing brace found, treat as literal
                result.push_str("${");
                result.push_str(&var_name);
            }
        } else {
            result.push(ch);
        }
    }

    result
}
