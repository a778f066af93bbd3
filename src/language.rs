use crate::error::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Source of linguist's language definitions.
pub const DEFAULT_LANGUAGES_URL: &str =
    "https://raw.githubusercontent.com/github/linguist/master/lib/linguist/languages.yml";

/// One language entry from linguist's `languages.yml`.
///
/// Only the fields the runner cares about are kept; everything else in the
/// file (colors, grammar scopes, ids) is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    /// Canonical name: the definition's name, lower-cased (e.g. "shell")
    #[serde(skip_deserializing)]
    pub canonical: String,
    /// Name as written in the definitions (e.g. "Shell")
    #[serde(skip_deserializing)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// Alias table mapping fence tags to canonical language names.
///
/// Built once at startup and read-only afterwards, so a single instance can
/// be shared by every worker.
///
/// # Example
///
/// ```
/// use gfmxr::LanguageRegistry;
///
/// let registry = LanguageRegistry::from_yaml(
///     "Shell:\n  type: programming\n  aliases: [sh, bash, zsh]\n",
/// ).unwrap();
/// assert_eq!(registry.resolve("BASH"), Some("shell"));
/// assert_eq!(registry.resolve("made-up-lang"), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, Language>,
    by_alias: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Builds the registry from already parsed languages.
    pub fn new(languages: impl IntoIterator<Item = Language>) -> Self {
        let mut registry = Self::default();
        for language in languages {
            registry.insert(language);
        }
        registry
    }

    /// Parses the contents of a linguist `languages.yml`.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let raw: BTreeMap<String, Language> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Configuration(format!("invalid language definitions: {}", e)))?;

        Ok(Self::new(raw.into_iter().map(|(name, mut language)| {
            language.canonical = name.to_lowercase();
            language.name = name;
            language
        })))
    }

    /// Loads the definitions from `path`.
    ///
    /// When the file is missing and a fetcher is given, the fetcher is asked
    /// once to download it to `path` and the load is retried exactly once.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when the file is missing and cannot be
    /// fetched, or is not valid YAML.
    pub async fn load(path: &Path, fetcher: Option<&dyn LanguagesFetcher>) -> Result<Self, Error> {
        if !path.exists() {
            let Some(fetcher) = fetcher else {
                return Err(Error::Configuration(format!(
                    "language definitions not found at {} (run `gfmxr pull-languages` or allow auto-pull)",
                    path.display()
                )));
            };

            log::info!("Fetching language definitions to {}", path.display());
            fetcher.fetch(path).await?;
        }

        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!(
                "failed to read language definitions {}: {}",
                path.display(),
                e
            ))
        })?;

        let registry = Self::from_yaml(&yaml)?;
        log::debug!(
            "Loaded {} language(s) from {}",
            registry.languages.len(),
            path.display()
        );
        Ok(registry)
    }

    fn insert(&mut self, language: Language) {
        let canonical = language.canonical.clone();
        let keys = std::iter::once(canonical.clone())
            .chain(std::iter::once(language.name.replace(' ', "-").to_lowercase()))
            .chain(language.aliases.iter().map(|a| a.to_lowercase()));

        for key in keys {
            // First definition wins when two languages claim the same alias
            self.by_alias.entry(key).or_insert_with(|| canonical.clone());
        }

        self.languages.insert(canonical, language);
    }

    /// Resolves a fence tag (case-insensitively) to its canonical language name.
    pub fn resolve(&self, tag: &str) -> Option<&str> {
        self.by_alias
            .get(&tag.to_lowercase())
            .map(String::as_str)
    }

    /// Looks a language up by canonical name.
    pub fn get(&self, canonical: &str) -> Option<&Language> {
        self.languages.get(canonical)
    }

    /// All languages, ordered by canonical name.
    pub fn languages(&self) -> impl Iterator<Item = &Language> {
        self.languages.values()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

/// Downloads language definitions to a local path.
#[async_trait]
pub trait LanguagesFetcher: Send + Sync {
    async fn fetch(&self, dest: &Path) -> Result<(), Error>;
}

/// Fetches `languages.yml` over HTTP.
pub struct HttpFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gfmxr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl LanguagesFetcher for HttpFetcher {
    async fn fetch(&self, dest: &Path) -> Result<(), Error> {
        let fetch_error =
            |e: &dyn std::fmt::Display| Error::Configuration(format!("failed to fetch {}: {}", self.url, e));

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_error(&e))?;
        let body = response.bytes().await.map_err(|e| fetch_error(&e))?;

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fetch_error(&e))?;
        }
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| fetch_error(&e))?;

        log::info!("Wrote {} bytes to {}", body.len(), dest.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const LANGUAGES_YML: &str = r##"
Shell:
  type: programming
  aliases:
  - sh
  - shell-script
  - bash
  - zsh
  extensions:
  - ".sh"
  - ".bash"
JavaScript:
  type: programming
  aliases:
  - js
  - node
  extensions:
  - ".js"
Python:
  type: programming
  color: "#3572A5"
  aliases:
  - python3
  - rusthon
Objective C:
  type: programming
"##;

    struct CountingFetcher {
        calls: AtomicUsize,
        contents: Option<&'static str>,
    }

    #[async_trait]
    impl LanguagesFetcher for CountingFetcher {
        async fn fetch(&self, dest: &Path) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.contents {
                Some(contents) => tokio::fs::write(dest, contents)
                    .await
                    .map_err(|e| Error::Configuration(e.to_string())),
                None => Err(Error::Configuration("offline".to_string())),
            }
        }
    }

    #[test]
    fn test_resolve_aliases_case_insensitively() {
        let registry = LanguageRegistry::from_yaml(LANGUAGES_YML).unwrap();
        assert_eq!(registry.resolve("bash"), Some("shell"));
        assert_eq!(registry.resolve("Bash"), Some("shell"));
        assert_eq!(registry.resolve("shell"), Some("shell"));
        assert_eq!(registry.resolve("JS"), Some("javascript"));
        assert_eq!(registry.resolve("JavaScript"), Some("javascript"));
        assert_eq!(registry.resolve("python3"), Some("python"));
        assert_eq!(registry.resolve("objective-c"), Some("objective c"));
        assert_eq!(registry.resolve("made-up-lang"), None);
        assert_eq!(registry.resolve(""), None);
    }

    #[test]
    fn test_language_metadata_kept() {
        let registry = LanguageRegistry::from_yaml(LANGUAGES_YML).unwrap();
        let shell = registry.get("shell").unwrap();
        assert_eq!(shell.name, "Shell");
        assert_eq!(shell.kind.as_deref(), Some("programming"));
        assert_eq!(shell.extensions, vec![".sh", ".bash"]);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = LanguageRegistry::from_yaml("- just\n- a list\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_file_without_fetcher_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("languages.yml");

        let err = LanguageRegistry::load(&path, None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_file_fetched_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("languages.yml");
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            contents: Some(LANGUAGES_YML),
        };

        let registry = LanguageRegistry::load(&path, Some(&fetcher)).await.unwrap();
        assert_eq!(registry.resolve("sh"), Some("shell"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        // Present now, so no second fetch
        LanguageRegistry::load(&path, Some(&fetcher)).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("languages.yml");
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
            contents: None,
        };

        let err = LanguageRegistry::load(&path, Some(&fetcher)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
