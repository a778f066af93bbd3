use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gfmxr::{
    default_languages_path, reporting, FrobRegistry, HttpFetcher, LanguageRegistry,
    LanguagesFetcher, RunOptions, Runner, RunnerConfig, DEFAULT_LANGUAGES_URL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

/// Exit status when examples failed or the count did not match.
const EXIT_EXAMPLES_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "gfmxr", version, about = "github-flavored markdown example runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Markdown source(s) to search for runnable examples
    #[arg(
        short = 's',
        long = "sources",
        env = "GFMXR_SOURCES",
        value_delimiter = ',',
        default_value = "README.md"
    )]
    sources: Vec<PathBuf>,

    /// Expected count of examples (for verification, 0 disables it)
    #[arg(short = 'c', long, env = "GFMXR_COUNT", default_value_t = 0)]
    count: usize,

    /// Location of linguist's languages.yml
    #[arg(short = 'L', long, env = "GFMXR_LANGUAGES", global = true)]
    languages: Option<PathBuf>,

    /// Disable automatic pull of languages.yml when missing
    #[arg(short = 'N', long, env = "GFMXR_NO_AUTO_PULL")]
    no_auto_pull: bool,

    /// Number of examples run concurrently (defaults to the number of CPUs)
    #[arg(short = 'j', long, env = "GFMXR_JOBS", value_parser = parse_jobs)]
    jobs: Option<usize>,

    /// Per-example timeout in seconds
    #[arg(
        short = 't',
        long = "timeout",
        env = "GFMXR_TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_secs: Option<u64>,

    /// Config file with frob definitions (defaults to ./gfmxr.toml if present)
    #[arg(long, env = "GFMXR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short = 'D', long, env = "GFMXR_DEBUG", global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Explicitly download the latest languages.yml from linguist to --languages
    PullLanguages {
        /// Source URL of languages.yml
        #[arg(
            short = 'u',
            long,
            env = "GFMXR_LANGUAGES_URL",
            default_value = DEFAULT_LANGUAGES_URL
        )]
        languages_url: String,
    },
    /// Dump the parsed languages as JSON
    #[command(hide = true)]
    DumpLanguages,
    /// List the fence tags handled by a frob
    #[command(hide = true)]
    ListFrobs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let outcome = match &cli.command {
        None => run_examples(&cli).await,
        Some(Commands::PullLanguages { languages_url }) => {
            pull_languages(&cli, languages_url).await.map(|()| true)
        }
        Some(Commands::DumpLanguages) => dump_languages(&cli).await.map(|()| true),
        Some(Commands::ListFrobs) => list_frobs(&cli).await.map(|()| true),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => exit(EXIT_EXAMPLES_FAILED),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            exit(1);
        }
    }
}

fn parse_jobs(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(jobs) => Ok(jobs),
        Err(e) => Err(e.to_string()),
    }
}

fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn languages_path(cli: &Cli) -> Result<PathBuf> {
    match cli.languages {
        Some(ref path) => Ok(path.clone()),
        None => default_languages_path(),
    }
}

async fn load_languages(cli: &Cli, auto_pull: bool) -> Result<LanguageRegistry> {
    let path = languages_path(cli)?;
    let fetcher = if auto_pull {
        Some(HttpFetcher::new(DEFAULT_LANGUAGES_URL)?)
    } else {
        None
    };

    let registry = LanguageRegistry::load(
        &path,
        fetcher.as_ref().map(|f| f as &dyn LanguagesFetcher),
    )
    .await?;
    Ok(registry)
}

/// Runs all examples; `Ok(false)` means problems were found and reported.
async fn run_examples(cli: &Cli) -> Result<bool> {
    let config = RunnerConfig::load(cli.config.as_deref())?;
    let languages = load_languages(cli, !cli.no_auto_pull).await?;
    let frobs = FrobRegistry::from_configs(&config.frob_configs());

    let mut options = RunOptions::from_config(&config);
    options.expected_count = cli.count;
    if let Some(jobs) = cli.jobs {
        options.jobs = jobs;
    }
    if let Some(secs) = cli.timeout_secs {
        options.timeout = Duration::from_secs(secs);
    }

    let runner = Runner::new(languages, frobs, options);
    let mut report = runner.run(&cli.sources).await;

    reporting::report_failures(&report);
    reporting::print_statistics(&report);

    match report.take_errors() {
        Some(errors) => {
            reporting::report_errors(&errors);
            Ok(false)
        }
        None => Ok(true),
    }
}

async fn pull_languages(cli: &Cli, url: &str) -> Result<()> {
    let path = languages_path(cli)?;
    HttpFetcher::new(url)?
        .fetch(&path)
        .await
        .with_context(|| format!("Failed to pull languages into {}", path.display()))?;
    Ok(())
}

async fn dump_languages(cli: &Cli) -> Result<()> {
    let languages = load_languages(cli, false)
        .await
        .context("failed to load languages")?;

    let by_name: BTreeMap<&str, _> = languages.languages().map(|l| (l.name.as_str(), l)).collect();
    let json = serde_json::to_string_pretty(&by_name).context("failed to marshal to json")?;
    println!("{}", json);
    Ok(())
}

async fn list_frobs(cli: &Cli) -> Result<()> {
    let config = RunnerConfig::load(cli.config.as_deref())?;
    let languages = load_languages(cli, false).await?;
    let frobs = FrobRegistry::from_configs(&config.frob_configs());

    let mut known = BTreeSet::new();
    for name in frobs.names() {
        known.insert(name.to_string());
        if let Some(language) = languages.get(name) {
            known.extend(language.aliases.iter().map(|a| a.to_lowercase()));
        }
    }

    for tag in known {
        println!("{}", tag);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_and_jobs_rejected() {
        assert!(Cli::try_parse_from(["gfmxr", "--timeout", "0"]).is_err());
        assert!(Cli::try_parse_from(["gfmxr", "-j", "0"]).is_err());

        let cli = Cli::try_parse_from(["gfmxr", "-t", "5", "-j", "3"]).unwrap();
        assert_eq!(cli.timeout_secs, Some(5));
        assert_eq!(cli.jobs, Some(3));
    }
}
