use crate::error::Error;
use crate::execution::{ExampleTask, Plan, SkipReason};
use crate::extractor::{extract_examples, Example};
use crate::frob::FrobRegistry;
use crate::language::LanguageRegistry;
use std::path::PathBuf;
use std::time::Duration;

/// Everything gathered from the sources before anything runs.
pub struct Collected {
    pub tasks: Vec<ExampleTask>,
    /// Per-file problems, tagged with the file's position in the source list
    pub file_errors: Vec<(usize, Error)>,
    /// Number of examples found across all readable, well-formed files
    pub found: usize,
}

/// Collects one task per example from every source, in source order.
///
/// A file that cannot be read or parsed contributes an error and no tasks;
/// the remaining files are still collected.
pub async fn collect_tasks(
    sources: &[PathBuf],
    languages: &LanguageRegistry,
    frobs: &FrobRegistry,
    default_timeout: Duration,
) -> Collected {
    let mut collected = Collected {
        tasks: Vec::new(),
        file_errors: Vec::new(),
        found: 0,
    };

    for (source_order, path) in sources.iter().enumerate() {
        log::info!("Collecting examples from {}", path.display());

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(source) => {
                collected.file_errors.push((
                    source_order,
                    Error::Read {
                        path: path.clone(),
                        source,
                    },
                ));
                continue;
            }
        };

        let examples = match extract_examples(&content, path) {
            Ok(examples) => examples,
            Err(e) => {
                log::error!("{}", e);
                collected.file_errors.push((source_order, e));
                continue;
            }
        };

        log::debug!("Found {} example(s) in {}", examples.len(), path.display());
        collected.found += examples.len();

        for example in examples {
            let plan = plan_example(&example, languages, frobs);
            collected
                .tasks
                .push(ExampleTask::new(example, source_order, plan, default_timeout));
        }
    }

    collected
}

/// Decides whether an example runs, and with which frob.
pub fn plan_example(example: &Example, languages: &LanguageRegistry, frobs: &FrobRegistry) -> Plan {
    if !example.has_language() {
        return Plan::Skip(SkipReason::NoLanguage);
    }
    if example.directives.skip {
        return Plan::Skip(SkipReason::Directive);
    }

    // A frob registered under the raw tag wins over alias resolution
    let tag = example.language.to_lowercase();
    if let Some(frob) = frobs.lookup(&tag) {
        let language = languages.resolve(&tag).unwrap_or(tag.as_str()).to_string();
        return Plan::Run { language, frob };
    }

    let Some(language) = languages.resolve(&tag) else {
        return Plan::Skip(SkipReason::UnknownLanguage(example.language.clone()));
    };

    match frobs.lookup(language) {
        Some(frob) => Plan::Run {
            language: language.to_string(),
            frob,
        },
        None => Plan::Skip(SkipReason::NotSupported(language.to_string())),
    }
}
