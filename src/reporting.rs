use crate::error::AggregatedError;
use crate::execution::{ExampleResult, Status};
use crate::runner::{CountCheck, RunReport};
use chrono::Local;
use std::collections::BTreeMap;
use std::time::Duration;

/// Formats a line with timestamp, level and prefix.
fn format_line(level: &str, message: &str) -> String {
    format!(
        "{} [{}] (gfmxr): {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level,
        message
    )
}

fn error_line(message: &str) {
    eprintln!("{}", format_line("ERROR", message));
}

fn info_line(message: &str) {
    eprintln!("{}", format_line("INFO", message));
}

/// Renders everything known about one failed example.
pub fn failure_lines(result: &ExampleResult) -> Vec<String> {
    let example = result.example();
    let mut lines = vec![
        "Example failed".to_string(),
        format!("File: {}", example.path.display()),
        format!(
            "Block: #{} at line {} ({})",
            example.index,
            example.line,
            result.language().unwrap_or(&example.language)
        ),
        String::new(),
    ];

    if let Some(failure) = result.failure() {
        lines.extend(failure.to_string().lines().map(str::to_string));
    }

    for (name, stream) in [("stdout", result.stdout()), ("stderr", result.stderr())] {
        if !stream.is_empty() {
            lines.push(String::new());
            lines.push(format!("{}:", name));
            lines.extend(stream.lines().map(str::to_string));
        }
    }

    lines.push(String::new());
    lines.push("Code block:".to_string());
    lines.push(format!("```{}", example.language));
    lines.extend(example.code.lines().map(str::to_string));
    lines.push("```".to_string());
    lines
}

/// Prints every failed example with its output and code to stderr.
pub fn report_failures(report: &RunReport) {
    for result in report.results().iter().filter(|r| r.status() == Status::Failed) {
        for line in failure_lines(result) {
            error_line(&line);
        }
        error_line("");
    }
}

/// Prints each member of the aggregate on its own line(s).
pub fn report_errors(errors: &AggregatedError) {
    error_line(&format!("{} problem(s) found:", errors.len()));
    for error in errors {
        let rendered = error.to_string();
        let mut lines = rendered.lines();
        if let Some(first) = lines.next() {
            error_line(&format!("  - {}", first));
        }
        for line in lines {
            error_line(&format!("    {}", line));
        }
    }
}

/// One-line summary of a run.
pub fn summary_line(report: &RunReport) -> String {
    let mut summary = format!(
        "Ran {} example(s): {} passed, {} failed, {} skipped (found {})",
        report.attempted(),
        report.passed(),
        report.failed(),
        report.skipped(),
        report.found()
    );

    match report.count_check() {
        CountCheck::NotRequested => {}
        CountCheck::Satisfied => summary.push_str(", count check satisfied"),
        CountCheck::Mismatched { expected, found } => {
            summary.push_str(&format!(", expected {} but found {}", expected, found))
        }
    }

    summary
}

/// Prints run statistics to stderr.
///
/// Shows:
/// - The summary line
/// - Per-language counts and total time
/// - Per-language timing and individual example timings (RUST_LOG=debug)
pub fn print_statistics(report: &RunReport) {
    info_line(&summary_line(report));

    let mut lang_stats: BTreeMap<&str, (usize, Duration)> = BTreeMap::new();
    for result in report.results().iter().filter(|r| r.attempted()) {
        let entry = lang_stats
            .entry(result.language().unwrap_or("unknown"))
            .or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += result.duration();
    }

    if !lang_stats.is_empty() {
        let stats_str = lang_stats
            .iter()
            .map(|(lang, (count, _))| format!("{}: {}", lang, count))
            .collect::<Vec<_>>()
            .join(", ");
        info_line(&format!(
            "Finished in {}ms ({})",
            report.elapsed().as_millis(),
            stats_str
        ));
    }

    log::debug!("Timing breakdown by language:");
    for (lang, (count, total)) in &lang_stats {
        log::debug!(
            "  {}: avg {}ms over {} example(s)",
            lang,
            total.as_millis() / *count as u128,
            count
        );
    }

    log::debug!("Individual example results:");
    for result in report.results() {
        match result.skip_reason() {
            Some(reason) => log::debug!(
                "[{}] {} example #{}: {}",
                result.status(),
                result.path().display(),
                result.example().index,
                reason
            ),
            None => log::debug!(
                "[{}] {} example #{}: {}ms",
                result.status(),
                result.path().display(),
                result.example().index,
                result.duration().as_millis()
            ),
        }
    }
}
