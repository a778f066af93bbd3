use crate::error::Error;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use serde::Deserialize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of code blocks per markdown file
pub const MAX_BLOCKS_PER_FILE: usize = 1000;

/// Fence tag of a block that holds the expected output of the block before it.
const OUTPUT_TAG: &str = "output";

/// An example extracted from a fenced code block, with its directives.
///
/// Examples are identified by fenced code syntax in markdown:
///
/// ````markdown
/// ```bash
/// echo hi
/// ```
/// ````
///
/// # Directives
///
/// A block can carry directives from three places:
///
/// - Comma-separated flags in the fence info string. `ignore` and `skip`
///   both mark the example as skipped.
/// - A JSON HTML comment directly above the fence:
///   `<!-- { "output": "hi", "exit": 0, "timeout": 5, "skip": false } -->`
/// - A block tagged `output` directly below the fence, whose contents become
///   the expected standard output.
///
/// ````markdown
/// <!-- { "exit": 3 } -->
/// ```bash
/// echo hi
/// exit 3
/// ```
///
/// ```output
/// hi
/// ```
/// ````
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Markdown file the example came from
    pub path: Arc<PathBuf>,
    /// 1-based position among the examples of its file
    pub index: usize,
    /// 1-based line of the opening fence
    pub line: usize,
    /// Language tag exactly as written in the fence (may be empty)
    pub language: String,
    /// Fence contents, unmodified
    pub code: String,
    pub directives: Directives,
}

impl Example {
    /// Whether the fence declared a language at all.
    pub fn has_language(&self) -> bool {
        !self.language.is_empty()
    }
}

/// Per-example directives. Absence of all of them means "run it and require
/// a zero exit status, output not checked".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Directives {
    pub skip: bool,
    /// Expected standard output, compared after trailing-whitespace normalization
    pub output: Option<String>,
    /// Expected exit status
    pub exit: Option<i32>,
    /// Timeout override in seconds
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

impl Directives {
    pub fn expected_exit(&self) -> i32 {
        self.exit.unwrap_or(0)
    }

    /// Timeout override; `0` means no override.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// A fenced block being collected.
struct OpenBlock {
    language: String,
    flags_skip: bool,
    directives: Directives,
    range: Range<usize>,
    /// End offset of the block's contents; a closing fence can only follow it
    body_end: usize,
    code: String,
}

/// Extracts the examples of one markdown document, in document order.
///
/// Fences follow CommonMark semantics as implemented by pulldown-cmark: a
/// block is closed by the first line made of the opening fence character
/// repeated at least as many times as the opening fence, without an info
/// string. Anything else inside, including shorter fences or fences of the
/// other character, is code.
///
/// # Errors
///
/// Returns [`Error::Parse`] naming the file and the opening line when a fence
/// is never closed, and when the file holds more than [`MAX_BLOCKS_PER_FILE`]
/// blocks.
///
/// # Example
///
/// ```
/// use gfmxr::extract_examples;
/// use std::path::Path;
///
/// let markdown = "# Demo\n\n```bash\necho hi\n```\n";
/// let examples = extract_examples(markdown, Path::new("README.md")).unwrap();
/// assert_eq!(examples.len(), 1);
/// assert_eq!(examples[0].language, "bash");
/// assert_eq!(examples[0].code, "echo hi\n");
/// ```
pub fn extract_examples(content: &str, path: &Path) -> Result<Vec<Example>, Error> {
    let path = Arc::new(path.to_path_buf());
    let lines = LineIndex::new(content);
    let mut examples: Vec<Example> = Vec::new();

    let mut current: Option<OpenBlock> = None;
    let mut pending_directives: Option<Directives> = None;
    let mut html: Option<String> = None;
    // Set right after a code block ends, cleared by any other block
    let mut output_target: Option<usize> = None;

    for (event, range) in Parser::new(content).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let (language, flags) = parse_fence_info(&info);
                let opening_end = content[range.clone()]
                    .find('\n')
                    .map_or(range.end, |i| range.start + i + 1);
                current = Some(OpenBlock {
                    body_end: opening_end,
                    flags_skip: flags.iter().any(|f| matches!(*f, "ignore" | "skip")),
                    language,
                    directives: pending_directives.take().unwrap_or_default(),
                    range,
                    code: String::new(),
                });
            }

            Event::Start(Tag::HtmlBlock) => {
                html = Some(String::new());
                output_target = None;
            }

            Event::Html(text) => {
                if let Some(buf) = html.as_mut() {
                    buf.push_str(&text);
                }
            }

            Event::End(TagEnd::HtmlBlock) => {
                pending_directives = html.take().and_then(|text| parse_directive_comment(&text));
            }

            Event::Text(text) => {
                if let Some(block) = current.as_mut() {
                    block.code.push_str(&text);
                    block.body_end = block.body_end.max(range.end);
                }
            }

            Event::End(TagEnd::CodeBlock) => {
                let Some(block) = current.take() else {
                    // Indented code blocks are not examples
                    output_target = None;
                    continue;
                };

                let line = lines.line_of(block.range.start);
                let opening = &content[block.range.start..block.body_end];
                let closing = &content[block.body_end.min(block.range.end)..block.range.end];
                if !is_terminated(opening, closing) {
                    return Err(Error::Parse {
                        path: path.to_path_buf(),
                        line,
                        message: "unterminated code fence".to_string(),
                    });
                }

                if block.language.eq_ignore_ascii_case(OUTPUT_TAG) {
                    if let Some(target) = output_target.take() {
                        examples[target].directives.output = Some(block.code);
                        continue;
                    }
                }

                let mut directives = block.directives;
                directives.skip |= block.flags_skip;

                examples.push(Example {
                    path: Arc::clone(&path),
                    index: examples.len() + 1,
                    line,
                    language: block.language,
                    code: block.code,
                    directives,
                });
                output_target = Some(examples.len() - 1);

                if examples.len() > MAX_BLOCKS_PER_FILE {
                    return Err(Error::Parse {
                        path: path.to_path_buf(),
                        line,
                        message: format!(
                            "more than {} code blocks in one file",
                            MAX_BLOCKS_PER_FILE
                        ),
                    });
                }
            }

            Event::Start(_) | Event::Rule => {
                pending_directives = None;
                output_target = None;
            }

            _ => {}
        }
    }

    Ok(examples)
}

/// Parse fence info string into language and flags
/// Examples:
/// - "bash" -> ("bash", [])
/// - "bash,ignore" -> ("bash", ["ignore"])
/// - "python title=demo.py" -> ("python", ["title=demo.py"])
fn parse_fence_info(info: &str) -> (String, Vec<&str>) {
    let mut parts = info.split(',').map(|s| s.trim());

    let Some(first) = parts.next() else {
        return (String::new(), Vec::new());
    };

    let mut words = first.split_whitespace();
    let language = words.next().unwrap_or_default().to_string();
    let flags = words.chain(parts).filter(|f| !f.is_empty()).collect();

    (language, flags)
}

/// Reads a `<!-- { ...json... } -->` comment. Comments that are not JSON
/// objects are ordinary comments and carry no directives.
fn parse_directive_comment(html: &str) -> Option<Directives> {
    let body = html
        .trim()
        .strip_prefix("<!--")?
        .strip_suffix("-->")?
        .trim();

    if !body.starts_with('{') {
        return None;
    }

    match serde_json::from_str::<Directives>(body) {
        Ok(directives) => Some(directives),
        Err(e) => {
            log::warn!("Ignoring malformed directive comment {:?}: {}", body, e);
            None
        }
    }
}

/// Whether a fenced block was closed by a fence.
///
/// pulldown-cmark closes unterminated fences implicitly at the end of the
/// document or enclosing container. In that case everything up to the end of
/// the block is code, so `closing` (the source between the last code byte and
/// the end of the block) holds no fence.
fn is_terminated(opening: &str, closing: &str) -> bool {
    let opening = strip_container_prefix(opening);
    let Some(fence_char) = opening.chars().next().filter(|c| matches!(c, '`' | '~')) else {
        return false;
    };
    let fence_len = opening.chars().take_while(|c| *c == fence_char).count();

    closing.lines().map(strip_container_prefix).any(|line| {
        let line = line.trim_end();
        let run = line.chars().take_while(|c| *c == fence_char).count();
        run >= fence_len && run == line.chars().count()
    })
}

/// Strips leading indentation and blockquote markers.
fn strip_container_prefix(line: &str) -> &str {
    line.trim_start_matches([' ', '\t', '>'])
}

/// Maps byte offsets to 1-based line numbers.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(content: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(content.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|start| *start <= offset)
    }
}
