//! Text repairs applied to generated code before validation.
//!
//! Every step is a pure string rewrite. Nothing here parses JavaScript: a rule
//! that does not match leaves the text as it was.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{EffectSource, NormalizedEffectSource};
use crate::core::validator::TEARDOWN_FUNCTION;

/// Fence delimiter, with an optional language tag and the line break that
/// closes an opening fence. JavaScript-family tags are always consumed; any
/// other word only when it ends the line, so code glued to a fence keeps its
/// first token.
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"```(?:",
        r"(?i:javascript|typescript|jsx|tsx|js|ts)(?:[ \t]*\r?\n|[ \t]+|$)",
        r"|[A-Za-z][\w+.-]*[ \t]*(?:\r?\n|$)",
        r"|[ \t]*(?:\r?\n)?",
        r")",
    ))
    .unwrap()
});

/// Anonymous zero-argument teardown returned from the entry point.
static ANONYMOUS_TEARDOWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"return\s*\(\s*\)\s*=>\s*\{|return\s+function\s*\(\s*\)\s*\{").unwrap()
});

/// Result of normalizing one source, with counters for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    pub source: NormalizedEffectSource,
    /// Fence delimiters removed.
    pub fences_stripped: usize,
    /// Anonymous teardowns rewritten into the named form.
    pub teardown_rewrites: usize,
}

/// Normalize `source`: strip fences, trim, repair the teardown idiom.
pub fn normalize(source: &EffectSource) -> NormalizedEffectSource {
    normalize_with_report(source).source
}

/// Same as [`normalize`], also reporting which rules fired.
pub fn normalize_with_report(source: &EffectSource) -> Normalization {
    let (unfenced, fences_stripped) = strip_fences(source.as_str());
    let trimmed = unfenced.trim();
    let (repaired, teardown_rewrites) = repair_teardown(trimmed);

    Normalization {
        source: NormalizedEffectSource::from_normalized(repaired),
        fences_stripped,
        teardown_rewrites,
    }
}

fn strip_fences(text: &str) -> (String, usize) {
    let count = FENCE_RE.find_iter(text).count();
    if count == 0 {
        return (text.to_string(), 0);
    }
    (FENCE_RE.replace_all(text, "").into_owned(), count)
}

fn repair_teardown(text: &str) -> (String, usize) {
    if text.contains(&canonical_teardown_call()) {
        return (text.to_string(), 0);
    }
    let count = ANONYMOUS_TEARDOWN_RE.find_iter(text).count();
    if count == 0 {
        return (text.to_string(), 0);
    }
    let replacement = format!("{} {{", canonical_teardown_call());
    let repaired = ANONYMOUS_TEARDOWN_RE
        .replace_all(text, regex::NoExpand(&replacement))
        .into_owned();
    (repaired, count)
}

/// `return function cleanup()`
fn canonical_teardown_call() -> String {
    format!("return function {TEARDOWN_FUNCTION}()")
}
