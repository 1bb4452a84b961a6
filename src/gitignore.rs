//! Exclusion patterns in a subset of gitignore syntax.
//!
//! A pattern without a separator is a shell glob checked against the base name
//! of the candidate. A pattern with a separator is a path-aware glob checked
//! against the whole candidate, where `*` never crosses a separator and `**`
//! spans directories (leading `**/`, trailing `/**` and interior `/**/`).

use std::path::{Path, MAIN_SEPARATOR};

use globset::{GlobBuilder, GlobMatcher};

use crate::error::Result;

/// A compiled exclusion pattern.
#[derive(Clone, Debug)]
pub struct Pattern {
    source: String,
    negated: bool,
    kind: PatternKind,
}

#[derive(Clone, Debug)]
enum PatternKind {
    BaseName(glob::Pattern),
    Path { anchored: bool, matcher: GlobMatcher },
    /// Only separators: names the root, which is never a candidate.
    Nothing,
}

/// Decides whether `pattern` matches `candidate`.
///
/// Never fails: a malformed glob is logged and treated as non-matching.
pub fn matches(pattern: &str, candidate: &Path) -> bool {
    match Pattern::compile(pattern) {
        Ok(Some(p)) => p.matches(candidate),
        Ok(None) => false,
        Err(err) => {
            warn!("Ignoring malformed pattern {:?}: {}", pattern, err);
            false
        }
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == MAIN_SEPARATOR
}

impl Pattern {
    /// Compiles a pattern line.
    ///
    /// Returns `Ok(None)` for lines that never match anything: blanks and
    /// comments.
    pub fn compile(line: &str) -> Result<Option<Self>> {
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut normalized = line.trim_end_matches(' ');

        let negated = normalized.starts_with('!');
        if negated {
            normalized = &normalized[1..];
        }

        // "\#foo" and "\!foo" name files that literally start with # or !
        if normalized.starts_with("\\#") || normalized.starts_with("\\!") {
            normalized = &normalized[1..];
        }

        if normalized.is_empty() {
            return Ok(None);
        }

        let normalized = normalized.trim_end_matches(is_separator);
        let kind = if normalized.is_empty() {
            PatternKind::Nothing
        } else if normalized.contains(is_separator) {
            let anchored = normalized.starts_with(is_separator);
            let matcher = GlobBuilder::new(normalized)
                .literal_separator(true)
                .build()?
                .compile_matcher();
            PatternKind::Path { anchored, matcher }
        } else {
            PatternKind::BaseName(glob::Pattern::new(normalized)?)
        };

        Ok(Some(Self {
            source: line.to_owned(),
            negated,
            kind,
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub const fn is_negated(&self) -> bool {
        self.negated
    }

    pub fn matches(&self, candidate: &Path) -> bool {
        let found = match &self.kind {
            PatternKind::BaseName(glob) => candidate
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| glob.matches(name)),
            PatternKind::Path { anchored, matcher } => {
                if *anchored && candidate.is_relative() {
                    // a leading slash anchors at the root the candidate is relative to
                    matcher.is_match(Path::new(&MAIN_SEPARATOR.to_string()).join(candidate))
                } else {
                    matcher.is_match(candidate)
                }
            }
            PatternKind::Nothing => false,
        };

        found != self.negated
    }
}
