//! Splicing generated edits into existing content.
//!
//! Locating where a change goes is tried in order of precision: an exact,
//! unique match of the snippet; a unique anchor line whose window still
//! aligns with the snippet; then a windowed line alignment scored with
//! `similar`. Full rewrites are reduced to the
//! minimal changed line span so the recorded edit stays localized.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use similar::{DiffTag, TextDiff};
use thiserror::Error;

use crate::domain::models::{EditSpan, SpliceStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Before,
    After,
}

/// Edit requested by the provider for an existing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditInstruction {
    /// Replace `original` with `replacement`.
    Replace { original: String, replacement: String },
    /// Insert `content` next to the line matching `anchor`.
    Insert {
        anchor: String,
        position: InsertPosition,
        content: String,
    },
    /// Full replacement content for the file.
    Rewrite { content: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpliceError {
    #[error("edit target is empty")]
    EmptyTarget,

    #[error("no location matches '{0}'")]
    NotFound(String),

    #[error("'{snippet}' matches {count} locations")]
    Ambiguous { snippet: String, count: usize },
}

/// Content after an edit plus the span it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub content: String,
    pub span: EditSpan,
}

/// Applies [`EditInstruction`]s to a base text.
#[derive(Debug, Clone, Copy)]
pub struct PrecisionEditor {
    alignment_threshold: f32,
}

impl PrecisionEditor {
    pub fn new(alignment_threshold: f32) -> Self {
        Self {
            alignment_threshold,
        }
    }

    pub fn apply(&self, base: &str, edit: &EditInstruction) -> Result<Splice, SpliceError> {
        match edit {
            EditInstruction::Replace {
                original,
                replacement,
            } => self.replace(base, original, replacement),
            EditInstruction::Insert {
                anchor,
                position,
                content,
            } => self.insert(base, anchor, *position, content),
            EditInstruction::Rewrite { content } => Ok(Splice {
                content: content.clone(),
                span: changed_span(base, content, SpliceStrategy::DiffSpan),
            }),
        }
    }

    fn replace(&self, base: &str, original: &str, replacement: &str) -> Result<Splice, SpliceError> {
        if original.trim().is_empty() {
            return Err(SpliceError::EmptyTarget);
        }

        let exact = base.matches(original).count();
        if exact == 1 {
            let content = base.replacen(original, replacement, 1);
            let span = changed_span(base, &content, SpliceStrategy::ExactMatch);
            return Ok(Splice { content, span });
        }
        if exact > 1 {
            return Err(SpliceError::Ambiguous {
                snippet: preview(original),
                count: exact,
            });
        }

        let lines = split_lines(base);
        let needle: Vec<&str> = original.lines().collect();
        let (start, end, strategy) = self.locate_block(&lines, &needle, original)?;

        let mut out: Vec<String> = lines[..start].iter().map(|l| l.to_string()).collect();
        out.extend(replacement.lines().map(str::to_string));
        out.extend(lines[end..].iter().map(|l| l.to_string()));

        let content = join_lines(&out, base.ends_with('\n'));
        let span = changed_span(base, &content, strategy);
        Ok(Splice { content, span })
    }

    fn insert(
        &self,
        base: &str,
        anchor: &str,
        position: InsertPosition,
        content: &str,
    ) -> Result<Splice, SpliceError> {
        if anchor.trim().is_empty() {
            return Err(SpliceError::EmptyTarget);
        }

        let lines = split_lines(base);
        let (start, end, strategy) = match base.matches(anchor).count() {
            1 => {
                let offset = base.find(anchor).unwrap_or(0);
                let start = base[..offset].matches('\n').count();
                let end = start + anchor.trim_end_matches('\n').matches('\n').count() + 1;
                (start, end.min(lines.len()), SpliceStrategy::ExactMatch)
            }
            0 => {
                let needle: Vec<&str> = anchor.lines().collect();
                self.locate_block(&lines, &needle, anchor)?
            }
            count => {
                return Err(SpliceError::Ambiguous {
                    snippet: preview(anchor),
                    count,
                })
            }
        };

        let at = match position {
            InsertPosition::Before => start,
            InsertPosition::After => end,
        };
        let indent = lines
            .get(start)
            .map(|l| &l[..l.len() - l.trim_start().len()])
            .unwrap_or("");
        let inserted = indent_block(content, indent);

        let mut out: Vec<String> = lines[..at].iter().map(|l| l.to_string()).collect();
        out.extend(inserted);
        out.extend(lines[at..].iter().map(|l| l.to_string()));

        let content = join_lines(&out, base.ends_with('\n'));
        let span = changed_span(base, &content, strategy);
        Ok(Splice { content, span })
    }

    /// Locate a block of lines by unique anchor line, then by alignment.
    fn locate_block(
        &self,
        lines: &[&str],
        needle: &[&str],
        raw: &str,
    ) -> Result<(usize, usize, SpliceStrategy), SpliceError> {
        let Some(anchor) = needle.iter().map(|l| l.trim()).find(|l| !l.is_empty()) else {
            return Err(SpliceError::EmptyTarget);
        };
        let anchor_offset = needle.iter().position(|l| l.trim() == anchor).unwrap_or(0);
        let span_len = needle.len().max(1);

        let hits: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.trim() == anchor)
            .map(|(i, _)| i)
            .collect();
        if let [hit] = hits.as_slice() {
            if *hit >= anchor_offset {
                let start = hit - anchor_offset;
                let end = (start + span_len).min(lines.len());
                // The anchored window must still resemble the whole snippet.
                if line_ratio(&lines[start..end], needle) >= self.alignment_threshold {
                    return Ok((start, end, SpliceStrategy::Anchor));
                }
            }
        }

        match self.align(lines, needle) {
            Some((start, end)) => Ok((start, end, SpliceStrategy::Alignment)),
            None if hits.len() > 1 => Err(SpliceError::Ambiguous {
                snippet: preview(raw),
                count: hits.len(),
            }),
            None => Err(SpliceError::NotFound(preview(raw))),
        }
    }

    /// Best window of `needle.len()` lines, scored by `similar` line ratio
    /// with character ratio breaking ties. The line ratio must reach the
    /// alignment threshold; a window tied on both scores is no match.
    fn align(&self, lines: &[&str], needle: &[&str]) -> Option<(usize, usize)> {
        let width = needle.len();
        if width == 0 || lines.len() < width {
            return None;
        }
        let target = normalized_block(needle);

        let mut best: Option<(usize, f32, f32)> = None;
        let mut tied = false;
        for start in 0..=lines.len() - width {
            let window = normalized_block(&lines[start..start + width]);
            let line_ratio = TextDiff::from_lines(window.as_str(), target.as_str()).ratio();
            let char_ratio = TextDiff::from_chars(window.as_str(), target.as_str()).ratio();

            match best {
                Some((_, bl, bc)) if line_ratio == bl && char_ratio == bc => tied = true,
                Some((_, bl, bc)) if (line_ratio, char_ratio) < (bl, bc) => {}
                _ => {
                    best = Some((start, line_ratio, char_ratio));
                    tied = false;
                }
            }
        }

        let (start, line_ratio, _) = best?;
        (!tied && line_ratio >= self.alignment_threshold).then_some((start, start + width))
    }
}

/// Minimal changed line span between `old` and `new`.
pub fn changed_span(old: &str, new: &str, strategy: SpliceStrategy) -> EditSpan {
    let diff = TextDiff::from_lines(old, new);
    let changed: Vec<_> = diff
        .ops()
        .iter()
        .filter(|op| op.tag() != DiffTag::Equal)
        .collect();

    match (changed.first(), changed.last()) {
        (Some(first), Some(last)) => {
            let start = first.old_range().start;
            let end = last.old_range().end;
            let inserted = last.new_range().end - first.new_range().start;
            EditSpan {
                start,
                end,
                inserted,
                strategy,
            }
        }
        _ => EditSpan {
            start: 0,
            end: 0,
            inserted: 0,
            strategy,
        },
    }
}

/// Unified diff with three lines of context.
pub fn unified_diff(path: &str, original: Option<&str>, new: &str) -> String {
    let old_header = if original.is_some() {
        format!("a/{path}")
    } else {
        "/dev/null".to_string()
    };
    TextDiff::from_lines(original.unwrap_or(""), new)
        .unified_diff()
        .context_radius(3)
        .header(&old_header, &format!("b/{path}"))
        .to_string()
}

/// `similar` line ratio of two blocks, ignoring indentation.
fn line_ratio(window: &[&str], needle: &[&str]) -> f32 {
    let window = normalized_block(window);
    let needle = normalized_block(needle);
    TextDiff::from_lines(window.as_str(), needle.as_str()).ratio()
}

fn normalized_block(lines: &[&str]) -> String {
    let mut block = String::new();
    for line in lines {
        block.push_str(line.trim());
        block.push('\n');
    }
    block
}

fn split_lines(text: &str) -> Vec<&str> {
    text.lines().collect()
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Prefix `indent` to a block written without any indentation of its own.
fn indent_block(content: &str, indent: &str) -> Vec<String> {
    let already_indented = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .all(|l| l.starts_with([' ', '\t']));
    content
        .lines()
        .map(|l| {
            if indent.is_empty() || already_indented || l.trim().is_empty() {
                l.to_string()
            } else {
                format!("{indent}{l}")
            }
        })
        .collect()
}

fn preview(snippet: &str) -> String {
    let first = snippet.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut preview: String = first.trim().chars().take(60).collect();
    if first.trim().chars().count() > 60 {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "fn main() {\n    let config = load();\n    run(config);\n}\n\nfn load() -> Config {\n    Config::default()\n}\n";

    fn editor() -> PrecisionEditor {
        PrecisionEditor::new(0.6)
    }

    #[test]
    fn test_exact_replace_touches_one_line() {
        let splice = editor()
            .apply(
                BASE,
                &EditInstruction::Replace {
                    original: "run(config);".into(),
                    replacement: "run(config)?;".into(),
                },
            )
            .unwrap();

        assert!(splice.content.contains("    run(config)?;\n"));
        assert_eq!(splice.span.strategy, SpliceStrategy::ExactMatch);
        assert_eq!((splice.span.start, splice.span.end, splice.span.inserted), (2, 3, 1));
    }

    #[test]
    fn test_anchor_replace_when_whitespace_differs() {
        let splice = editor()
            .apply(
                BASE,
                &EditInstruction::Replace {
                    original: "fn load() -> Config {\n  Config::default()\n}".into(),
                    replacement: "fn load() -> Config {\n    Config::from_env()\n}".into(),
                },
            )
            .unwrap();

        assert_eq!(splice.span.strategy, SpliceStrategy::Anchor);
        assert!(splice.content.contains("Config::from_env()"));
        assert!(splice.content.starts_with("fn main() {\n"));
        assert!(splice.content.ends_with("}\n"));
    }

    #[test]
    fn test_anchor_window_must_match_the_rest_of_the_snippet() {
        let base = "fn a() {\n    x();\n    y();\n}\nfn b() {}\n";
        let err = editor()
            .apply(
                base,
                &EditInstruction::Replace {
                    original: "fn a() {\n    totally_unrelated();\n    nothing_like_this();".into(),
                    replacement: "fn a() {\n    z();".into(),
                },
            )
            .unwrap_err();

        assert!(matches!(err, SpliceError::NotFound(_)));
    }

    #[test]
    fn test_alignment_fallback() {
        let base = "alpha\nbeta\ngamma\ndelta\nepsilon\n";
        let splice = editor()
            .apply(
                base,
                &EditInstruction::Replace {
                    original: "beta_x\ngamma\ndelta".into(),
                    replacement: "BETA\nGAMMA\nDELTA".into(),
                },
            )
            .unwrap();
        assert_eq!(splice.span.strategy, SpliceStrategy::Alignment);
        assert_eq!(splice.content, "alpha\nBETA\nGAMMA\nDELTA\nepsilon\n");
    }

    #[test]
    fn test_unlocatable_replace_fails() {
        let err = editor()
            .apply(
                BASE,
                &EditInstruction::Replace {
                    original: "something that is not there".into(),
                    replacement: "x".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, SpliceError::NotFound(_)));
    }

    #[test]
    fn test_ambiguous_exact_match_fails() {
        let err = editor()
            .apply(
                "x = 1\nx = 1\n",
                &EditInstruction::Replace {
                    original: "x = 1".into(),
                    replacement: "x = 2".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, SpliceError::Ambiguous { count: 2, .. }));
    }

    #[test]
    fn test_insert_after_anchor_inherits_indent() {
        let splice = editor()
            .apply(
                BASE,
                &EditInstruction::Insert {
                    anchor: "let config = load();".into(),
                    position: InsertPosition::After,
                    content: "config.validate()?;".into(),
                },
            )
            .unwrap();

        assert!(splice
            .content
            .contains("    let config = load();\n    config.validate()?;\n    run(config);"));
        assert_eq!((splice.span.start, splice.span.end, splice.span.inserted), (2, 2, 1));
    }

    #[test]
    fn test_rewrite_reduces_to_minimal_span() {
        let rewritten = BASE.replace("Config::default()", "Config::new()");
        let splice = editor()
            .apply(BASE, &EditInstruction::Rewrite { content: rewritten.clone() })
            .unwrap();

        assert_eq!(splice.content, rewritten);
        assert_eq!(splice.span.strategy, SpliceStrategy::DiffSpan);
        assert_eq!((splice.span.start, splice.span.removed()), (6, 1));
    }

    #[test]
    fn test_unified_diff_headers_and_context() {
        let new = BASE.replace("run(config);", "run(config)?;");
        let diff = unified_diff("src/main.rs", Some(BASE), &new);
        assert!(diff.starts_with("--- a/src/main.rs\n+++ b/src/main.rs\n"));
        assert!(diff.contains("-    run(config);"));
        assert!(diff.contains("+    run(config)?;"));

        let created = unified_diff("src/new.rs", None, "fn a() {}\n");
        assert!(created.starts_with("--- /dev/null\n"));
    }

    #[test]
    fn test_edit_instruction_wire_format() {
        let edit: EditInstruction = serde_json::from_value(serde_json::json!({
            "kind": "insert", "anchor": "fn main", "position": "before", "content": "// entry"
        }))
        .unwrap();
        assert!(matches!(edit, EditInstruction::Insert { position: InsertPosition::Before, .. }));
    }
}
