//! Line-level diffs between two snapshot file lists.
//!
//! Files are matched strictly by name. A file missing on one side is
//! diffed against empty content, so a rename shows up as one full delete
//! plus one full insert.
//!
//! [`summarize`] turns a diff into a short label using an ordered rule
//! list. The first matching rule wins:
//!
//! | Order | Rule                                       | Label                      |
//! |-------|--------------------------------------------|----------------------------|
//! | 1     | added line with a log-statement marker     | Added log statement        |
//! | 2     | any removed line                           | Removed lines              |
//! | 3     | added line with a function marker          | Added function             |
//! | 4     | added line with a conditional marker       | Updated conditional logic  |
//! | 5     | fallback                                   | Updated code               |

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeMap, BTreeSet};

use crate::VersionFile;

const LOG_MARKERS: &[&str] = &[
    "console.log",
    "console.error",
    "print(",
    "println!",
    "printf(",
    "System.out.print",
    "log::",
    "logger.",
];

const FUNCTION_MARKERS: &[&str] = &["function ", "function(", "=>", "def ", "fn ", "func "];

const CONDITIONAL_MARKERS: &[&str] = &["if ", "if(", "else", "switch ", "switch(", "match "];

/// Kind of a diff run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffTag {
    Unchanged,
    Added,
    Removed,
}

/// A run of consecutive lines sharing the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPart {
    pub tag: DiffTag,
    pub lines: Vec<String>,
}

/// The line diff of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file_name: String,
    pub parts: Vec<DiffPart>,
}

impl FileDiff {
    fn count(&self, tag: DiffTag) -> usize {
        self.parts
            .iter()
            .filter(|p| p.tag == tag)
            .map(|p| p.lines.len())
            .sum()
    }

    pub fn added_lines(&self) -> usize {
        self.count(DiffTag::Added)
    }

    pub fn removed_lines(&self) -> usize {
        self.count(DiffTag::Removed)
    }

    pub fn unchanged_lines(&self) -> usize {
        self.count(DiffTag::Unchanged)
    }

    /// Whether the file differs at all between the two sides.
    pub fn has_changes(&self) -> bool {
        self.parts.iter().any(|p| p.tag != DiffTag::Unchanged)
    }

    fn lines_tagged(&self, tag: DiffTag) -> impl Iterator<Item = &str> {
        self.parts
            .iter()
            .filter(move |p| p.tag == tag)
            .flat_map(|p| p.lines.iter().map(String::as_str))
    }
}

/// Diff two pieces of text line by line, grouping consecutive lines into runs.
pub fn diff_lines(old: &str, new: &str) -> Vec<DiffPart> {
    let diff = TextDiff::from_lines(old, new);
    let mut parts: Vec<DiffPart> = Vec::new();

    for change in diff.iter_all_changes() {
        let tag = match change.tag() {
            ChangeTag::Equal => DiffTag::Unchanged,
            ChangeTag::Insert => DiffTag::Added,
            ChangeTag::Delete => DiffTag::Removed,
        };
        let value = change.value();
        let line = value
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(value)
            .to_string();

        match parts.last_mut() {
            Some(part) if part.tag == tag => part.lines.push(line),
            _ => parts.push(DiffPart {
                tag,
                lines: vec![line],
            }),
        }
    }

    parts
}

/// Diff two snapshot file lists, one entry per file name in the union.
///
/// Output is ordered by file name. Duplicate names within one side keep
/// the last occurrence.
pub fn diff_file_sets(a: &[VersionFile], b: &[VersionFile]) -> Vec<FileDiff> {
    let by_name = |files: &[VersionFile]| -> BTreeMap<String, String> {
        files
            .iter()
            .map(|f| (f.name.clone(), f.content.clone()))
            .collect()
    };
    let old = by_name(a);
    let new = by_name(b);

    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    names
        .into_iter()
        .map(|name| {
            let before = old.get(name).map(String::as_str).unwrap_or("");
            let after = new.get(name).map(String::as_str).unwrap_or("");
            FileDiff {
                file_name: name.clone(),
                parts: diff_lines(before, after),
            }
        })
        .collect()
}

/// Heuristic label for a set of file diffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSummary {
    LogStatementAdded,
    LinesRemoved,
    FunctionAdded,
    ConditionalChanged,
    Updated,
}

impl ChangeSummary {
    pub fn message(&self) -> &'static str {
        match self {
            ChangeSummary::LogStatementAdded => "Added log statement",
            ChangeSummary::LinesRemoved => "Removed lines",
            ChangeSummary::FunctionAdded => "Added function",
            ChangeSummary::ConditionalChanged => "Updated conditional logic",
            ChangeSummary::Updated => "Updated code",
        }
    }
}

impl std::fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

fn any_added_with(diffs: &[FileDiff], markers: &[&str]) -> bool {
    diffs.iter().any(|d| {
        d.lines_tagged(DiffTag::Added)
            .any(|line| markers.iter().any(|m| line.contains(m)))
    })
}

/// Pick the summary label for a diff. Rule order is fixed.
pub fn summarize(diffs: &[FileDiff]) -> ChangeSummary {
    if any_added_with(diffs, LOG_MARKERS) {
        return ChangeSummary::LogStatementAdded;
    }
    if diffs.iter().any(|d| d.removed_lines() > 0) {
        return ChangeSummary::LinesRemoved;
    }
    if any_added_with(diffs, FUNCTION_MARKERS) {
        return ChangeSummary::FunctionAdded;
    }
    if any_added_with(diffs, CONDITIONAL_MARKERS) {
        return ChangeSummary::ConditionalChanged;
    }
    log::trace!("no summary rule matched {} file diffs", diffs.len());
    ChangeSummary::Updated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> Vec<VersionFile> {
        entries
            .iter()
            .map(|(n, c)| VersionFile::new(*n, *c))
            .collect()
    }

    #[test]
    fn test_single_line_replacement() {
        let a = files(&[("x.js", "a\nb")]);
        let b = files(&[("x.js", "a\nc")]);
        let diffs = diff_file_sets(&a, &b);

        assert_eq!(diffs.len(), 1);
        let d = &diffs[0];
        assert_eq!(d.file_name, "x.js");
        assert_eq!(
            d.parts,
            vec![
                DiffPart { tag: DiffTag::Unchanged, lines: vec!["a".into()] },
                DiffPart { tag: DiffTag::Removed, lines: vec!["b".into()] },
                DiffPart { tag: DiffTag::Added, lines: vec!["c".into()] },
            ]
        );
        assert_eq!(summarize(&diffs), ChangeSummary::LinesRemoved);
    }

    #[test]
    fn test_identical_sets_have_no_changes() {
        let a = files(&[("x.js", "a\nb"), ("y.py", "print(1)\n")]);
        let diffs = diff_file_sets(&a, &a);

        assert_eq!(diffs.len(), 2);
        for d in &diffs {
            assert_eq!(d.added_lines(), 0);
            assert_eq!(d.removed_lines(), 0);
            assert!(!d.has_changes());
        }
        assert_eq!(summarize(&diffs), ChangeSummary::Updated);
    }

    #[test]
    fn test_file_only_in_new_is_full_insert() {
        let a = files(&[("x.js", "a")]);
        let b = files(&[("x.js", "a"), ("y.js", "one\ntwo\nthree")]);
        let diffs = diff_file_sets(&a, &b);

        let y = diffs.iter().find(|d| d.file_name == "y.js").unwrap();
        assert_eq!(
            y.parts,
            vec![DiffPart {
                tag: DiffTag::Added,
                lines: vec!["one".into(), "two".into(), "three".into()],
            }]
        );
    }

    #[test]
    fn test_file_only_in_old_is_full_delete() {
        let a = files(&[("gone.py", "x = 1\ny = 2\n")]);
        let diffs = diff_file_sets(&a, &[]);

        assert_eq!(diffs[0].removed_lines(), 2);
        assert_eq!(diffs[0].added_lines(), 0);
    }

    #[test]
    fn test_rename_is_delete_plus_insert() {
        let a = files(&[("old.js", "let a = 1;")]);
        let b = files(&[("new.js", "let a = 1;")]);
        let diffs = diff_file_sets(&a, &b);

        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].file_name, "new.js");
        assert_eq!(diffs[0].added_lines(), 1);
        assert_eq!(diffs[1].file_name, "old.js");
        assert_eq!(diffs[1].removed_lines(), 1);
    }

    #[test]
    fn test_log_rule_beats_removal() {
        let a = files(&[("x.js", "a\nb")]);
        let b = files(&[("x.js", "a\nconsole.log(a)")]);
        let diffs = diff_file_sets(&a, &b);

        assert!(diffs[0].removed_lines() > 0);
        assert_eq!(summarize(&diffs), ChangeSummary::LogStatementAdded);
    }

    #[test]
    fn test_removal_beats_function() {
        let a = files(&[("x.py", "x = 1")]);
        let b = files(&[("x.py", "def f():\n    return 1")]);
        assert_eq!(summarize(&diff_file_sets(&a, &b)), ChangeSummary::LinesRemoved);
    }

    #[test]
    fn test_function_beats_conditional() {
        let a = files(&[("x.js", "")]);
        let b = files(&[("x.js", "function f(x) {\n  if (x) return 1;\n}")]);
        assert_eq!(summarize(&diff_file_sets(&a, &b)), ChangeSummary::FunctionAdded);
    }

    #[test]
    fn test_conditional_rule() {
        let a = files(&[("x.js", "let a = 1;\n")]);
        let b = files(&[("x.js", "let a = 1;\nif (a) a++;\n")]);
        assert_eq!(
            summarize(&diff_file_sets(&a, &b)),
            ChangeSummary::ConditionalChanged
        );
    }

    #[test]
    fn test_plain_addition_is_generic_update() {
        let a = files(&[("notes.txt", "hello\n")]);
        let b = files(&[("notes.txt", "hello\nworld\n")]);
        let summary = summarize(&diff_file_sets(&a, &b));
        assert_eq!(summary, ChangeSummary::Updated);
        assert_eq!(summary.to_string(), "Updated code");
    }

    #[test]
    fn test_crlf_lines_are_trimmed() {
        let parts = diff_lines("a\r\nb\r\n", "a\r\nb\r\n");
        assert_eq!(parts[0].lines, vec!["a".to_string(), "b".to_string()]);
    }
}
