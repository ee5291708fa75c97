/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Public Suffix Index: a domain-label radix tree answering "organizational
//! domain of X" per the Public Suffix List algorithm. Immutable after
//! construction; safe for lock-free concurrent reads.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleTag {
    Normal,
    Exception,
    Wildcard,
}

/// One node per DNS label, keyed by the label in its original (lowercased)
/// form; children are reached by walking the domain's labels in reverse
/// (rightmost label first), matching spec's "example.com -> com\0example"
/// description.
#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    rule: Option<RuleTag>,
}

pub struct Index {
    root: Node,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

impl Index {
    /// Parse a Public Suffix List file's contents (already read to a
    /// string by the caller; spec names this `Build(filename)` but file
    /// I/O is a thin wrapper kept in `from_path`).
    pub fn parse(contents: &str) -> Result<Self> {
        let mut root = Node::default();
        let mut seen_keys: HashMap<String, ()> = HashMap::new();

        for raw_line in contents.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            let (rule, labels_str) = if let Some(rest) = line.strip_prefix('!') {
                (RuleTag::Exception, rest)
            } else if let Some(rest) = line.strip_prefix("*.") {
                (RuleTag::Wildcard, rest)
            } else {
                (RuleTag::Normal, line)
            };

            let labels: Vec<String> = labels_str
                .split('.')
                .map(|l| l.to_ascii_lowercase())
                .collect();
            if labels.is_empty() || labels.iter().any(|l| l.is_empty()) {
                continue;
            }

            let key = labels.join(".");
            if seen_keys.contains_key(&key) {
                // Duplicate entries: keep the first, log and move on.
                tracing::warn!(rule = %key, "duplicate Public Suffix List entry, keeping first");
                continue;
            }
            seen_keys.insert(key, ());

            let mut node = &mut root;
            for label in labels.iter().rev() {
                node = node.children.entry(label.clone()).or_default();
            }
            node.rule = Some(rule);
        }

        Ok(Self { root })
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Status::Config(format!("failed to read Public Suffix List {path:?}: {e}")))?;
        Self::parse(&contents)
    }

    /// Longest-suffix-match lookup, returning the matched rule tag and its
    /// label length, or `None` if nothing beyond the implicit wildcard
    /// matched.
    fn longest_match(&self, labels: &[String]) -> Option<(RuleTag, usize)> {
        let mut node = &self.root;
        let mut best: Option<(RuleTag, usize)> = None;
        let mut depth = 0usize;

        for label in labels.iter().rev() {
            let Some(child) = node.children.get(label) else { break };
            node = child;
            depth += 1;
            if let Some(rule) = node.rule {
                best = Some((rule, depth));
            }
        }
        best
    }

    /// Answer "organizational domain of `domain`", per the Public Suffix
    /// List matching algorithm:
    /// - Exception match -> return that suffix itself.
    /// - Normal match of length L -> rightmost L+1 labels.
    /// - Wildcard match of length L -> rightmost L+2 labels.
    /// - No match -> implicit wildcard-one-label: rightmost two labels.
    ///
    /// Returns `None` if the domain is too short for the selected rule.
    pub fn organizational_domain(&self, domain: &str) -> Option<String> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return None;
        }
        let labels: Vec<String> = domain.split('.').map(|s| s.to_string()).collect();

        let take_from_end = |n: usize| -> Option<String> {
            if n == 0 || n > labels.len() {
                return None;
            }
            Some(labels[labels.len() - n..].join("."))
        };

        match self.longest_match(&labels) {
            Some((RuleTag::Exception, len)) => take_from_end(len),
            Some((RuleTag::Normal, len)) => take_from_end(len + 1),
            Some((RuleTag::Wildcard, len)) => take_from_end(len + 2),
            None => take_from_end(2),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PSL: &str = "\
// plain rules
com
co.uk
// wildcard
*.ck
// exception
!www.ck
github.io
";

    #[test]
    fn normal_rule_returns_rightmost_two_labels() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("example.com"), Some("example.com".into()));
        assert_eq!(idx.organizational_domain("a.b.example.com"), Some("example.com".into()));
    }

    #[test]
    fn two_label_normal_rule_returns_rightmost_three_labels() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("example.co.uk"), Some("example.co.uk".into()));
        assert_eq!(idx.organizational_domain("www.example.co.uk"), Some("example.co.uk".into()));
    }

    #[test]
    fn wildcard_rule_takes_matched_length_plus_two() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        // *.ck matches "ck" plus one wildcard-consumed label, so "foo.ck" is
        // itself the public suffix and has no registrable part (matches
        // Mozilla's PSL test vector `checkPublicSuffix('test.ck', null)`).
        assert_eq!(idx.organizational_domain("foo.ck"), None);
        assert_eq!(idx.organizational_domain("example.foo.ck"), Some("example.foo.ck".into()));
        assert_eq!(idx.organizational_domain("a.example.foo.ck"), Some("example.foo.ck".into()));
    }

    #[test]
    fn exception_rule_returns_the_suffix_itself() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("www.ck"), Some("www.ck".into()));
    }

    #[test]
    fn no_match_falls_back_to_implicit_wildcard_one_label() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("foo.bar"), Some("foo.bar".into()));
    }

    #[test]
    fn too_short_domain_for_selected_rule_returns_none() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("co.uk"), None);
        assert_eq!(idx.organizational_domain("uk"), None);
    }

    #[test]
    fn duplicate_entries_keep_the_first() {
        let psl = "com\ncom\n";
        let idx = Index::parse(psl).unwrap();
        assert_eq!(idx.organizational_domain("example.com"), Some("example.com".into()));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let idx = Index::parse(SAMPLE_PSL).unwrap();
        assert_eq!(idx.organizational_domain("EXAMPLE.COM"), Some("example.com".into()));
    }
}
