//! Mapping from query member names to wire field paths.
//!
//! Rust field names rarely match the JSON the documents were stored with.
//! A `PropertyPolicy` is attached to each client and applied whenever a
//! field path is rendered into a Mango selector or sort entry.

use std::collections::HashMap;

use crate::expr::{FieldPath, Segment};

/// Case style applied to member segments that have no override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseStyle {
    /// Use the member name exactly as written.
    #[default]
    AsIs,
    /// `FirstName` -> `firstname`
    Lower,
    /// `first_name` -> `firstName`
    Camel,
    /// `FirstName` -> `first_name`
    Snake,
    /// `FirstName` -> `first-name`
    Kebab,
}

/// How array index segments are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayIndexing {
    /// `tags[0].label`
    #[default]
    Bracket,
    /// `tags.0.label`
    Dot,
}

/// Per-client naming policy for wire field paths.
#[derive(Debug, Clone, Default)]
pub struct PropertyPolicy {
    pub case_style: CaseStyle,
    /// Exact wire-name replacements, keyed by the member name as written in
    /// the query. A dotted key (`"address.city"`) pins the override to that
    /// member chain; a bare key applies wherever the member appears.
    pub overrides: HashMap<String, String>,
    pub array_indexing: ArrayIndexing,
}

impl PropertyPolicy {
    pub fn new(case_style: CaseStyle) -> Self {
        Self {
            case_style,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, member: impl Into<String>, wire: impl Into<String>) -> Self {
        self.overrides.insert(member.into(), wire.into());
        self
    }

    pub fn with_array_indexing(mut self, indexing: ArrayIndexing) -> Self {
        self.array_indexing = indexing;
        self
    }

    /// Render a field path into its dotted wire form.
    ///
    /// Returns `None` for an empty path (the array-element marker inside
    /// `$elemMatch`/`$allMatch` predicates, which has no wire name).
    pub fn resolve(&self, path: &FieldPath) -> Option<String> {
        if path.segments().is_empty() {
            return None;
        }

        let mut out = String::new();
        // As-written dotted chain of member segments seen so far, used to
        // match dotted override keys.
        let mut chain = String::new();

        for segment in path.segments() {
            match segment {
                Segment::Member(name) => {
                    if !chain.is_empty() {
                        chain.push('.');
                    }
                    chain.push_str(name);

                    let wire = self
                        .overrides
                        .get(chain.as_str())
                        .or_else(|| self.overrides.get(name.as_str()))
                        .cloned()
                        .unwrap_or_else(|| apply_case(self.case_style, name));

                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(&wire);
                }
                Segment::Index(i) => match self.array_indexing {
                    ArrayIndexing::Bracket => {
                        out.push_str(&format!("[{}]", i));
                    }
                    ArrayIndexing::Dot => {
                        if !out.is_empty() {
                            out.push('.');
                        }
                        out.push_str(&i.to_string());
                    }
                },
            }
        }

        Some(out)
    }
}

fn apply_case(style: CaseStyle, name: &str) -> String {
    match style {
        CaseStyle::AsIs => name.to_string(),
        CaseStyle::Lower => name.to_lowercase(),
        CaseStyle::Camel => {
            let words = split_words(name);
            let mut out = String::new();
            for (i, w) in words.iter().enumerate() {
                if i == 0 {
                    out.push_str(&w.to_lowercase());
                } else {
                    out.push_str(&capitalize(w));
                }
            }
            out
        }
        CaseStyle::Snake => split_words(name)
            .iter()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join("_"),
        CaseStyle::Kebab => split_words(name)
            .iter()
            .map(|w| w.to_lowercase())
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Split a member name into words at `_`, `-`, and case boundaries.
///
/// Acronym runs stay together: `HTTPStatus` -> `["HTTP", "Status"]`.
fn split_words(name: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = name.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if c.is_uppercase() && !current.is_empty() {
            let prev_lower = chars[i - 1].is_lowercase();
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev_lower || (chars[i - 1].is_uppercase() && next_lower) {
                words.push(std::mem::take(&mut current));
            }
        }

        current.push(c);
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
