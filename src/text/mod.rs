//! Text splitting for clause-level streaming and word-tier cache keys.

use std::sync::LazyLock;

use regex::Regex;

/// Split after any natural pause: sentence endings, commas, semicolons,
/// colons, dashes.
static CLAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[.!?,;:\u{2014}-])\s+").expect("clause regex"));

/// Split text into clauses at natural pause points.
///
/// The pause punctuation stays attached to the clause it ends; empty
/// fragments are dropped.
pub fn split_clauses(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let mut clauses = Vec::new();
    let mut start = 0;
    for m in CLAUSE_RE.find_iter(text) {
        // Keep the punctuation (first char of the match), drop the whitespace.
        let punct_end = start
            + text[start..m.end()]
                .trim_end()
                .len();
        let clause = text[start..punct_end].trim();
        if !clause.is_empty() {
            clauses.push(clause.to_string());
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        clauses.push(tail.to_string());
    }
    clauses
}

/// Normalize one word for the word-tier cache key: lowercased, surrounding
/// punctuation stripped. Returns `None` for words that reduce to nothing.
pub fn normalize_word(word: &str) -> Option<String> {
    let trimmed: String = word
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
        .to_lowercase();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Split a clause into normalized word keys, in order.
pub fn clause_words(clause: &str) -> Vec<String> {
    clause
        .split_whitespace()
        .filter_map(normalize_word)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentence_endings_and_commas() {
        let clauses = split_clauses("Hello there, how are you? Fine. Thanks");
        assert_eq!(
            clauses,
            vec!["Hello there,", "how are you?", "Fine.", "Thanks"]
        );
    }

    #[test]
    fn single_clause_passes_through() {
        assert_eq!(split_clauses("just one clause"), vec!["just one clause"]);
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(split_clauses("").is_empty());
        assert!(split_clauses("   \n  ").is_empty());
    }

    #[test]
    fn punctuation_without_trailing_space_does_not_split() {
        // "3.14" must stay one clause.
        assert_eq!(split_clauses("pi is 3.14 roughly"), vec!["pi is 3.14 roughly"]);
    }

    #[test]
    fn word_normalization() {
        assert_eq!(normalize_word("Hello,"), Some("hello".to_string()));
        assert_eq!(normalize_word("don't"), Some("don't".to_string()));
        assert_eq!(normalize_word("--"), None);
    }

    #[test]
    fn clause_words_are_ordered_and_normalized() {
        assert_eq!(
            clause_words("The Quick, brown FOX!"),
            vec!["the", "quick", "brown", "fox"]
        );
    }
}
