//! Jaccard set similarity and text normalization.
//!
//! Shared by the consensus evaluator to compare agent outputs category by
//! category. Kept dependency-free (just `regex` for run-collapsing) so it
//! can be unit tested and benchmarked in isolation.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn non_alphanumeric_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^[:alnum:]]+").unwrap())
}

/// Lowercase, collapse runs of non-alphanumeric runes to a single space,
/// and trim. Returns an empty string iff the input contains no letters or
/// digits.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = non_alphanumeric_run().replace_all(&lowered, " ");
    collapsed.trim().to_string()
}

/// Jaccard similarity over sets of normalized strings: `|A ∩ B| / |A ∪ B|`.
/// Both empty ⇒ 1.0. Exactly one empty ⇒ 0.0. Symmetric and reflexive for
/// non-empty sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Normalize every element of a raw string collection into a deduplicated
/// set, dropping elements that normalize to the empty string.
pub fn normalized_set<I, S>(items: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| normalize(s.as_ref()))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn both_empty_is_one() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
    }

    #[test]
    fn one_empty_is_zero() {
        assert_eq!(jaccard(&set(&["a"]), &set(&[])), 0.0);
        assert_eq!(jaccard(&set(&[]), &set(&["a"])), 0.0);
    }

    #[test]
    fn identical_sets_are_one() {
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["a", "b"])), 1.0);
    }

    #[test]
    fn disjoint_sets_are_zero() {
        assert_eq!(jaccard(&set(&["a"]), &set(&["b"])), 0.0);
    }

    #[test]
    fn partial_overlap() {
        // {a,b,c} ∩ {b,c,d} = {b,c}; union = {a,b,c,d}
        assert_eq!(jaccard(&set(&["a", "b", "c"]), &set(&["b", "c", "d"])), 0.5);
    }

    #[test]
    fn symmetric() {
        let a = set(&["a", "b"]);
        let b = set(&["b", "c", "d"]);
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
    }

    #[test]
    fn normalize_lowercases_and_collapses_punctuation() {
        assert_eq!(normalize("Hello,   World!!"), "hello world");
    }

    #[test]
    fn normalize_trims() {
        assert_eq!(normalize("  spaced out  "), "spaced out");
    }

    #[test]
    fn normalize_with_no_alnum_is_empty() {
        assert_eq!(normalize("!!! --- ???"), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalized_set_drops_empties_and_dedupes() {
        let result = normalized_set(["Risk: SQLi!", "risk sqli", "   "]);
        assert_eq!(result.len(), 1);
        assert!(result.contains("risk sqli"));
    }

    proptest::proptest! {
        #[test]
        fn jaccard_is_bounded(a in proptest::collection::hash_set("[a-c]", 0..5),
                               b in proptest::collection::hash_set("[a-c]", 0..5)) {
            let score = jaccard(&a, &b);
            proptest::prop_assert!(score >= 0.0 && score <= 1.0);
        }

        #[test]
        fn jaccard_is_symmetric(a in proptest::collection::hash_set("[a-d]", 0..6),
                                 b in proptest::collection::hash_set("[a-d]", 0..6)) {
            proptest::prop_assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        }

        #[test]
        fn jaccard_is_reflexive_for_nonempty(a in proptest::collection::hash_set("[a-d]", 1..6)) {
            proptest::prop_assert_eq!(jaccard(&a, &a), 1.0);
        }
    }
}
