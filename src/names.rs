//! Person-name comparison.
//!
//! Names coming from different stores differ in case, spacing, accents and in
//! how many of a person's names were typed. Everything that decides whether two
//! names could be the same person goes through here.

use std::collections::BTreeSet;

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Strip diacritics, lowercase, trim and collapse inner whitespace.
pub fn normalize_name(name: &str) -> String {
    let folded: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn name_tokens(name: &str) -> BTreeSet<String> {
    normalize_name(name)
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// True when one name's tokens are a non-empty subset of the other's.
///
/// "John Michael Smith" matches "John Smith" and "josé" matches "Jose", while
/// "John Smith" does not match "Jane Smith".
pub fn names_match(a: &str, b: &str) -> bool {
    let left = name_tokens(a);
    let right = name_tokens(b);
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left.is_subset(&right) || right.is_subset(&left)
}

/// Case-insensitive equality on trimmed names, without any token logic.
pub fn same_text(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("  José   García ", "jose garcia")]
    #[case("ÅSA", "asa")]
    #[case("Zoë\tKravitz", "zoe kravitz")]
    #[case("   ", "")]
    fn normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_name(input), expected);
    }

    #[rstest]
    #[case("John Michael Smith", "John Smith", true)]
    #[case("john smith", "JOHN SMITH", true)]
    #[case("José", "Jose Ramirez", true)]
    #[case("John Smith", "Jane Smith", false)]
    #[case("Alice", "Bob", false)]
    #[case("", "Alice", false)]
    #[case("  ", "  ", false)]
    fn matches_names(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(names_match(a, b), expected);
        assert_eq!(names_match(b, a), expected);
    }

    #[test]
    fn same_text_ignores_case_but_not_accents() {
        assert!(same_text(" Alice ", "alice"));
        assert!(!same_text("Zoë", "Zoe"));
        assert!(!same_text("", ""));
    }
}
