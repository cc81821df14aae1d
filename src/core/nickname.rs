//! Nickname rules and look-alike detection

use crate::constants::{NICKNAME_MAX_LEN, NICKNAME_MIN_LEN};
use crate::error::{ChatError, Result};
use crate::profanity::ProfanityFilter;

// Overlap (in percent) above which one nickname is taken to contain the other
const SUBSTRING_OVERLAP_PERCENT: f64 = 70.0;
// Edit distance, relative to the reserved nickname length, below which two nicknames look alike
const MAX_DISTANCE_RATIO: f64 = 0.25;

fn is_nickname_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-'
}

/// Check a nickname against the format rules and the profanity filter.
///
/// Uniqueness and reserved-name checks need room state and happen in the store.
pub fn validate_nickname(nickname: &str, filter: &dyn ProfanityFilter) -> Result<()> {
    // Checked as stored: surrounding whitespace is dropped
    let nickname = nickname.trim();
    if nickname.is_empty() {
        return Err(ChatError::InvalidNickname(
            "You must provide a Nickname.".to_string(),
        ));
    }
    if !nickname.chars().all(is_nickname_char) {
        return Err(ChatError::InvalidNickname(
            "Only alpha-numeric characters, spaces, underscores and dashes are allowed in nicknames."
                .to_string(),
        ));
    }
    if nickname.len() < NICKNAME_MIN_LEN {
        return Err(ChatError::InvalidNickname(format!(
            "Nickname must be at least {} characters long.",
            NICKNAME_MIN_LEN
        )));
    }
    if nickname.len() > NICKNAME_MAX_LEN {
        return Err(ChatError::InvalidNickname(format!(
            "Nickname must be no more than {} characters long.",
            NICKNAME_MAX_LEN
        )));
    }
    if filter.is_profane_nickname(nickname) {
        return Err(ChatError::InvalidNickname(
            "This nickname is not allowed.".to_string(),
        ));
    }
    Ok(())
}

/// Canonical form used for comparing nicknames: trimmed and lowercased
pub fn nickname_key(nickname: &str) -> String {
    nickname.trim().to_lowercase()
}

// Lowercase with whitespace, underscores and dashes removed
fn squash(nickname: &str) -> String {
    nickname
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect()
}

// Share of `haystack` covered by `needle`, when `haystack` contains it
fn substring_percentage(haystack: &str, needle: &str) -> f64 {
    if haystack.is_empty() || !haystack.contains(needle) {
        return 0.0;
    }
    needle.chars().count() as f64 / haystack.chars().count() as f64 * 100.0
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Whether `input` looks like a disguised version of the reserved `against` nickname
pub fn is_nick_variation(input: &str, against: &str) -> bool {
    let input = squash(input);
    let against = squash(against);
    if against.is_empty() {
        return false;
    }

    if substring_percentage(&input, &against) >= SUBSTRING_OVERLAP_PERCENT
        || substring_percentage(&against, &input) >= SUBSTRING_OVERLAP_PERCENT
    {
        return true;
    }

    let distance = levenshtein(&input, &against) as f64;
    distance / against.chars().count() as f64 <= MAX_DISTANCE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profanity::WordListFilter;

    fn reason(result: Result<()>) -> String {
        match result {
            Err(ChatError::InvalidNickname(reason)) => reason,
            other => panic!("expected invalid nickname, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_nicknames() {
        let filter = WordListFilter::default();
        for nick in ["Alice", "bob_42", "Mr Smith", "x-y-z", "abc", "twenty chars exactly"] {
            assert!(validate_nickname(nick, &filter).is_ok(), "{} should be valid", nick);
        }
    }

    #[test]
    fn test_invalid_nicknames() {
        let filter = WordListFilter::new(["darn"], Vec::<String>::new());
        assert!(reason(validate_nickname("", &filter)).contains("provide"));
        assert!(reason(validate_nickname("   ", &filter)).contains("provide"));
        assert!(reason(validate_nickname("ab", &filter)).contains("at least"));
        assert!(reason(validate_nickname("this one is way too long", &filter)).contains("no more"));
        assert!(reason(validate_nickname("bad!nick", &filter)).contains("alpha-numeric"));
        assert!(reason(validate_nickname("darn it", &filter)).contains("not allowed"));
    }

    #[test]
    fn test_surrounding_whitespace_does_not_count() {
        let filter = WordListFilter::default();
        assert!(reason(validate_nickname(" ab", &filter)).contains("at least"));
        assert!(reason(validate_nickname("ab  ", &filter)).contains("at least"));
        assert!(validate_nickname("  twenty chars exactly  ", &filter).is_ok());
        assert!(validate_nickname("\tAlice", &filter).is_ok());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_nick_variation() {
        assert!(is_nick_variation("Webmaster", "Webmaster"));
        assert!(is_nick_variation("web_master", "Webmaster"));
        assert!(is_nick_variation("W e b M a s t e r", "Webmaster"));
        assert!(is_nick_variation("Webmasterr", "Webmaster"));
        assert!(is_nick_variation("Wbmaster", "Webmaster"));
        assert!(!is_nick_variation("Alice", "Webmaster"));
        assert!(!is_nick_variation("Master Chef", "Webmaster"));
        assert!(!is_nick_variation("Alice", ""));
    }
}
