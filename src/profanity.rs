//! Word-list profanity screening
//!
//! Two lists are used: censored words are masked in messages, blocked
//! words reject the whole message.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::info;

use crate::error::Result;

/// Content screening consulted by the store before a message is posted
pub trait ProfanityFilter: Send + Sync {
    /// Whether the text contains a word that must never be posted
    fn has_blocked_words(&self, text: &str) -> bool;

    fn contains_censored_word(&self, text: &str) -> bool;

    /// Replace the interior of every censored word with `*`
    fn mask_censored_words(&self, text: &str) -> String;

    fn is_profane_nickname(&self, nickname: &str) -> bool {
        self.has_blocked_words(&nickname.to_lowercase()) || self.contains_censored_word(nickname)
    }
}

#[derive(Debug, Default, Clone)]
pub struct WordListFilter {
    censored: HashSet<String>,
    blocked: HashSet<String>,
}

impl WordListFilter {
    pub fn new<I, J, S, T>(censored: I, blocked: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            censored: normalize_words(censored),
            blocked: normalize_words(blocked),
        }
    }

    /// Load newline-separated word lists; a missing path means an empty list
    pub fn from_files(censored: Option<&Path>, blocked: Option<&Path>) -> Result<Self> {
        let censored_text = read_list(censored)?;
        let blocked_text = read_list(blocked)?;
        let filter = Self::new(censored_text.lines(), blocked_text.lines());
        info!(
            "Loaded {} censored and {} blocked words",
            filter.censored.len(),
            filter.blocked.len()
        );
        Ok(filter)
    }

    fn is_censored(&self, word: &str) -> bool {
        !word.is_empty() && self.censored.contains(&word.to_lowercase())
    }
}

fn read_list(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => Ok(String::new()),
    }
}

fn normalize_words<I, S>(words: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| w.as_ref().trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn mask_word(word: &str) -> String {
    let count = word.chars().count();
    word.chars()
        .enumerate()
        .map(|(i, c)| if i == 0 || i + 1 >= count { c } else { '*' })
        .collect()
}

impl ProfanityFilter for WordListFilter {
    fn has_blocked_words(&self, text: &str) -> bool {
        text.split(' ')
            .filter(|w| !w.is_empty())
            .any(|w| self.blocked.contains(&w.to_lowercase()))
    }

    fn contains_censored_word(&self, text: &str) -> bool {
        text.split(' ').any(|w| self.is_censored(w))
    }

    fn mask_censored_words(&self, text: &str) -> String {
        text.split(' ')
            .map(|w| {
                if self.is_censored(w) {
                    mask_word(w)
                } else {
                    w.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> WordListFilter {
        WordListFilter::new(["darn", "heck"], ["villain"])
    }

    #[test]
    fn test_masks_interior_of_censored_words() {
        let f = filter();
        assert_eq!(f.mask_censored_words("oh Darn it"), "oh D**n it");
        assert_eq!(f.mask_censored_words("what the  heck"), "what the  h**k");
        assert_eq!(f.mask_censored_words("clean text"), "clean text");
    }

    #[test]
    fn test_blocked_words_are_case_insensitive() {
        let f = filter();
        assert!(f.has_blocked_words("you VILLAIN"));
        assert!(!f.has_blocked_words("villainous plans"));
    }

    #[test]
    fn test_profane_nickname() {
        let f = filter();
        assert!(f.is_profane_nickname("Heck Yeah"));
        assert!(f.is_profane_nickname("villain"));
        assert!(!f.is_profane_nickname("Alice"));
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let f = WordListFilter::default();
        assert!(!f.has_blocked_words("anything"));
        assert_eq!(f.mask_censored_words("anything goes"), "anything goes");
    }

    #[test]
    fn test_from_files_reads_word_lists() {
        let dir = std::env::temp_dir().join(format!("retro-rooms-words-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let censored = dir.join("censored.txt");
        std::fs::write(&censored, "darn\n\n  Heck \n").unwrap();

        let filter = WordListFilter::from_files(Some(censored.as_path()), None).unwrap();
        assert!(filter.contains_censored_word("oh heck"));
        assert!(!filter.has_blocked_words("oh heck"));

        assert!(WordListFilter::from_files(Some(dir.join("missing.txt").as_path()), None).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
