//! Identifier rules shared by features, settings, aliases, and metadata keys.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier regex"))
}

/// Whether `name` is a legal context-feature, setting, or alias name.
pub fn is_valid_name(name: &str) -> bool {
    identifier_re().is_match(name)
}

/// Whether `key` is a legal metadata key.
pub fn is_valid_metadata_key(key: &str) -> bool {
    identifier_re().is_match(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_word_characters_and_dashes() {
        for name in ["user", "Account_2", "a", "dark-mode", "0"] {
            assert!(is_valid_name(name), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_empty_and_punctuated_names() {
        for name in ["", " ", "a b", "a.b", "a:b", "a,b", "ünïcode", "a*"] {
            assert!(!is_valid_name(name), "accepted {name:?}");
        }
    }
}
