//! Resource naming rules shared by modules, pipelines and clusters

use regex::Regex;
use std::sync::OnceLock;

/// Lowercase letters, digits and hyphens
pub const NAME_PATTERN: &str = r"^[a-z0-9-]+$";

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern is a valid regex"))
}

pub fn is_valid_name(name: &str) -> bool {
    name_regex().is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("echo"));
        assert!(is_valid_name("text-chunker-2"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Echo"));
        assert!(!is_valid_name("my pipeline"));
        assert!(!is_valid_name("a_b"));
        assert!(!is_valid_name("a/b"));
    }
}
