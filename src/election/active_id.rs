use crate::models::ACTIVE_ID_LENGTH;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;

lazy_static! {
    static ref ACTIVE_ID_PATTERN: Regex =
        Regex::new(&format!("^[a-z]{{{}}}$", ACTIVE_ID_LENGTH)).expect("active id pattern is valid");
}

/// A random code of lowercase letters, short enough to read out loud.
pub fn generate_active_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ACTIVE_ID_LENGTH)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

/// Canonical form of a user-typed code, or `None` if it cannot be one.
pub fn normalize_active_id(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_lowercase();
    ACTIVE_ID_PATTERN.is_match(&code).then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_valid() {
        for _ in 0..100 {
            let code = generate_active_id();
            assert_eq!(normalize_active_id(&code), Some(code));
        }
    }

    #[test]
    fn normalizes_typed_codes() {
        assert_eq!(normalize_active_id("  QwErTy "), Some("qwerty".to_string()));
        assert_eq!(normalize_active_id("qwert"), None);
        assert_eq!(normalize_active_id("qwer7y"), None);
        assert_eq!(normalize_active_id(""), None);
    }
}
