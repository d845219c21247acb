//! Runtime flags read from the process environment.
//!
//! These are read on every call rather than cached so that an operator can
//! flip `BYPASS_CACHE` without restarting the proxy.

/// `true` when `BYPASS_CACHE=true` (case-insensitive) is set.
pub fn bypass_cache() -> bool {
    equals_ignore_case(std::env::var("BYPASS_CACHE").ok(), "true")
}

/// `true` when `APP_ENV=production` (case-insensitive) is set.
pub fn production() -> bool {
    equals_ignore_case(std::env::var("APP_ENV").ok(), "production")
}

fn equals_ignore_case(value: Option<String>, expected: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_matching_is_case_insensitive() {
        assert!(equals_ignore_case(Some("TRUE".into()), "true"));
        assert!(equals_ignore_case(Some("Production".into()), "production"));
    }

    #[test]
    fn unset_or_other_values_are_false() {
        assert!(!equals_ignore_case(None, "true"));
        assert!(!equals_ignore_case(Some("1".into()), "true"));
        assert!(!equals_ignore_case(Some(String::new()), "true"));
    }
}
