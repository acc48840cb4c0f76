//! Environment variable helpers for configuration overrides

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything
/// else set is false, unset gives `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
