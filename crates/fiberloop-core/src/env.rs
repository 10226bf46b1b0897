//! `FL_*` environment lookups used by `RuntimeConfig::from_env`
//!
//! A variable that is unset or does not parse falls back to the default
//! supplied by the caller.

use std::str::FromStr;

/// Value of `key` parsed as `T`, or `default`
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Switch-style variable: `1/true/yes/on` or `0/false/no/off`, any case.
/// Anything else keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
