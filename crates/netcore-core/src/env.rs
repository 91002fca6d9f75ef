//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `ManagerSetting::from_env` and
//! `PoolConfig::from_env`.
//!
//! ```ignore
//! use netcore_core::env::{env_get, env_get_bool, env_key};
//!
//! let workers: usize = env_get("NETCORE_POOL_WORKERS", 4);
//! let key = env_key("echo", "MAX_COUNT");   // "NETCORE_ECHO_MAX_COUNT"
//! let flush = env_get_bool("NETCORE_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every variable the workspace reads.
pub const ENV_PREFIX: &str = "NETCORE";

/// Parsed value, or `default` when unset or unparsable. Surrounding
/// whitespace is ignored.
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean flag. `1/true/yes/on` and `0/false/no/off` (any case) are
/// recognized; unset or anything else keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    env_get_opt::<String>(key)
        .and_then(|v| parse_flag(&v))
        .unwrap_or(default)
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `Some(T)` if set and parsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

/// Milliseconds variable as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Build `NETCORE_<SCOPE>_<FIELD>`, upper-casing the scope and mapping
/// anything outside `[A-Z0-9]` to `_`.
pub fn env_key(scope: &str, field: &str) -> String {
    let scope: String = scope
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_{}", ENV_PREFIX, scope, field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__NETCORE_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__NETCORE_TEST_UNSET__", true));
        assert_eq!(env_get_str("__NETCORE_TEST_UNSET__", "hi"), "hi");
        assert!(env_get_opt::<u32>("__NETCORE_TEST_UNSET__").is_none());
        assert!(!env_is_set("__NETCORE_TEST_UNSET__"));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__NETCORE_TEST_NUM__", " 123 ");
        let val: usize = env_get("__NETCORE_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__NETCORE_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__NETCORE_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__NETCORE_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__NETCORE_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (text, want) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("No", false)] {
            std::env::set_var("__NETCORE_TEST_BOOL__", text);
            assert_eq!(env_get_bool("__NETCORE_TEST_BOOL__", !want), want, "{}", text);
        }
        std::env::set_var("__NETCORE_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__NETCORE_TEST_BOOL__", true));
        assert!(!env_get_bool("__NETCORE_TEST_BOOL__", false));
        std::env::remove_var("__NETCORE_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__NETCORE_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__NETCORE_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__NETCORE_TEST_MS__");
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("echo", "MAX_COUNT"), "NETCORE_ECHO_MAX_COUNT");
        assert_eq!(env_key("game-gw.1", "MODE"), "NETCORE_GAME_GW_1_MODE");
    }
}
