//! Shared utility functions used across the codebase.

use std::collections::VecDeque;
use std::str::FromStr;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Parse an environment variable into `T`, returning `Ok(None)` if unset.
///
/// The error carries the raw parse failure so config loading can report
/// which variable was malformed.
pub fn env_var_parse<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| e.to_string()),
        _ => Ok(None),
    }
}

/// Append to a ring buffer, evicting the oldest entries beyond `capacity`.
pub fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}
