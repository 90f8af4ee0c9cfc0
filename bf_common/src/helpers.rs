use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseValueError {
    #[error("'{0}' is not a valid number")]
    NotANumber(String),
    #[error("'{0}' must be greater than zero")]
    NotPositive(String),
}

/// Parse a boolean flag from a string value, or return the given default value otherwise.
pub fn parse_boolean_flag(value: Option<String>, default: bool) -> bool {
    let value = match value {
        Some(v) => v,
        None => return default,
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Parse a strictly positive integer, e.g. an attempt count.
pub fn parse_positive(value: &str) -> Result<u32, ParseValueError> {
    let n = value.trim().parse::<u32>().map_err(|_| ParseValueError::NotANumber(value.to_string()))?;
    if n == 0 {
        return Err(ParseValueError::NotPositive(value.to_string()));
    }
    Ok(n)
}

/// Parse a number of milliseconds into a [`Duration`]. Zero is rejected.
pub fn parse_millis(value: &str) -> Result<Duration, ParseValueError> {
    let ms = value.trim().parse::<u64>().map_err(|_| ParseValueError::NotANumber(value.to_string()))?;
    if ms == 0 {
        return Err(ParseValueError::NotPositive(value.to_string()));
    }
    Ok(Duration::from_millis(ms))
}
