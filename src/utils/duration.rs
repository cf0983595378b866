//! Compose-style duration strings ("500ms", "5s", "1m30s", "2h").

use std::time::Duration;

use crate::error::{Result, StackError};

/// Parse a duration like `"1h"`, `"30m"`, `"1m30s"`, `"250ms"` or a bare number
/// of seconds.
///
/// Components are summed, so `"1m30s"` is ninety seconds. Units must appear
/// at most once each but order is not enforced.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let input = s.trim().to_lowercase();
    if input.is_empty() {
        return Err(StackError::Config("empty duration".to_string()));
    }

    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input.as_str();
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| invalid(s))?;
        if digits == 0 {
            return Err(invalid(s));
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid(s))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let millis = match unit {
            "ms" => value,
            "s" => value * 1_000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            _ => return Err(invalid(s)),
        };
        total += Duration::from_millis(millis.round() as u64);
    }
    Ok(total)
}

/// Render a duration back in the shortest compose-style form.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "0s".to_string()
    } else if ms % 3_600_000 == 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

fn invalid(s: &str) -> StackError {
    StackError::Config(format!(
        "invalid duration '{}'; use formats like 500ms, 5s, 1m30s or 2h",
        s
    ))
}
