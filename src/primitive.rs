use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::literal::{Primitive, SimpleType};

/// Parse the textual content of a primitive output file
///
/// Strings are taken verbatim, every other type is trimmed first so a trailing
/// newline written by the task does not matter.
pub fn parse_primitive(ty: SimpleType, raw: &str) -> Result<Primitive, String> {
    let value = raw.trim();

    match ty {
        SimpleType::String => Ok(Primitive::String(raw.to_string())),
        _ if value.is_empty() => Err(format!("empty value for {} output", ty)),
        SimpleType::Integer => value
            .parse::<i64>()
            .map(Primitive::Integer)
            .map_err(|e| format!("'{}' is not an integer: {}", value, e)),
        SimpleType::Float => value
            .parse::<f64>()
            .map(Primitive::Float)
            .map_err(|e| format!("'{}' is not a float: {}", value, e)),
        SimpleType::Boolean => parse_bool(value).map(Primitive::Boolean),
        SimpleType::Datetime => DateTime::parse_from_rfc3339(value)
            .map(|dt| Primitive::Datetime(dt.with_timezone(&Utc)))
            .map_err(|e| format!("'{}' is not an RFC 3339 datetime: {}", value, e)),
        SimpleType::Duration => parse_duration(value).map(Primitive::Duration),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", value)),
    }
}

/// Parse durations such as "90s", "1h30m" or "250ms"
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let mut total = Duration::ZERO;
    let mut rest = value;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("'{}' is missing a unit (h, m, s, ms, us, ns)", value))?;
        if digits == 0 {
            return Err(format!("'{}' is not a duration", value));
        }

        let amount: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("'{}' is not a duration", value))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            unit => return Err(format!("unknown duration unit '{}' in '{}'", unit, value)),
        };
        rest = &rest[unit_len..];

        let part = Duration::try_from_secs_f64(amount * seconds_per_unit)
            .map_err(|_| format!("'{}' is out of range for a duration", value))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| format!("'{}' is out of range for a duration", value))?;
    }

    Ok(total)
}
