use crate::{Error, Result};

use std::time::Duration;

pub(crate) fn canonicalize_unit_name(input: &str) -> Result<String> {
    validate_no_control("unit", input)?;
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::invalid_input("unit must not be empty"));
    }
    if input.contains('/') || input.contains('\\') {
        return Err(Error::invalid_input(
            "unit must not contain path separators",
        ));
    }
    if input.contains("..") {
        return Err(Error::invalid_input("unit must not contain '..'"));
    }

    if input.contains('.') {
        return Ok(input.to_string());
    }
    Ok(format!("{input}.service"))
}

/// Like `canonicalize_unit_name`, but glob patterns are kept verbatim.
pub(crate) fn canonicalize_unit_pattern(input: &str) -> Result<String> {
    validate_no_control("unit pattern", input)?;
    let trimmed = input.trim();
    if is_glob(trimmed) {
        if trimmed.contains('/') {
            return Err(Error::invalid_input(
                "unit pattern must not contain path separators",
            ));
        }
        return Ok(trimmed.to_string());
    }
    canonicalize_unit_name(trimmed)
}

pub(crate) fn is_glob(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

pub(crate) fn validate_no_control(context: &'static str, input: &str) -> Result<()> {
    if input.contains('\0') {
        return Err(Error::invalid_input(format!(
            "{context} must not contain NUL"
        )));
    }
    if input.contains('\n') || input.contains('\r') {
        return Err(Error::invalid_input(format!(
            "{context} must not contain newlines"
        )));
    }
    if input.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_input(format!(
            "{context} must not contain control characters"
        )));
    }
    Ok(())
}

/// Parse a Go-style duration string such as `250ms`, `10s` or `1m30s`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::invalid_input("duration must not be empty"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let bad = || Error::invalid_input(format!("invalid duration {input:?}"));

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(bad)?;
        if digits == 0 {
            return Err(bad());
        }
        let number = &rest[..digits];
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            _ => return Err(bad()),
        };
        rest = &rest[unit_len..];

        let nanos = if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| bad())?;
            let nanos = (value * nanos_per_unit as f64).round();
            if !nanos.is_finite() || nanos > u64::MAX as f64 {
                return Err(bad());
            }
            nanos as u64
        } else {
            let value: u64 = number.parse().map_err(|_| bad())?;
            value.checked_mul(nanos_per_unit).ok_or_else(bad)?
        };
        total = total
            .checked_add(Duration::from_nanos(nanos))
            .ok_or_else(bad)?;
    }
    Ok(total)
}

pub(crate) fn push_limited(buf: &mut Vec<u8>, bytes: &[u8], max_bytes: usize) {
    if buf.len() >= max_bytes {
        return;
    }
    let room = max_bytes - buf.len();
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}
