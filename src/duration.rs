//! Human-readable duration parsing for the scan timing options.

use std::time::Duration;

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// The number may be fractional (`1.5`, `0.5m`).
///
/// # Examples
/// ```
/// use bthome_gateway::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit) = if let Some(num) = src.strip_suffix("ms") {
        (num, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, "seconds")
    } else {
        (src, "duration")
    };

    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {num}"))?;
    let secs = match unit {
        "milliseconds" => value / 1000.0,
        "hours" => value * 3600.0,
        "minutes" => value * 60.0,
        _ => value,
    };
    Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid {unit}: {num}"))
}

/// Parse the scan time. Zero or a negative number means scanning without
/// pauses and is returned as [`Duration::ZERO`].
pub fn parse_scan_time(src: &str) -> Result<Duration, String> {
    if src.trim().starts_with('-') {
        // Any well-formed negative value disables pauses.
        parse_duration(src.trim().trim_start_matches('-'))?;
        return Ok(Duration::ZERO);
    }
    parse_duration(src)
}

/// Parse a duration that must be strictly positive.
pub fn parse_positive_duration(src: &str) -> Result<Duration, String> {
    let duration = parse_duration(src)?;
    if duration.is_zero() {
        return Err(format!("duration must be greater than zero: {}", src.trim()));
    }
    Ok(duration)
}
