//! Go-compatible duration text format.
//!
//! Retry topic names carry their delay as text (`tech-letter.post.events.retry.1m0s`),
//! and the retry worker reads the delay back out of the name. The text form is the
//! one produced by Go's `time.Duration.String()`, so topic names stay identical to
//! the ones already provisioned on the broker.

use std::time::Duration;

use thiserror::Error;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Errors produced while parsing a duration string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration: {0:?}")]
    Invalid(String),

    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },

    #[error("duration out of range: {0:?}")]
    Overflow(String),
}

/// Render a duration the way Go's `time.Duration.String()` does.
///
/// Examples: `10s`, `1m0s`, `1h0m0s`, `1.5s`, `500ms`, `0s`.
pub fn format_go_duration(duration: Duration) -> String {
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < NANOS_PER_SEC {
        let (unit, precision) = if nanos < NANOS_PER_MICRO {
            ("ns", 0)
        } else if nanos < NANOS_PER_MILLI {
            ("µs", 3)
        } else {
            ("ms", 6)
        };
        let (whole, fraction) = split_fraction(nanos, precision);
        return format!("{whole}{fraction}{unit}");
    }

    let (seconds, fraction) = split_fraction(nanos, 9);
    let minutes = seconds / 60;
    let hours = minutes / 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes % 60));
    }
    out.push_str(&format!("{}{}s", seconds % 60, fraction));
    out
}

/// Split `value` into its integer part and a `.ddd` fraction of `precision`
/// decimal digits with trailing zeros removed (empty when the fraction is zero).
fn split_fraction(value: u64, precision: u32) -> (u64, String) {
    if precision == 0 {
        return (value, String::new());
    }

    let scale = 10u64.pow(precision);
    let whole = value / scale;
    let remainder = value % scale;
    if remainder == 0 {
        return (whole, String::new());
    }

    let digits = format!("{:0width$}", remainder, width = precision as usize);
    (whole, format!(".{}", digits.trim_end_matches('0')))
}

/// Parse a Go duration string such as `1m0s`, `1h30m`, `1.5s` or `250ms`.
///
/// Negative durations are rejected: a retry delay can never be negative.
pub fn parse_go_duration(input: &str) -> Result<Duration, DurationParseError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || DurationParseError::Invalid(input.to_string());
    let overflow = || DurationParseError::Overflow(input.to_string());

    let mut rest = text.strip_prefix('+').unwrap_or(text);
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;

    while !rest.is_empty() {
        // Integer part
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let int_digits = &rest[..int_len];
        rest = &rest[int_len..];

        // Optional fraction
        let mut frac_digits = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_dot.len());
            frac_digits = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }

        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(invalid());
        }

        // Unit
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        if unit.is_empty() {
            return Err(invalid());
        }

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => NANOS_PER_MICRO as u128,
            "ms" => NANOS_PER_MILLI as u128,
            "s" => NANOS_PER_SEC as u128,
            "m" => 60 * NANOS_PER_SEC as u128,
            "h" => 3_600 * NANOS_PER_SEC as u128,
            other => {
                return Err(DurationParseError::UnknownUnit {
                    unit: other.to_string(),
                    input: input.to_string(),
                })
            }
        };

        let whole: u128 = if int_digits.is_empty() {
            0
        } else {
            int_digits.parse().map_err(|_| overflow())?
        };
        total = whole
            .checked_mul(unit_nanos)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(overflow)?;

        if !frac_digits.is_empty() {
            // Digits beyond nanosecond resolution cannot contribute.
            let kept = &frac_digits[..frac_digits.len().min(18)];
            let numerator: u128 = kept.parse().map_err(|_| overflow())?;
            let denominator = 10u128.pow(kept.len() as u32);
            total = total
                .checked_add(numerator * unit_nanos / denominator)
                .ok_or_else(overflow)?;
        }
    }

    let nanos = u64::try_from(total).map_err(|_| overflow())?;
    Ok(Duration::from_nanos(nanos))
}
