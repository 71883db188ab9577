//! Human-readable durations for configuration values like "10m", "5h", "1h30m".

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

const SECS_PER_DAY: u64 = 24 * 60 * 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_MINUTE: u64 = 60;

/// Parse a duration string made of one or more `<number><unit>` groups.
///
/// Supported units are `d`, `h`, `m`, `s` and `ms`. Groups may be combined
/// (`"1h30m"`, `"2m15s"`). Input is case-insensitive and whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use tokenwarden::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
/// assert_eq!(parse_duration("5h").unwrap(), Duration::from_secs(5 * 3600));
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        anyhow::bail!("Duration is empty");
    }

    let mut total = Duration::ZERO;
    let mut rest = s.as_str();

    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            anyhow::bail!("Expected a number in duration '{s}'");
        }
        let num: u64 = rest[..digits]
            .parse()
            .with_context(|| format!("Invalid number in duration '{s}'"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(
                num.checked_mul(SECS_PER_MINUTE)
                    .context("Duration is too large")?,
            ),
            "h" => Duration::from_secs(num.checked_mul(SECS_PER_HOUR).context("Duration is too large")?),
            "d" => Duration::from_secs(num.checked_mul(SECS_PER_DAY).context("Duration is too large")?),
            "" => anyhow::bail!("Duration '{s}' is missing a unit (d, h, m, s, ms)"),
            other => anyhow::bail!("Unknown duration unit '{other}' in '{s}'"),
        };

        total = total.checked_add(part).context("Duration is too large")?;
    }

    Ok(total)
}

/// Format a duration using the two largest non-zero units, e.g. `"4h12m"`.
///
/// Sub-second remainders are dropped; a duration under one second renders in
/// milliseconds.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.subsec_millis());
    }

    let parts = [
        (secs / SECS_PER_DAY, "d"),
        ((secs % SECS_PER_DAY) / SECS_PER_HOUR, "h"),
        ((secs % SECS_PER_HOUR) / SECS_PER_MINUTE, "m"),
        (secs % SECS_PER_MINUTE, "s"),
    ];

    parts
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect()
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Serde serializer producing strings `deserialize_duration` reads back.
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if d.subsec_millis() != 0 {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    } else {
        serializer.serialize_str(&format!("{}s", d.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("5h").unwrap(), Duration::from_secs(5 * 3600));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parses_compound_and_case_insensitive() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 2M15S ").unwrap(), Duration::from_secs(135));
        assert_eq!(
            parse_duration("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("-5m").is_err());
        assert!(parse_duration("99999999999999999999d").is_err());
    }

    #[test]
    fn formats_two_largest_units() {
        assert_eq!(format_duration(Duration::from_secs(4 * 3600 + 12 * 60 + 9)), "4h12m");
        assert_eq!(format_duration(Duration::from_secs(86400 + 60)), "1d");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
    }

    #[test]
    fn serialized_form_parses_back() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(
                serialize_with = "serialize_duration",
                deserialize_with = "deserialize_duration"
            )]
            d: Duration,
        }

        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_millis(1250),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":"1250ms"}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.d, Duration::from_millis(1250));
    }
}
