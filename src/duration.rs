use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

/// Parse durations like "200ms", "30s", "2m" or "1.5h".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let nanos_per_unit = match unit.trim() {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        "" => bail!("Duration '{}' has no unit", s),
        other => bail!("Unknown duration unit '{}' in '{}'", other, s),
    };
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid duration '{}'", s))?;
    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

/// Serde helper for config fields: accepts "30s"-style strings or a plain
/// number of seconds.
pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => match text.trim().parse::<u64>() {
            Ok(secs) => Ok(Duration::from_secs(secs)),
            Err(_) => parse_duration(&text).map_err(serde::de::Error::custom),
        },
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}
