use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Seconds per unit, in the fixed `w d h m s` component order RouterOS uses
/// for timeouts like `28w4d23h59m56s`.
const UNITS: [(char, u64); 5] = [
    ('w', 7 * 24 * 3600),
    ('d', 24 * 3600),
    ('h', 3600),
    ('m', 60),
    ('s', 1),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("invalid duration `{0}`")]
    Invalid(String),
}

/// Parses a RouterOS-style duration. Every component is optional, but at
/// least one must be present, components must appear in `w d h m s` order,
/// and the whole string must be consumed. `"10"` and `"10x"` are errors.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let bytes = s.as_bytes();
    let mut secs: u64 = 0;
    let mut next_unit = 0;
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let value: u64 = s[start..i]
            .parse()
            .map_err(|_| DurationError::Invalid(s.to_string()))?;
        let suffix = match bytes.get(i) {
            Some(&b) => b as char,
            None => return Err(DurationError::Invalid(s.to_string())),
        };
        i += 1;
        // A suffix may only be one of the units not yet consumed; this both
        // rejects unknown letters and enforces the fixed component order.
        let pos = UNITS[next_unit..]
            .iter()
            .position(|(c, _)| *c == suffix)
            .ok_or_else(|| DurationError::Invalid(s.to_string()))?;
        let (_, unit_secs) = UNITS[next_unit + pos];
        next_unit += pos + 1;
        secs = secs.saturating_add(value.saturating_mul(unit_secs));
    }
    if next_unit == 0 {
        return Err(DurationError::Invalid(s.to_string()));
    }
    Ok(Duration::from_secs(secs))
}

/// Formats a duration in the same grammar, skipping zero components.
/// The zero duration formats as `0s`.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    let mut out = String::new();
    for &(suffix, unit_secs) in UNITS.iter().take(4) {
        let n = secs / unit_secs;
        if n > 0 {
            out.push_str(&n.to_string());
            out.push(suffix);
            secs %= unit_secs;
        }
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&secs.to_string());
        out.push('s');
    }
    out
}

/// A `std::time::Duration` that reads and writes the RouterOS grammar, for
/// config fields and CLI flags like `blocktime = "24h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RosDuration(pub Duration);

impl FromStr for RosDuration {
    type Err = DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(RosDuration)
    }
}

impl fmt::Display for RosDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_duration(self.0))
    }
}

impl From<RosDuration> for Duration {
    fn from(value: RosDuration) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for RosDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for RosDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
