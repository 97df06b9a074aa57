//! A human-readable bandwidth/latency-adjacent quantity with a parse/format
//! round-trip, ported from the Go `speedtest.Unit` this service's predecessor
//! used (`Value float64`, `Uint string`, binary-prefixed `String()`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::UnitError;

const KI: f64 = 1024.0;
const MI: f64 = 1024.0 * 1024.0;
const GI: f64 = 1024.0 * 1024.0 * 1024.0;

/// A value tagged with a unit suffix (`"bps"`, `"bytes"`, ...), formatted
/// with the largest binary prefix for which the scaled value is `< 1024`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "UnitShadow")]
pub struct Unit {
    pub value: f64,
    pub unit: &'static str,
}

impl Unit {
    pub fn new(value: f64, unit: &'static str) -> Self {
        Self { value, unit }
    }

    pub fn bps(value: f64) -> Self {
        Self::new(value, "bps")
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0.0
    }

    /// Parses `"<float><K|M|G|>"<unit>"` into a [`Unit`]. `unit` must match
    /// the trailing suffix exactly (case-sensitive); this is stricter than
    /// the Go original, which silently no-ops a non-matching `TrimSuffix`.
    /// Here that mismatch is promoted to a proper `parse_mismatch` error.
    pub fn parse(s: &str, unit: &'static str) -> Result<Self, UnitError> {
        let without_unit = s
            .strip_suffix(unit)
            .ok_or_else(|| UnitError::Mismatch(s.to_string(), unit.to_string()))?;
        if without_unit.is_empty() {
            return Err(UnitError::Malformed(s.to_string()));
        }
        let last = without_unit
            .chars()
            .next_back()
            .expect("checked non-empty above");
        let (magnitude, factor) = match last {
            'K' => (&without_unit[..without_unit.len() - 1], KI),
            'M' => (&without_unit[..without_unit.len() - 1], MI),
            'G' => (&without_unit[..without_unit.len() - 1], GI),
            _ => (without_unit, 1.0),
        };
        let n: f64 = magnitude
            .parse()
            .map_err(|_| UnitError::Malformed(s.to_string()))?;
        Ok(Self::new(n * factor, unit))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            v if v < KI => write!(f, "{:.2}{}", v, self.unit),
            v if v < MI => write!(f, "{:.2}K{}", v / KI, self.unit),
            v if v < GI => write!(f, "{:.2}M{}", v / MI, self.unit),
            v => write!(f, "{:.2}G{}", v / GI, self.unit),
        }
    }
}

impl From<Unit> for String {
    fn from(u: Unit) -> Self {
        u.to_string()
    }
}

/// Deserialization helper: a `Unit` on the wire is just its formatted
/// string, but decoding it back requires knowing the expected unit suffix,
/// which isn't carried in the string itself for generic fields. Relay-map
/// JSON never round-trips a `Unit` back into this service, so this shadow
/// only needs to support the `bps` suffix used throughout the registry.
#[derive(Deserialize)]
#[serde(transparent)]
struct UnitShadow(String);

impl TryFrom<UnitShadow> for Unit {
    type Error = UnitError;

    fn try_from(shadow: UnitShadow) -> Result<Self, Self::Error> {
        Unit::parse(&shadow.0, "bps")
    }
}
