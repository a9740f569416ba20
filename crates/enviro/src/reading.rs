//! The `Reading` value record and the timestamp formats it is stored in.

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Text layout of the `timestamp` column in the local SQLite table.
const STORED_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6][offset_hour sign:mandatory]:[offset_minute]"
);

/// Same layout without the fractional part (rows written at a whole second).
const STORED_FORMAT_WHOLE: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
);

/// Offset-less layouts, interpreted as UTC.
const STORED_FORMAT_NAIVE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
const STORED_FORMAT_NAIVE_WHOLE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// One snapshot of every sensor channel.
///
/// Built fresh each tick and never mutated afterwards.  Numeric fields are
/// already compensated, scaled and rounded to one decimal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub oxidised: f64,
    pub reduced: f64,
    pub nh3: f64,
    pub lux: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm25: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm10: Option<f64>,
}

/// Round to one decimal digit, half away from zero.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Correct the board temperature for heat soaked up from the Pi's CPU.
pub fn compensate_temperature(raw: f64, cpu: f64, factor: f64) -> f64 {
    raw - (cpu - raw) / factor
}

/// Current UTC time truncated to microseconds, the precision both stores
/// keep.
pub fn now_timestamp() -> OffsetDateTime {
    truncate_micros(OffsetDateTime::now_utc())
}

pub fn truncate_micros(ts: OffsetDateTime) -> OffsetDateTime {
    ts.replace_microsecond(ts.microsecond()).unwrap_or(ts)
}

/// Format a timestamp the way the local table stores it, always in UTC.
pub fn format_stored(ts: OffsetDateTime) -> Result<String, time::error::Format> {
    ts.to_offset(UtcOffset::UTC).format(STORED_FORMAT)
}

/// Parse a stored timestamp.  Accepts the local table layout (with or
/// without fraction, with or without offset) and RFC 3339.
pub fn parse_stored(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    OffsetDateTime::parse(s, STORED_FORMAT)
        .or_else(|_| OffsetDateTime::parse(s, STORED_FORMAT_WHOLE))
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339))
        .ok()
        .or_else(|| {
            PrimitiveDateTime::parse(s, STORED_FORMAT_NAIVE)
                .or_else(|_| PrimitiveDateTime::parse(s, STORED_FORMAT_NAIVE_WHOLE))
                .ok()
                .map(PrimitiveDateTime::assume_utc)
        })
}

#[cfg(test)]
pub(crate) fn sample_reading() -> Reading {
    use time::macros::datetime;

    Reading {
        timestamp: datetime!(2024-01-01 00:00:10.25 UTC),
        temperature: 21.4,
        pressure: 1013.2,
        humidity: 45.1,
        oxidised: 12.3,
        reduced: 210.5,
        nh3: 88.8,
        lux: 120.0,
        pm1: None,
        pm25: None,
        pm10: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn round1_rounds_to_one_decimal() {
        assert_eq!(round1(21.449), 21.4);
        assert_eq!(round1(21.45), 21.5);
        assert_eq!(round1(-3.26), -3.3);
        assert_eq!(round1(0.0), 0.0);
    }

    #[test]
    fn compensation_pulls_temperature_away_from_cpu() {
        // raw 25, cpu 48, factor 2.3 -> 25 - 23/2.3 = 15
        let t = compensate_temperature(25.0, 48.0, 2.3);
        assert!((t - 15.0).abs() < 1e-9, "got {t}");
    }

    #[test]
    fn compensation_is_identity_when_cpu_matches() {
        assert_eq!(compensate_temperature(30.0, 30.0, 3.2), 30.0);
    }

    #[test]
    fn truncate_micros_drops_nanoseconds() {
        let ts = datetime!(2024-01-01 00:00:00.123456789 UTC);
        assert_eq!(truncate_micros(ts).nanosecond(), 123_456_000);
    }

    #[test]
    fn stored_format_is_utc_with_micros() {
        let ts = datetime!(2024-01-01 01:00:10.5 +01:00);
        assert_eq!(
            format_stored(ts).unwrap(),
            "2024-01-01 00:00:10.500000+00:00"
        );
    }

    #[test]
    fn parse_stored_accepts_known_layouts() {
        let expected = datetime!(2024-01-01 00:00:10 +01:00);
        for s in [
            "2024-01-01 00:00:10+01:00",
            "2024-01-01 00:00:10.000000+01:00",
            "2024-01-01T00:00:10+01:00",
            "2023-12-31 23:00:10",
        ] {
            assert_eq!(parse_stored(s), Some(expected), "layout {s:?}");
        }
    }

    #[test]
    fn parse_stored_rejects_garbage() {
        assert_eq!(parse_stored("yesterday"), None);
        assert_eq!(parse_stored(""), None);
    }

    #[test]
    fn format_then_parse_preserves_instant() {
        let ts = now_timestamp();
        assert_eq!(parse_stored(&format_stored(ts).unwrap()), Some(ts));
    }

    #[test]
    fn json_payload_uses_reading_field_names() {
        let json = serde_json::to_value(sample_reading()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 8, "pm fields must be omitted when absent");
        assert_eq!(json["temperature"], 21.4);
        assert_eq!(json["nh3"], 88.8);
        assert_eq!(json["timestamp"], "2024-01-01T00:00:10.25Z");
    }

    #[test]
    fn json_payload_includes_particulates_when_present() {
        let mut r = sample_reading();
        r.pm1 = Some(3.0);
        r.pm25 = Some(5.0);
        r.pm10 = Some(7.0);
        let json = serde_json::to_value(r).unwrap();
        assert_eq!(json["pm25"], 5.0);
        assert_eq!(json.as_object().unwrap().len(), 11);
    }
}
