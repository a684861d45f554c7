//! Time normalization — every timestamp entering or leaving Chime passes through here.
//!
//! Rule: inputs without a zone offset are UTC (never the local clock); inputs
//! with an offset are converted to UTC. Everything is truncated to millisecond
//! precision so the canonical string form round-trips exactly.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};

use crate::error::{ChimeError, Result};

/// Absolute, UTC-normalized point in time.
pub type Instant = DateTime<Utc>;

/// Zone-aware encodings (tried after the `Z` suffix has been rewritten to `+00:00`).
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M%z",
];

/// Naive encodings, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse any recognizable ISO-8601-ish encoding into a UTC instant.
pub fn normalize(raw: &str) -> Result<Instant> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ChimeError::MalformedTimestamp(raw.to_string()));
    }

    let rewritten = match trimmed.strip_suffix('Z').or_else(|| trimmed.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => trimmed.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&rewritten) {
        return Ok(dt.with_timezone(&Utc).trunc_subsecs(3));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&rewritten, fmt) {
            return Ok(dt.with_timezone(&Utc).trunc_subsecs(3));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&rewritten, fmt) {
            return Ok(naive.and_utc().trunc_subsecs(3));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(&rewritten, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(ChimeError::MalformedTimestamp(raw.to_string()))
}

/// Like [`normalize`], but absent or blank input means "no timestamp".
pub fn normalize_optional(raw: Option<&str>) -> Result<Option<Instant>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => normalize(s).map(Some),
    }
}

/// Canonical wire/storage form: `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_instant(instant: &Instant) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time, already at canonical precision.
pub fn now() -> Instant {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_naive_and_explicit_utc_are_equal() {
        let naive = normalize("2025-01-01T10:00:00").unwrap();
        let zulu = normalize("2025-01-01T10:00:00Z").unwrap();
        let offset = normalize("2025-01-01T10:00:00+00:00").unwrap();
        assert_eq!(naive, zulu);
        assert_eq!(zulu, offset);
        assert_eq!(naive, Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_offset_converted_to_utc() {
        let dt = normalize("2025-01-01T12:30:00+02:30").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());

        let compact = normalize("2025-01-01T05:00:00-0500").unwrap();
        assert_eq!(compact, Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "2025-01-01T10:00:00Z",
            "2025-01-01T10:00:00.123456Z",
            "2025-01-01 10:00:00",
            "2025-01-01T10:00",
            "2025-01-01T11:00:00.5+01:00",
            "2025-01-01",
        ];
        for raw in inputs {
            let once = normalize(raw).unwrap();
            let twice = normalize(&format_instant(&once)).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn test_millisecond_truncation() {
        let dt = normalize("2025-01-01T10:00:00.123999Z").unwrap();
        assert_eq!(format_instant(&dt), "2025-01-01T10:00:00.123Z");
    }

    #[test]
    fn test_format_has_z_suffix_and_millis() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(format_instant(&dt), "2025-03-09T07:05:00.000Z");
    }

    #[test]
    fn test_date_only_is_midnight_utc() {
        let dt = normalize("2025-06-15").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_malformed_rejected() {
        for raw in ["", "   ", "next tuesday", "2025-13-01T00:00:00", "2025-01-01T25:00:00Z"] {
            match normalize(raw) {
                Err(ChimeError::MalformedTimestamp(echo)) => assert_eq!(echo, raw),
                other => panic!("expected MalformedTimestamp for {raw:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_normalize_optional() {
        assert_eq!(normalize_optional(None).unwrap(), None);
        assert_eq!(normalize_optional(Some("")).unwrap(), None);
        assert!(normalize_optional(Some("2025-01-01T10:00:00Z")).unwrap().is_some());
        assert!(normalize_optional(Some("garbage")).is_err());
    }
}
