use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, SpanProxyError};

/// Converts a Zipkin timestamp (microseconds since the epoch).
///
/// Absent or zero timestamps resolve to the current time, so every span can
/// be placed on a time axis.
pub fn timestamp_from_micros(micros: Option<i64>) -> DateTime<Utc> {
    match micros {
        Some(us) if us != 0 => Utc.timestamp_micros(us).single().unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

pub fn duration_ms_from_micros(micros: Option<i64>) -> f64 {
    micros.map(|us| us as f64 / 1000.0).unwrap_or(0.0)
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| SpanProxyError::Config(format!("invalid duration {input}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_micros() {
        let ts = timestamp_from_micros(Some(1_506_629_717_288_651));
        assert_eq!(ts.to_rfc3339(), "2017-09-28T20:15:17.288651+00:00");
    }

    #[test]
    fn missing_or_zero_timestamp_is_now() {
        for input in [None, Some(0)] {
            let before = Utc::now();
            let ts = timestamp_from_micros(input);
            let after = Utc::now();
            assert!(ts >= before && ts <= after);
        }
    }

    #[test]
    fn scales_durations() {
        assert_eq!(duration_ms_from_micros(Some(192)), 0.192);
        assert_eq!(duration_ms_from_micros(Some(222)), 0.222);
        assert_eq!(duration_ms_from_micros(Some(9980)), 9.98);
        assert_eq!(duration_ms_from_micros(None), 0.0);
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration_str("3s").unwrap(), Duration::from_secs(3));
        assert!(parse_duration_str("soon").is_err());
    }
}
