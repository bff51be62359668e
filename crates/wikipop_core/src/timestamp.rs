use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Storage format of `pop_timestamp` values: `YYYYMMDDHHMMSS`.
pub const CACHE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const CACHE_TIMESTAMP_LEN: usize = 14;

pub fn format_cache_timestamp(value: &NaiveDateTime) -> String {
    value.format(CACHE_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_cache_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    if trimmed.len() != CACHE_TIMESTAMP_LEN || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        bail!("invalid cache timestamp `{value}` (expected YYYYMMDDHHMMSS)");
    }
    NaiveDateTime::parse_from_str(trimmed, CACHE_TIMESTAMP_FORMAT)
        .with_context(|| format!("invalid cache timestamp `{value}`"))
}

/// Accepts the cache format as well as the ISO-8601 shapes the statistics
/// service has been seen to emit (`2026-10-19T02:00:00Z`, `2026-10-19 02:00:00`).
pub fn parse_source_timestamp(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    if let Ok(parsed) = parse_cache_timestamp(trimmed) {
        return Ok(parsed);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    bail!("unrecognized measurement timestamp `{value}`")
}

pub fn calendar_day(value: &NaiveDateTime) -> NaiveDate {
    value.date()
}

pub fn same_calendar_day(left: &NaiveDateTime, right: &NaiveDateTime) -> bool {
    calendar_day(left) == calendar_day(right)
}

pub fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc()
}
