use anyhow::Result;
use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use tracing::{debug, warn};

use crate::store::CacheStore;
use crate::timestamp::{parse_cache_timestamp, same_calendar_day};

/// Upstream per-day statistics are not published right at midnight.
pub const MIN_RUN_HOUR: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Due,
    NoBaseline,
    AlreadyRefreshedToday,
}

impl GateDecision {
    pub fn is_due(self) -> bool {
        matches!(self, Self::Due)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Due => "due",
            Self::NoBaseline => "no_baseline",
            Self::AlreadyRefreshedToday => "already_refreshed_today",
        }
    }
}

pub fn is_past_minimum_hour(now: &NaiveDateTime, min_run_hour: u32) -> bool {
    now.hour() >= min_run_hour
}

/// Whether a full refresh pass should run on `now`'s calendar day.
pub fn should_run_today(store: &CacheStore, now: &NaiveDateTime) -> Result<bool> {
    Ok(evaluate_gate(store, now)?.is_due())
}

pub fn evaluate_gate(store: &CacheStore, now: &NaiveDateTime) -> Result<GateDecision> {
    let minimum = store.min_pop_timestamp()?;
    let decision = decide(minimum.as_deref(), now);
    debug!(
        min_pop_timestamp = minimum.as_deref().unwrap_or("<none>"),
        decision = decision.as_str(),
        "evaluated staleness gate"
    );
    Ok(decision)
}

fn decide(minimum: Option<&str>, now: &NaiveDateTime) -> GateDecision {
    let Some(raw) = minimum else {
        return GateDecision::NoBaseline;
    };
    match parse_cache_timestamp(raw) {
        Ok(oldest) if same_calendar_day(&oldest, now) => GateDecision::AlreadyRefreshedToday,
        Ok(_) => GateDecision::Due,
        Err(error) => {
            warn!("treating unparseable minimum pop_timestamp as stale: {error:#}");
            GateDecision::Due
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    use super::{GateDecision, decide, evaluate_gate, is_past_minimum_hour, should_run_today};
    use crate::store::testing::{create_db, open_store, seed_page};

    fn now(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .expect("valid datetime")
    }

    #[test]
    fn stale_minimum_triggers_run() {
        assert_eq!(decide(Some("20261018235959"), &now(2)), GateDecision::Due);
        assert_eq!(decide(Some("20251019020000"), &now(2)), GateDecision::Due);
    }

    #[test]
    fn minimum_from_today_skips() {
        assert_eq!(
            decide(Some("20261019000001"), &now(2)),
            GateDecision::AlreadyRefreshedToday
        );
    }

    #[test]
    fn missing_baseline_skips() {
        assert_eq!(decide(None, &now(2)), GateDecision::NoBaseline);
    }

    #[test]
    fn garbage_minimum_counts_as_stale() {
        assert_eq!(decide(Some("not-a-date"), &now(2)), GateDecision::Due);
    }

    #[test]
    fn minimum_hour_policy() {
        assert!(!is_past_minimum_hour(&now(0), 1));
        assert!(is_past_minimum_hour(&now(1), 1));
        assert!(is_past_minimum_hour(&now(23), 1));
    }

    #[test]
    fn gate_reads_whole_table() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        let store = open_store(&db_path);
        assert!(!should_run_today(&store, &now(2)).expect("empty table"));

        seed_page(&db_path, 1, "Alpha", None, 0, None);
        assert_eq!(
            evaluate_gate(&store, &now(2)).expect("all null"),
            GateDecision::NoBaseline
        );

        seed_page(&db_path, 2, "Beta", Some("20261019010000"), 3, Some(1));
        assert!(!should_run_today(&store, &now(2)).expect("fresh"));

        seed_page(&db_path, 3, "Gamma", Some("20261017010000"), 3, Some(1));
        assert!(should_run_today(&store, &now(2)).expect("stale"));
    }
}
