use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{error, info};

use crate::config::WikipopConfig;
use crate::refresh_set::{RefreshSet, build_refresh_set, needs_refresh};
use crate::refresher::refresh;
use crate::source::{PopularityApi, PopularityClient, PopularityClientConfig, PopularityRequest};
use crate::staleness::{GateDecision, evaluate_gate, is_past_minimum_hour};
use crate::store::{CacheStore, CacheTables};
use crate::timestamp::format_cache_timestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    pub request: PopularityRequest,
    pub min_run_hour: u32,
    /// Bypass the hour policy and the staleness gate.
    pub force: bool,
    /// Compute the refresh set but neither fetch nor write.
    pub dry_run: bool,
}

/// Command-line level overrides applied on top of the loaded config.
#[derive(Debug, Clone, Default)]
pub struct UpdateFlags {
    pub force: bool,
    pub dry_run: bool,
    pub lang: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Refreshed,
    NothingToRefresh,
    Skipped,
    DryRun,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BeforeMinimumHour,
    NoBaseline,
    AlreadyRefreshedToday,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeMinimumHour => "before_minimum_hour",
            Self::NoBaseline => "no_baseline",
            Self::AlreadyRefreshedToday => "already_refreshed_today",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub success: bool,
    pub status: RunStatus,
    pub skip_reason: Option<SkipReason>,
    pub evaluated_at: String,
    pub table: String,
    pub lang: String,
    pub refresh_set_size: usize,
    pub title_collisions: usize,
    pub records_received: usize,
    pub unmatched_records: usize,
    pub restamped_records: usize,
    pub rows_updated: usize,
    pub request_count: usize,
    pub errors: Vec<String>,
}

impl UpdateReport {
    fn new(now: &NaiveDateTime, table: &str, lang: &str) -> Self {
        Self {
            success: true,
            status: RunStatus::NothingToRefresh,
            skip_reason: None,
            evaluated_at: format_cache_timestamp(now),
            table: table.to_string(),
            lang: lang.to_string(),
            refresh_set_size: 0,
            title_collisions: 0,
            records_received: 0,
            unmatched_records: 0,
            restamped_records: 0,
            rows_updated: 0,
            request_count: 0,
            errors: Vec::new(),
        }
    }

    fn fail(mut self, error: anyhow::Error) -> Self {
        error!("popularity update failed: {error:#}");
        self.success = false;
        self.status = RunStatus::Failed;
        self.errors.push(format!("{error:#}"));
        self
    }
}

/// State for one update run. Built per invocation; nothing outlives it.
pub struct UpdateSession<A: PopularityApi> {
    store: CacheStore,
    api: A,
    options: UpdateOptions,
}

impl<A: PopularityApi> UpdateSession<A> {
    pub fn new(store: CacheStore, api: A, options: UpdateOptions) -> Self {
        Self {
            store,
            api,
            options,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs the gate, builds the refresh set and refreshes it. Failures are
    /// folded into the returned report.
    pub fn update(&mut self, now: &NaiveDateTime) -> UpdateReport {
        let mut report = UpdateReport::new(
            now,
            self.store.tables().cache(),
            &self.options.request.lang,
        );
        if let Err(error) = self.run(now, &mut report) {
            report = report.fail(error);
        }
        report.request_count = self.api.request_count();
        report
    }

    fn run(&mut self, now: &NaiveDateTime, report: &mut UpdateReport) -> Result<()> {
        if !self.options.force {
            if !is_past_minimum_hour(now, self.options.min_run_hour) {
                skipped(report, SkipReason::BeforeMinimumHour);
                return Ok(());
            }
            match evaluate_gate(&self.store, now)? {
                GateDecision::Due => {}
                GateDecision::NoBaseline => {
                    skipped(report, SkipReason::NoBaseline);
                    return Ok(());
                }
                GateDecision::AlreadyRefreshedToday => {
                    skipped(report, SkipReason::AlreadyRefreshedToday);
                    return Ok(());
                }
            }
        }

        let refresh_set = build_refresh_set(&self.store, now)?;
        report.refresh_set_size = refresh_set.len();
        report.title_collisions = refresh_set.collisions().len();

        if self.options.dry_run {
            report.status = RunStatus::DryRun;
            info!(due = refresh_set.len(), "dry run; no popularity fetched");
            return Ok(());
        }
        if refresh_set.is_empty() {
            report.status = RunStatus::NothingToRefresh;
            return Ok(());
        }

        let outcome = refresh(
            &mut self.store,
            &mut self.api,
            &self.options.request,
            &refresh_set,
            now,
        )?;
        report.records_received = outcome.records_received;
        report.unmatched_records = outcome.unmatched_records;
        report.restamped_records = outcome.restamped_records;
        report.rows_updated = outcome.rows_updated;
        report.status = RunStatus::Refreshed;
        Ok(())
    }
}

fn skipped(report: &mut UpdateReport, reason: SkipReason) {
    info!(reason = reason.as_str(), "popularity refresh not due");
    report.status = RunStatus::Skipped;
    report.skip_reason = Some(reason);
}

/// Builds a session against the database at `db_path` and runs it.
pub fn run_update(
    db_path: &Path,
    config: &WikipopConfig,
    flags: &UpdateFlags,
    now: &NaiveDateTime,
) -> UpdateReport {
    let mut request = config.popularity_request();
    if let Some(lang) = &flags.lang {
        request.lang = lang.clone();
    }
    let table = flags.table.clone().unwrap_or_else(|| config.table());
    let report = UpdateReport::new(now, &table, &request.lang);

    match prepare_session(db_path, config, flags, request, &table) {
        Ok(mut session) => session.update(now),
        Err(error) => report.fail(error),
    }
}

fn prepare_session(
    db_path: &Path,
    config: &WikipopConfig,
    flags: &UpdateFlags,
    request: PopularityRequest,
    table: &str,
) -> Result<UpdateSession<PopularityClient>> {
    let tables = CacheTables::new(table, &config.catalog_table())?;
    let options = UpdateOptions {
        request,
        min_run_hour: config.min_run_hour()?,
        force: flags.force,
        dry_run: flags.dry_run,
    };
    let store = CacheStore::open(db_path, tables)?;
    let api = PopularityClient::new(PopularityClientConfig::from_config(config))?;
    Ok(UpdateSession::new(store, api, options))
}

/// Freshness summary over the cache rows that have a catalog entry. Only
/// `gate` looks at the whole cache table.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub table: String,
    pub total_rows: usize,
    pub never_refreshed: usize,
    pub stale: usize,
    pub fresh: usize,
    pub oldest_timestamp: Option<String>,
    pub newest_timestamp: Option<String>,
    pub by_tier: BTreeMap<String, usize>,
    pub past_minimum_hour: bool,
    pub gate: GateDecision,
    pub refresh_set_size: usize,
}

impl CacheStatus {
    pub fn run_due(&self) -> bool {
        self.past_minimum_hour && self.gate.is_due()
    }
}

pub fn cache_status(
    store: &CacheStore,
    now: &NaiveDateTime,
    min_run_hour: u32,
) -> Result<CacheStatus> {
    let rows = store.load_rows()?;
    let mut status = CacheStatus {
        table: store.tables().cache().to_string(),
        total_rows: rows.len(),
        never_refreshed: 0,
        stale: 0,
        fresh: 0,
        oldest_timestamp: None,
        newest_timestamp: None,
        by_tier: BTreeMap::new(),
        past_minimum_hour: is_past_minimum_hour(now, min_run_hour),
        gate: evaluate_gate(store, now)?,
        refresh_set_size: RefreshSet::from_rows(&rows, now).len(),
    };

    let mut oldest: Option<NaiveDateTime> = None;
    let mut newest: Option<NaiveDateTime> = None;
    for row in &rows {
        match row.pop_timestamp.as_deref() {
            None => status.never_refreshed += 1,
            Some(value) if needs_refresh(Some(value), now) => status.stale += 1,
            Some(_) => status.fresh += 1,
        }
        if let Some(refreshed) = row.refreshed_at() {
            oldest = Some(oldest.map_or(refreshed, |current| current.min(refreshed)));
            newest = Some(newest.map_or(refreshed, |current| current.max(refreshed)));
        }
        let tier = row
            .popularity
            .map(|tier| tier.as_str())
            .unwrap_or("unknown");
        *status.by_tier.entry(tier.to_string()).or_insert(0) += 1;
    }
    status.oldest_timestamp = oldest.as_ref().map(format_cache_timestamp);
    status.newest_timestamp = newest.as_ref().map(format_cache_timestamp);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    use super::{
        RunStatus, SkipReason, UpdateFlags, UpdateOptions, UpdateSession, cache_status,
        run_update,
    };
    use crate::config::WikipopConfig;
    use crate::model::{PopularityRecord, PopularityTier};
    use crate::source::{PopularityApi, PopularityRequest};
    use crate::staleness::GateDecision;
    use crate::store::testing::{create_db, open_store, seed_page};
    use crate::timestamp::parse_source_timestamp;

    #[derive(Default)]
    struct MockApi {
        records: BTreeMap<String, PopularityRecord>,
        fail: bool,
        request_count: usize,
    }

    impl PopularityApi for MockApi {
        fn fetch_popularity(
            &mut self,
            titles: &[String],
            _request: &PopularityRequest,
        ) -> anyhow::Result<Vec<PopularityRecord>> {
            self.request_count += 1;
            if self.fail {
                anyhow::bail!("statistics service unavailable");
            }
            Ok(titles
                .iter()
                .filter_map(|title| self.records.get(title).cloned())
                .collect())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .expect("valid datetime")
    }

    fn options() -> UpdateOptions {
        UpdateOptions {
            request: PopularityRequest {
                lang: "en".to_string(),
                max_records: None,
            },
            min_run_hour: 1,
            force: false,
            dry_run: false,
        }
    }

    fn api_with(titles: &[&str]) -> MockApi {
        let mut api = MockApi::default();
        for (index, title) in titles.iter().enumerate() {
            api.records.insert(
                (*title).to_string(),
                PopularityRecord {
                    title: (*title).to_string(),
                    pop_timestamp: at(2),
                    pop_count: 100 * (index as i64 + 1),
                    popularity: PopularityTier::Medium,
                },
            );
        }
        api
    }

    #[test]
    fn refreshes_null_and_yesterday_rows_but_not_today() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Never", None, 0, None);
        seed_page(&db_path, 2, "Yesterday", Some("20261018030000"), 1, Some(1));
        seed_page(&db_path, 3, "Today", Some("20261019003000"), 1, Some(1));

        let mut session = UpdateSession::new(
            open_store(&db_path),
            api_with(&["Never", "Yesterday", "Today"]),
            options(),
        );
        let report = session.update(&at(2));

        assert!(report.success);
        assert_eq!(report.status, RunStatus::Refreshed);
        assert_eq!(report.refresh_set_size, 2);
        assert_eq!(report.rows_updated, 2);
        assert_eq!(report.request_count, 1);

        let rows = session.store().load_rows().expect("rows");
        let today = rows.iter().find(|row| row.page_id == 3).expect("today row");
        assert_eq!(today.pop_timestamp.as_deref(), Some("20261019003000"));
        assert_eq!(today.pop_count, 1);
    }

    #[test]
    fn empty_table_skips_without_fetching() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());

        let mut session = UpdateSession::new(open_store(&db_path), MockApi::default(), options());
        let report = session.update(&at(2));

        assert!(report.success);
        assert_eq!(report.status, RunStatus::Skipped);
        assert_eq!(report.skip_reason, Some(SkipReason::NoBaseline));
        assert_eq!(report.rows_updated, 0);
        assert_eq!(session.api().request_count(), 0);
    }

    #[test]
    fn run_before_minimum_hour_is_skipped() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261001000000"), 1, Some(1));

        let mut session = UpdateSession::new(open_store(&db_path), api_with(&["Alpha"]), options());
        let report = session.update(&at(0));
        assert_eq!(report.skip_reason, Some(SkipReason::BeforeMinimumHour));
        assert_eq!(session.api().request_count(), 0);
    }

    #[test]
    fn same_day_rerun_is_a_no_op() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261010000000"), 1, Some(1));
        seed_page(&db_path, 2, "Beta", Some("20261010000000"), 1, Some(1));

        let mut session = UpdateSession::new(
            open_store(&db_path),
            api_with(&["Alpha", "Beta"]),
            options(),
        );
        assert_eq!(session.update(&at(2)).rows_updated, 2);

        let second = session.update(&at(5));
        assert!(second.success);
        assert_eq!(second.skip_reason, Some(SkipReason::AlreadyRefreshedToday));
        assert_eq!(session.api().request_count(), 1);
    }

    #[test]
    fn force_ignores_gate_but_not_freshness() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", None, 0, None);
        seed_page(&db_path, 2, "Beta", Some("20261019003000"), 1, Some(1));

        let mut session = UpdateSession::new(
            open_store(&db_path),
            api_with(&["Alpha", "Beta"]),
            UpdateOptions {
                force: true,
                ..options()
            },
        );
        let report = session.update(&at(0));
        assert_eq!(report.status, RunStatus::Refreshed);
        assert_eq!(report.refresh_set_size, 1);
        assert_eq!(report.rows_updated, 1);
    }

    #[test]
    fn offset_source_timestamp_still_closes_the_day() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261010000000"), 1, Some(1));

        let mut api = MockApi::default();
        api.records.insert(
            "Alpha".to_string(),
            PopularityRecord {
                title: "Alpha".to_string(),
                pop_timestamp: parse_source_timestamp("2026-10-19T01:30:00+02:00")
                    .expect("timestamp"),
                pop_count: 50,
                popularity: PopularityTier::High,
            },
        );
        let mut session = UpdateSession::new(open_store(&db_path), api, options());

        let first = session.update(&at(2));
        assert_eq!(first.status, RunStatus::Refreshed);
        assert_eq!(first.restamped_records, 1);
        let rows = session.store().load_rows().expect("rows");
        assert_eq!(rows[0].pop_timestamp.as_deref(), Some("20261019020000"));

        let second = session.update(&at(5));
        assert_eq!(second.status, RunStatus::Skipped);
        assert_eq!(second.skip_reason, Some(SkipReason::AlreadyRefreshedToday));
        assert_eq!(session.api().request_count(), 1);
    }

    #[test]
    fn dry_run_reports_without_fetching() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261001000000"), 1, Some(1));

        let mut session = UpdateSession::new(
            open_store(&db_path),
            api_with(&["Alpha"]),
            UpdateOptions {
                dry_run: true,
                ..options()
            },
        );
        let report = session.update(&at(2));
        assert_eq!(report.status, RunStatus::DryRun);
        assert_eq!(report.refresh_set_size, 1);
        assert_eq!(session.api().request_count(), 0);
        let rows = session.store().load_rows().expect("rows");
        assert_eq!(rows[0].pop_timestamp.as_deref(), Some("20261001000000"));
    }

    #[test]
    fn source_failure_reports_failure_and_keeps_rows() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261001000000"), 4, Some(2));

        let api = MockApi {
            fail: true,
            ..MockApi::default()
        };
        let mut session = UpdateSession::new(open_store(&db_path), api, options());
        let report = session.update(&at(2));

        assert!(!report.success);
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.refresh_set_size, 1);
        assert_eq!(report.rows_updated, 0);
        assert_eq!(report.request_count, 1);
        assert!(report.errors[0].contains("statistics service unavailable"));
        let rows = session.store().load_rows().expect("rows");
        assert_eq!(rows[0].pop_timestamp.as_deref(), Some("20261001000000"));
        assert_eq!(rows[0].pop_count, 4);
    }

    #[test]
    fn missing_database_reports_failure() {
        let temp = tempdir().expect("tempdir");
        let report = run_update(
            &temp.path().join("absent.db"),
            &WikipopConfig::default(),
            &UpdateFlags::default(),
            &at(2),
        );
        assert!(!report.success);
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.errors[0].contains("cache database not found"));
        assert!(!temp.path().join("absent.db").exists());
    }

    #[test]
    fn status_ignores_orphan_cache_rows() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Alpha", Some("20261018030000"), 1, Some(2));
        let connection = rusqlite::Connection::open(&db_path).expect("open");
        connection
            .pragma_update(None, "foreign_keys", "OFF")
            .expect("disable foreign_keys");
        connection
            .execute(
                "INSERT INTO popularity_cache (page_id, pop_timestamp, pop_count) VALUES (99, '20250101000000', 0)",
                [],
            )
            .expect("insert orphan cache row");

        let store = open_store(&db_path);
        let status = cache_status(&store, &at(2), 1).expect("status");
        assert_eq!(status.total_rows, 1);
        assert_eq!(status.oldest_timestamp.as_deref(), Some("20261018030000"));
        assert_eq!(status.newest_timestamp.as_deref(), Some("20261018030000"));
        assert_eq!(
            store.min_pop_timestamp().expect("min").as_deref(),
            Some("20250101000000")
        );
    }

    #[test]
    fn status_summarizes_rows() {
        let temp = tempdir().expect("tempdir");
        let db_path = create_db(temp.path());
        seed_page(&db_path, 1, "Never", None, 0, None);
        seed_page(&db_path, 2, "Yesterday", Some("20261018030000"), 1, Some(1));
        seed_page(&db_path, 3, "Today", Some("20261019003000"), 1, Some(3));

        let status = cache_status(&open_store(&db_path), &at(2), 1).expect("status");
        assert_eq!(status.total_rows, 3);
        assert_eq!(status.never_refreshed, 1);
        assert_eq!(status.stale, 1);
        assert_eq!(status.fresh, 1);
        assert_eq!(status.oldest_timestamp.as_deref(), Some("20261018030000"));
        assert_eq!(status.newest_timestamp.as_deref(), Some("20261019003000"));
        assert_eq!(status.by_tier.get("unknown"), Some(&1));
        assert_eq!(status.by_tier.get("high"), Some(&1));
        assert_eq!(status.gate, GateDecision::Due);
        assert_eq!(status.refresh_set_size, 2);
        assert!(status.run_due());
    }
}
