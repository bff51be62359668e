use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info};

use crate::model::{PopularityRecord, PopularityUpdate};
use crate::refresh_set::RefreshSet;
use crate::source::{PopularityApi, PopularityRequest};
use crate::store::CacheStore;
use crate::timestamp::{format_cache_timestamp, same_calendar_day};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub requested_titles: usize,
    pub records_received: usize,
    pub unmatched_records: usize,
    /// Records measured on another calendar day, stored with the run time.
    pub restamped_records: usize,
    pub rows_updated: usize,
}

/// Update tuples resolved from one batch of records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub updates: Vec<PopularityUpdate>,
    pub unmatched: usize,
    pub restamped: usize,
}

/// Fetches fresh popularity for every title in `refresh_set` with one batched
/// call and rewrites the matching rows in one transaction.
pub fn refresh<A: PopularityApi>(
    store: &mut CacheStore,
    api: &mut A,
    request: &PopularityRequest,
    refresh_set: &RefreshSet,
    now: &NaiveDateTime,
) -> Result<RefreshOutcome> {
    let mut outcome = RefreshOutcome {
        requested_titles: refresh_set.len(),
        ..RefreshOutcome::default()
    };
    if refresh_set.is_empty() {
        return Ok(outcome);
    }

    let titles = refresh_set.titles();
    let records = api
        .fetch_popularity(&titles, request)
        .with_context(|| format!("failed to fetch popularity for {} titles", titles.len()))?;
    outcome.records_received = records.len();

    let batch = resolve_updates(&records, refresh_set, now);
    outcome.unmatched_records = batch.unmatched;
    outcome.restamped_records = batch.restamped;
    debug!(
        received = records.len(),
        resolved = batch.updates.len(),
        unmatched = batch.unmatched,
        restamped = batch.restamped,
        "resolved popularity records"
    );

    outcome.rows_updated = store.apply_updates(&batch.updates)?;
    info!(
        requested = outcome.requested_titles,
        updated = outcome.rows_updated,
        table = store.tables().cache(),
        "refreshed popularity rows"
    );
    Ok(outcome)
}

/// Maps each record back to its `page_id`. Records for titles that were never
/// requested are dropped and counted.
///
/// A refreshed row must carry a timestamp from `now`'s calendar day, otherwise
/// the next run would treat it as stale again. Measurements dated another day
/// are therefore stored with `now` instead.
pub fn resolve_updates(
    records: &[PopularityRecord],
    refresh_set: &RefreshSet,
    now: &NaiveDateTime,
) -> ResolvedBatch {
    let mut batch = ResolvedBatch {
        updates: Vec::with_capacity(records.len()),
        ..ResolvedBatch::default()
    };
    for record in records {
        let Some(page_id) = refresh_set.page_id(&record.title) else {
            batch.unmatched += 1;
            continue;
        };
        let stamped = if same_calendar_day(&record.pop_timestamp, now) {
            record.pop_timestamp
        } else {
            batch.restamped += 1;
            *now
        };
        batch.updates.push(PopularityUpdate {
            pop_timestamp: format_cache_timestamp(&stamped),
            pop_count: record.pop_count,
            popularity: record.popularity,
            page_id,
        });
    }
    batch
}
