use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::model::CacheRow;
use crate::store::CacheStore;
use crate::timestamp::{parse_cache_timestamp, same_calendar_day};

/// Titles due for a popularity update this run, mapped to their `page_id`.
///
/// Built once per run and only read afterwards; the statistics service knows
/// titles, not ids, so this is how its answers find their rows again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSet {
    pages: BTreeMap<String, i64>,
    collisions: Vec<TitleCollision>,
}

/// Two cached pages whose titles normalize to the same text. The later page
/// (higher `page_id`) wins the mapping entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleCollision {
    pub title: String,
    pub replaced_page_id: i64,
    pub page_id: i64,
}

impl RefreshSet {
    pub fn from_rows<'a, I>(rows: I, now: &NaiveDateTime) -> Self
    where
        I: IntoIterator<Item = &'a CacheRow>,
    {
        let mut set = Self::default();
        for row in rows {
            if !needs_refresh(row.pop_timestamp.as_deref(), now) {
                continue;
            }
            if let Some(replaced) = set.pages.insert(row.page_title.clone(), row.page_id) {
                set.collisions.push(TitleCollision {
                    title: row.page_title.clone(),
                    replaced_page_id: replaced,
                    page_id: row.page_id,
                });
            }
        }
        set
    }

    pub fn page_id(&self, title: &str) -> Option<i64> {
        self.pages.get(title).copied()
    }

    pub fn titles(&self) -> Vec<String> {
        self.pages.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.pages.iter().map(|(title, page_id)| (title.as_str(), *page_id))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn collisions(&self) -> &[TitleCollision] {
        &self.collisions
    }
}

/// A row is due when it was never refreshed or was refreshed on another day.
pub fn needs_refresh(pop_timestamp: Option<&str>, now: &NaiveDateTime) -> bool {
    match pop_timestamp {
        None => true,
        Some(raw) => match parse_cache_timestamp(raw) {
            Ok(refreshed) => !same_calendar_day(&refreshed, now),
            Err(_) => true,
        },
    }
}

pub fn build_refresh_set(store: &CacheStore, now: &NaiveDateTime) -> Result<RefreshSet> {
    let rows = store.load_rows()?;
    let set = RefreshSet::from_rows(&rows, now);
    for collision in set.collisions() {
        warn!(
            title = %collision.title,
            kept_page_id = collision.page_id,
            dropped_page_id = collision.replaced_page_id,
            "two pages normalize to the same title; keeping the later page"
        );
    }
    debug!(
        scanned = rows.len(),
        due = set.len(),
        "built refresh set"
    );
    Ok(set)
}
