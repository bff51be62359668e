use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::timestamp::parse_cache_timestamp;

/// Coarse popularity bucket. Persisted as its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PopularityTier {
    Low,
    Medium,
    High,
}

impl PopularityTier {
    pub const ALL: [Self; 3] = [Self::Low, Self::Medium, Self::High];

    pub fn ordinal(self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "mid" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for PopularityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PopularityTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PopularityTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTier {
            Label(String),
            Ordinal(i64),
        }

        let tier = match RawTier::deserialize(deserializer)? {
            RawTier::Label(label) => Self::from_label(&label),
            RawTier::Ordinal(value) => Self::from_ordinal(value),
        };
        tier.ok_or_else(|| serde::de::Error::custom("unknown popularity tier"))
    }
}

/// One cached row joined with its catalog title. `pop_timestamp` is kept as
/// stored (`YYYYMMDDHHMMSS`); see [`CacheRow::refreshed_at`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheRow {
    pub page_id: i64,
    pub page_title: String,
    pub pop_timestamp: Option<String>,
    pub pop_count: i64,
    pub popularity: Option<PopularityTier>,
}

impl CacheRow {
    /// `None` when never refreshed or when the stored value does not parse.
    pub fn refreshed_at(&self) -> Option<NaiveDateTime> {
        self.pop_timestamp
            .as_deref()
            .and_then(|value| parse_cache_timestamp(value).ok())
    }
}

/// A measurement returned by the statistics service. Keyed by title only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularityRecord {
    pub title: String,
    pub pop_timestamp: NaiveDateTime,
    pub pop_count: i64,
    pub popularity: PopularityTier,
}

/// A single row rewrite in the batched update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularityUpdate {
    pub pop_timestamp: String,
    pub pop_count: i64,
    pub popularity: PopularityTier,
    pub page_id: i64,
}

/// Storage titles use underscores where display titles use spaces.
pub fn normalize_title(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::{PopularityTier, normalize_title};

    #[test]
    fn tier_ordinals_round_trip() {
        for tier in PopularityTier::ALL {
            assert_eq!(PopularityTier::from_ordinal(tier.ordinal()), Some(tier));
        }
        assert_eq!(PopularityTier::from_ordinal(0), None);
        assert_eq!(PopularityTier::from_ordinal(4), None);
    }

    #[test]
    fn tier_deserializes_from_label_or_ordinal() {
        let from_label: PopularityTier = serde_json::from_str("\"High\"").expect("label");
        let from_ordinal: PopularityTier = serde_json::from_str("2").expect("ordinal");
        assert_eq!(from_label, PopularityTier::High);
        assert_eq!(from_ordinal, PopularityTier::Medium);
        assert!(serde_json::from_str::<PopularityTier>("\"viral\"").is_err());
    }

    #[test]
    fn normalize_title_replaces_underscores() {
        assert_eq!(normalize_title(b"Main_Page"), "Main Page");
        assert_eq!(normalize_title("Caf\u{e9}_au_lait".as_bytes()), "Caf\u{e9} au lait");
        assert_eq!(normalize_title(b"Plain"), "Plain");
    }
}
