//! Core domain model for the lottospot ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lottospot-core";

/// Placeholder for an empty upstream store name.
pub const UNKNOWN_NAME: &str = "이름없음";
/// Placeholder for an empty upstream store address.
pub const UNKNOWN_ADDRESS: &str = "주소없음";

/// Canonical identifier for one physical store, derived from its normalized
/// name and address. Stable across runs and independent of draw number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Derives the canonical id for a (name, address) pair.
    ///
    /// Whitespace is stripped from the `name_address` concatenation, path
    /// separators become underscores (raw addresses occasionally contain
    /// `/`, which would make an invalid document key), and periods and
    /// brackets are dropped. Empty inputs are replaced with the literal
    /// placeholders first, so the derivation never sees an empty string.
    ///
    /// Two genuinely different stores whose inputs normalize to the same
    /// string will merge. That is an accepted approximation of the matching
    /// problem, not something to silently tighten here.
    pub fn resolve(name: &str, address: &str) -> Self {
        let name = if name.trim().is_empty() { UNKNOWN_NAME } else { name };
        let address = if address.trim().is_empty() {
            UNKNOWN_ADDRESS
        } else {
            address
        };
        let id = format!("{name}_{address}")
            .chars()
            .filter_map(|c| match c {
                c if c.is_whitespace() => None,
                '/' => Some('_'),
                '.' | '[' | ']' => None,
                c => Some(c),
            })
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One winning ticket sold at one store for one draw.
///
/// Identity is the `(draw_no, store_external_id, sequence_no)` composite;
/// re-ingesting a draw overwrites the record rather than duplicating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub draw_no: u32,
    pub store_external_id: String,
    pub sequence_no: u32,
    pub shop_name: String,
    pub address: String,
    pub rank: u8,
    pub sale_method: String,
    pub lat: f64,
    pub lng: f64,
    pub created_at: DateTime<Utc>,
}

impl WinnerRecord {
    /// Composite document key for the winner collection.
    pub fn document_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.draw_no, self.store_external_id, self.sequence_no
        )
    }

    pub fn store_id(&self) -> StoreId {
        StoreId::resolve(&self.shop_name, &self.address)
    }
}

/// Cumulative per-store statistics as persisted in the aggregate collection.
///
/// The two prize counts only ever grow via additive merge; the sole way to
/// shrink them is an explicit recomputation from the raw winner records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAggregate {
    pub store_id: StoreId,
    pub shop_name: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub first_prize_count: u64,
    pub second_prize_count: u64,
    pub last_updated_draw: u32,
    pub updated_at: DateTime<Utc>,
}

/// Additive per-store delta produced by one aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDelta {
    pub shop_name: String,
    pub address: String,
    pub lat: f64,
    pub lng: f64,
    pub first: u64,
    pub second: u64,
    pub max_draw: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
        }
    }
}

/// Append-only outcome record of one ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub id: Uuid,
    pub status: RunStatus,
    pub draw_no: Option<u32>,
    pub message: String,
    pub winner_count: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl RunLog {
    pub fn pending(draw_no: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            draw_no: Some(draw_no),
            message: "draw not yet published".to_string(),
            winner_count: None,
            timestamp: Utc::now(),
        }
    }

    pub fn success(draw_no: u32, winner_count: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Success,
            draw_no: Some(draw_no),
            message: "ingested".to_string(),
            winner_count: Some(winner_count),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(draw_no: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Failure,
            draw_no,
            message: message.into(),
            winner_count: None,
            timestamp: Utc::now(),
        }
    }
}

/// Folds a batch of winner records into per-store additive deltas.
///
/// Winners are grouped by canonical store id; each group counts its rank-1
/// and rank-2 records and tracks the highest draw number seen. The first
/// observed record in a group supplies the representative name, address and
/// coordinates; later divergent values for the same id within the batch are
/// ignored (first write wins).
///
/// A batch spanning many draws (backfill, refine) and a single-draw batch
/// (incremental) go through the same grouping; nothing special-cases batch
/// size. Empty input yields an empty map.
pub fn aggregate(winners: &[WinnerRecord]) -> BTreeMap<StoreId, StoreDelta> {
    let mut deltas: BTreeMap<StoreId, StoreDelta> = BTreeMap::new();
    for winner in winners {
        let delta = deltas
            .entry(winner.store_id())
            .or_insert_with(|| StoreDelta {
                shop_name: winner.shop_name.clone(),
                address: winner.address.clone(),
                lat: winner.lat,
                lng: winner.lng,
                first: 0,
                second: 0,
                max_draw: 0,
            });
        match winner.rank {
            1 => delta.first += 1,
            2 => delta.second += 1,
            _ => {}
        }
        if winner.draw_no > delta.max_draw {
            delta.max_draw = winner.draw_no;
        }
    }
    deltas
}
