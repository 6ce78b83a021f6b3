//! Durable-store abstraction + batched persistence for lottospot.
//!
//! The pipeline writes three collections: winner records (upsert on the
//! composite key), store aggregates (additive merge on the canonical id)
//! and run logs (append-only). [`DocumentStore`] is the seam that lets the
//! orchestrator run against Postgres in production and [`MemoryStore`] in
//! tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lottospot_core::{RunLog, StoreAggregate, StoreDelta, StoreId, WinnerRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "lottospot-store";

/// Hard cap on operations per physical commit, matching the underlying
/// transactional-write size limit of the original document store.
pub const MAX_BATCH_OPS: usize = 400;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One write destined for the durable store.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Full overwrite keyed by `(draw_no, store_external_id, sequence_no)`.
    UpsertWinner(WinnerRecord),
    /// Additive merge keyed by canonical store id: the two counts are
    /// applied as increments, every other field is overwritten.
    MergeAggregate(StoreId, StoreDelta),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Highest draw number present in the winner collection, if any.
    async fn max_winner_draw(&self) -> Result<Option<u32>, StoreError>;

    /// Winner records whose draw number lies in `[start, end]`.
    async fn winners_in_range(
        &self,
        start: u32,
        end: u32,
    ) -> Result<Vec<WinnerRecord>, StoreError>;

    /// Applies one bounded chunk of writes in a single transaction.
    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError>;

    /// Appends one run log entry, outside any batch.
    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError>;
}

/// Outcome of a fully committed batch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub winners_written: usize,
    pub stores_merged: usize,
    pub batches: usize,
}

/// A batch sequence that failed partway. Chunks before `failed_batch` are
/// durably committed; nothing after it was attempted. There is no rollback
/// and no automatic resume — recovery is a re-run, preferably recomputing
/// aggregates from the raw winner records.
#[derive(Debug, Error)]
#[error("commit failed at batch {failed_batch} with {ops_committed} ops already durable: {source}")]
pub struct CommitError {
    pub ops_committed: usize,
    pub failed_batch: usize,
    #[source]
    pub source: StoreError,
}

/// Commits winner upserts and aggregate merges in size-bounded
/// transactional chunks.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceBatcher {
    batch_size: usize,
}

impl Default for PersistenceBatcher {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_OPS,
        }
    }
}

impl PersistenceBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.clamp(1, MAX_BATCH_OPS),
        }
    }

    /// Flattens the winners and deltas into a write sequence and applies it
    /// chunk by chunk. Committing the same input twice leaves the winner
    /// records unchanged but doubles the additive count fields; that is the
    /// merge contract, not an accident.
    pub async fn commit(
        &self,
        store: &dyn DocumentStore,
        winners: &[WinnerRecord],
        deltas: &BTreeMap<StoreId, StoreDelta>,
    ) -> Result<CommitResult, CommitError> {
        let mut ops = Vec::with_capacity(winners.len() + deltas.len());
        ops.extend(winners.iter().cloned().map(WriteOp::UpsertWinner));
        ops.extend(
            deltas
                .iter()
                .map(|(id, delta)| WriteOp::MergeAggregate(id.clone(), delta.clone())),
        );

        let mut ops_committed = 0usize;
        let mut batches = 0usize;
        for (index, chunk) in ops.chunks(self.batch_size).enumerate() {
            store
                .apply_batch(chunk)
                .await
                .map_err(|source| CommitError {
                    ops_committed,
                    failed_batch: index,
                    source,
                })?;
            ops_committed += chunk.len();
            batches += 1;
            debug!(batch = index, ops = chunk.len(), "committed write batch");
        }

        Ok(CommitResult {
            winners_written: winners.len(),
            stores_merged: deltas.len(),
            batches,
        })
    }
}

/// Postgres-backed document store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.into()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn max_winner_draw(&self) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT MAX(draw_no) AS max_draw FROM lotto_winners")
            .fetch_one(&self.pool)
            .await?;
        let max: Option<i32> = row.try_get("max_draw")?;
        Ok(max.map(|d| d as u32))
    }

    async fn winners_in_range(
        &self,
        start: u32,
        end: u32,
    ) -> Result<Vec<WinnerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT draw_no, store_external_id, sequence_no, shop_name, address,
                   win_rank, sale_method, lat, lng, created_at
              FROM lotto_winners
             WHERE draw_no BETWEEN $1 AND $2
             ORDER BY draw_no, store_external_id, sequence_no
            "#,
        )
        .bind(start as i32)
        .bind(end as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let draw_no: i32 = row.try_get("draw_no")?;
            let sequence_no: i32 = row.try_get("sequence_no")?;
            let win_rank: i16 = row.try_get("win_rank")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            out.push(WinnerRecord {
                draw_no: draw_no as u32,
                store_external_id: row.try_get("store_external_id")?,
                sequence_no: sequence_no as u32,
                shop_name: row.try_get("shop_name")?,
                address: row.try_get("address")?,
                rank: win_rank as u8,
                sale_method: row.try_get("sale_method")?,
                lat: row.try_get("lat")?,
                lng: row.try_get("lng")?,
                created_at,
            });
        }
        Ok(out)
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::UpsertWinner(w) => {
                    sqlx::query(
                        r#"
                        INSERT INTO lotto_winners
                            (draw_no, store_external_id, sequence_no, shop_name, address,
                             win_rank, sale_method, lat, lng, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        ON CONFLICT (draw_no, store_external_id, sequence_no) DO UPDATE
                           SET shop_name   = EXCLUDED.shop_name,
                               address     = EXCLUDED.address,
                               win_rank    = EXCLUDED.win_rank,
                               sale_method = EXCLUDED.sale_method,
                               lat         = EXCLUDED.lat,
                               lng         = EXCLUDED.lng,
                               created_at  = EXCLUDED.created_at
                        "#,
                    )
                    .bind(w.draw_no as i32)
                    .bind(&w.store_external_id)
                    .bind(w.sequence_no as i32)
                    .bind(&w.shop_name)
                    .bind(&w.address)
                    .bind(w.rank as i16)
                    .bind(&w.sale_method)
                    .bind(w.lat)
                    .bind(w.lng)
                    .bind(w.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::MergeAggregate(store_id, delta) => {
                    // Counts are commutative increments so non-concurrent
                    // runs converge in any order; last_updated_draw is
                    // guarded monotonic so out-of-order backfills cannot
                    // move it backward.
                    sqlx::query(
                        r#"
                        INSERT INTO lotto_stores
                            (store_id, shop_name, address, lat, lng,
                             first_prize_count, second_prize_count, last_updated_draw, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        ON CONFLICT (store_id) DO UPDATE
                           SET shop_name          = EXCLUDED.shop_name,
                               address            = EXCLUDED.address,
                               lat                = EXCLUDED.lat,
                               lng                = EXCLUDED.lng,
                               first_prize_count  = lotto_stores.first_prize_count + EXCLUDED.first_prize_count,
                               second_prize_count = lotto_stores.second_prize_count + EXCLUDED.second_prize_count,
                               last_updated_draw  = GREATEST(lotto_stores.last_updated_draw, EXCLUDED.last_updated_draw),
                               updated_at         = EXCLUDED.updated_at
                        "#,
                    )
                    .bind(store_id.as_str())
                    .bind(&delta.shop_name)
                    .bind(&delta.address)
                    .bind(delta.lat)
                    .bind(delta.lng)
                    .bind(delta.first as i64)
                    .bind(delta.second as i64)
                    .bind(delta.max_draw as i32)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_logs (id, status, draw_no, message, winner_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.id)
        .bind(log.status.as_str())
        .bind(log.draw_no.map(|d| d as i32))
        .bind(&log.message)
        .bind(log.winner_count.map(|c| c as i64))
        .bind(log.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory document store with the same merge semantics as [`PgStore`].
/// Used by orchestrator and web tests; also supports injecting a batch
/// failure to exercise the partial-commit path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    winners: BTreeMap<String, WinnerRecord>,
    aggregates: BTreeMap<StoreId, StoreAggregate>,
    run_logs: Vec<RunLog>,
    applied_batches: usize,
    fail_from_batch: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `apply_batch` fail once `n` batches have been applied.
    pub async fn fail_from_batch(&self, n: usize) {
        self.inner.lock().await.fail_from_batch = Some(n);
    }

    pub async fn winner(&self, key: &str) -> Option<WinnerRecord> {
        self.inner.lock().await.winners.get(key).cloned()
    }

    pub async fn winner_count(&self) -> usize {
        self.inner.lock().await.winners.len()
    }

    pub async fn aggregate_of(&self, id: &StoreId) -> Option<StoreAggregate> {
        self.inner.lock().await.aggregates.get(id).cloned()
    }

    pub async fn run_logs(&self) -> Vec<RunLog> {
        self.inner.lock().await.run_logs.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn max_winner_draw(&self) -> Result<Option<u32>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.winners.values().map(|w| w.draw_no).max())
    }

    async fn winners_in_range(
        &self,
        start: u32,
        end: u32,
    ) -> Result<Vec<WinnerRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .winners
            .values()
            .filter(|w| w.draw_no >= start && w.draw_no <= end)
            .cloned()
            .collect())
    }

    async fn apply_batch(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(limit) = inner.fail_from_batch {
            if inner.applied_batches >= limit {
                return Err(StoreError::Unavailable("injected batch failure".into()));
            }
        }
        for op in ops {
            match op {
                WriteOp::UpsertWinner(w) => {
                    inner.winners.insert(w.document_key(), w.clone());
                }
                WriteOp::MergeAggregate(store_id, delta) => {
                    let entry = inner
                        .aggregates
                        .entry(store_id.clone())
                        .or_insert_with(|| StoreAggregate {
                            store_id: store_id.clone(),
                            shop_name: String::new(),
                            address: String::new(),
                            lat: 0.0,
                            lng: 0.0,
                            first_prize_count: 0,
                            second_prize_count: 0,
                            last_updated_draw: 0,
                            updated_at: Utc::now(),
                        });
                    entry.shop_name = delta.shop_name.clone();
                    entry.address = delta.address.clone();
                    entry.lat = delta.lat;
                    entry.lng = delta.lng;
                    entry.first_prize_count += delta.first;
                    entry.second_prize_count += delta.second;
                    entry.last_updated_draw = entry.last_updated_draw.max(delta.max_draw);
                    entry.updated_at = Utc::now();
                }
            }
        }
        inner.applied_batches += 1;
        Ok(())
    }

    async fn append_run_log(&self, log: &RunLog) -> Result<(), StoreError> {
        self.inner.lock().await.run_logs.push(log.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lottospot_core::aggregate;

    fn winner(draw_no: u32, name: &str, rank: u8, sequence_no: u32) -> WinnerRecord {
        WinnerRecord {
            draw_no,
            store_external_id: format!("ext-{name}"),
            sequence_no,
            shop_name: name.to_string(),
            address: format!("{name} street 1"),
            rank,
            sale_method: "automatic".to_string(),
            lat: 37.5,
            lng: 127.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_upserts_winners_and_merges_aggregates() {
        let store = MemoryStore::new();
        let batcher = PersistenceBatcher::default();
        let winners = vec![winner(1300, "Lucky", 1, 1), winner(1300, "Lucky", 2, 2)];
        let deltas = aggregate(&winners);

        let result = batcher.commit(&store, &winners, &deltas).await.unwrap();
        assert_eq!(result.winners_written, 2);
        assert_eq!(result.stores_merged, 1);

        let id = winners[0].store_id();
        let agg = store.aggregate_of(&id).await.unwrap();
        assert_eq!(agg.first_prize_count, 1);
        assert_eq!(agg.second_prize_count, 1);
        assert_eq!(agg.last_updated_draw, 1300);
    }

    #[tokio::test]
    async fn recommit_overwrites_winners_but_doubles_counts() {
        // The additive-merge contract: winner upserts are idempotent, the
        // count increments deliberately are not.
        let store = MemoryStore::new();
        let batcher = PersistenceBatcher::default();
        let winners = vec![winner(1300, "Lucky", 1, 1)];
        let deltas = aggregate(&winners);

        batcher.commit(&store, &winners, &deltas).await.unwrap();
        batcher.commit(&store, &winners, &deltas).await.unwrap();

        assert_eq!(store.winner_count().await, 1);
        let agg = store.aggregate_of(&winners[0].store_id()).await.unwrap();
        assert_eq!(agg.first_prize_count, 2);
    }

    #[tokio::test]
    async fn split_range_commits_match_full_range_commit() {
        let all = vec![
            winner(10, "A", 1, 1),
            winner(11, "A", 2, 1),
            winner(12, "B", 1, 1),
        ];
        let batcher = PersistenceBatcher::default();

        let full = MemoryStore::new();
        batcher
            .commit(&full, &all, &aggregate(&all))
            .await
            .unwrap();

        let split = MemoryStore::new();
        let (lo, hi) = (&all[..2], &all[2..]);
        batcher.commit(&split, lo, &aggregate(lo)).await.unwrap();
        batcher.commit(&split, hi, &aggregate(hi)).await.unwrap();

        for w in &all {
            let id = w.store_id();
            let a = full.aggregate_of(&id).await.unwrap();
            let b = split.aggregate_of(&id).await.unwrap();
            assert_eq!(a.first_prize_count, b.first_prize_count);
            assert_eq!(a.second_prize_count, b.second_prize_count);
            assert_eq!(a.last_updated_draw, b.last_updated_draw);
        }
    }

    #[tokio::test]
    async fn merge_never_moves_last_updated_draw_backward() {
        let store = MemoryStore::new();
        let batcher = PersistenceBatcher::default();

        let newer = vec![winner(1300, "Lucky", 1, 1)];
        batcher
            .commit(&store, &newer, &aggregate(&newer))
            .await
            .unwrap();

        let older = vec![winner(900, "Lucky", 2, 1)];
        batcher
            .commit(&store, &older, &aggregate(&older))
            .await
            .unwrap();

        let agg = store.aggregate_of(&newer[0].store_id()).await.unwrap();
        assert_eq!(agg.last_updated_draw, 1300);
        assert_eq!(agg.second_prize_count, 1);
    }

    #[tokio::test]
    async fn partial_failure_reports_batch_index_and_keeps_prior_batches() {
        let store = MemoryStore::new();
        store.fail_from_batch(1).await;
        let batcher = PersistenceBatcher::new(2);
        let winners = vec![
            winner(10, "A", 1, 1),
            winner(10, "B", 1, 1),
            winner(10, "C", 1, 1),
            winner(10, "D", 1, 1),
        ];
        let deltas = aggregate(&winners);

        let err = batcher
            .commit(&store, &winners, &deltas)
            .await
            .expect_err("second batch must fail");
        assert_eq!(err.failed_batch, 1);
        assert_eq!(err.ops_committed, 2);
        // First chunk landed durably, nothing after was attempted.
        assert_eq!(store.winner_count().await, 2);
    }

    #[tokio::test]
    async fn batch_size_is_capped_at_store_limit() {
        let batcher = PersistenceBatcher::new(10_000);
        let store = MemoryStore::new();
        let winners: Vec<_> = (0..401u32)
            .map(|i| winner(10, &format!("S{i}"), 1, 1))
            .collect();
        let deltas = aggregate(&winners);
        let result = batcher.commit(&store, &winners, &deltas).await.unwrap();
        // 401 upserts + 401 merges at 400 ops per physical commit.
        assert_eq!(result.batches, 3);
    }

    #[tokio::test]
    async fn memory_store_tracks_max_draw() {
        let store = MemoryStore::new();
        assert_eq!(store.max_winner_draw().await.unwrap(), None);
        let winners = vec![winner(5, "A", 1, 1), winner(9, "B", 1, 1)];
        let batcher = PersistenceBatcher::default();
        batcher
            .commit(&store, &winners, &aggregate(&winners))
            .await
            .unwrap();
        assert_eq!(store.max_winner_draw().await.unwrap(), Some(9));
    }
}
