#![cfg(feature = "sqlite")]

use crate::storage_traits::{NotificationSink, RecordStore};
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use cropmint_core::context::WorkerContext;
use cropmint_core::error::StoreError;
use cropmint_core::id::{EvaluationId, RequestId, TransactionId, UserId};
use cropmint_core::objects::{
    CropEvaluation, EvaluationLookup, NotificationRecord, RequestStatus, TokenizationRequest,
    Transition,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::runtime::Runtime;

/// SQL query constants to avoid repetition
mod sql {
    pub const CREATE_REQUESTS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS tokenization_requests (
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'minting', 'completed', 'failed')),
            transaction_ids TEXT NOT NULL DEFAULT '[]',
            error_message TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            claimed_at INTEGER,
            completed_at INTEGER,
            created_at INTEGER NOT NULL
        )
    "#;

    pub const CREATE_REQUESTS_INDEX: &str = r#"
        CREATE INDEX IF NOT EXISTS idx_tokenization_requests_queue
        ON tokenization_requests(status, created_at, id)
    "#;

    pub const CREATE_EVALUATIONS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS crop_evaluations (
            id TEXT PRIMARY KEY,
            farmer_id TEXT NOT NULL,
            crop_type TEXT NOT NULL,
            estimated_value INTEGER NOT NULL,
            harvest_date INTEGER
        )
    "#;

    pub const CREATE_PROFILES_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS farmer_profiles (
            user_id TEXT PRIMARY KEY,
            wallet_address TEXT
        )
    "#;

    pub const CREATE_NOTIFICATIONS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            type TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
    "#;

    pub const CREATE_NOTIFICATIONS_INDEX: &str = r#"
        CREATE INDEX IF NOT EXISTS idx_notifications_user
        ON notifications(user_id, created_at)
    "#;

    pub const REQUEST_COLUMNS: &str = "id, evaluation_id, status, transaction_ids, error_message, \
         attempts, claimed_at, completed_at, created_at";

    pub const SELECT_PENDING_BATCH: &str = r#"
        SELECT id, evaluation_id, status, transaction_ids, error_message,
               attempts, claimed_at, completed_at, created_at
        FROM tokenization_requests
        WHERE status = 'pending'
        ORDER BY created_at ASC, id ASC
        LIMIT ?
    "#;

    pub const CLAIM_FOR_MINTING: &str = r#"
        UPDATE tokenization_requests
        SET status = 'minting', attempts = attempts + 1, claimed_at = ?
        WHERE id = ? AND status = 'pending'
    "#;

    pub const SELECT_MINTING_TRANSACTIONS: &str = r#"
        SELECT transaction_ids
        FROM tokenization_requests
        WHERE id = ? AND status = 'minting'
    "#;

    pub const UPDATE_MINTING_TRANSACTIONS: &str = r#"
        UPDATE tokenization_requests
        SET transaction_ids = ?
        WHERE id = ? AND status = 'minting'
    "#;

    pub const COMPLETE: &str = r#"
        UPDATE tokenization_requests
        SET status = 'completed', transaction_ids = ?, error_message = NULL, completed_at = ?
        WHERE id = ? AND status = 'minting'
    "#;

    pub const FAIL: &str = r#"
        UPDATE tokenization_requests
        SET status = 'failed', transaction_ids = ?, error_message = ?
        WHERE id = ? AND status = 'minting'
    "#;

    pub const SELECT_ALL_MINTING: &str = r#"
        SELECT id, evaluation_id, status, transaction_ids, error_message,
               attempts, claimed_at, completed_at, created_at
        FROM tokenization_requests
        WHERE status = 'minting'
        ORDER BY created_at ASC, id ASC
    "#;

    pub const FAIL_ALL_MINTING: &str = r#"
        UPDATE tokenization_requests
        SET status = 'failed', error_message = ?
        WHERE status = 'minting'
    "#;

    pub const LOOKUP_EVALUATION: &str = r#"
        SELECT e.id, e.farmer_id, e.crop_type, e.estimated_value, e.harvest_date,
               p.wallet_address
        FROM crop_evaluations e
        LEFT JOIN farmer_profiles p ON p.user_id = e.farmer_id
        WHERE e.id = ?
    "#;

    pub const ENQUEUE: &str = r#"
        INSERT OR IGNORE INTO tokenization_requests (id, evaluation_id, status, created_at)
        VALUES (?, ?, 'pending', ?)
    "#;

    pub const UPSERT_EVALUATION: &str = r#"
        INSERT OR REPLACE INTO crop_evaluations
            (id, farmer_id, crop_type, estimated_value, harvest_date)
        VALUES (?, ?, ?, ?, ?)
    "#;

    pub const UPSERT_PROFILE: &str = r#"
        INSERT OR REPLACE INTO farmer_profiles (user_id, wallet_address)
        VALUES (?, ?)
    "#;

    pub const INSERT_NOTIFICATION: &str = r#"
        INSERT INTO notifications (id, user_id, type, message, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
    "#;

    pub const SELECT_NOTIFICATIONS_FOR_USER: &str = r#"
        SELECT id, user_id, type, message, metadata, created_at
        FROM notifications
        WHERE user_id = ?
        ORDER BY created_at ASC, id ASC
    "#;
}

/// A SQLite-based implementation of the record store using sqlx.
///
/// The async pool is driven through the shared worker runtime so that callers
/// see a blocking interface.
pub struct SqliteRecordStore {
    pool: SqlitePool,
    rt: Arc<Runtime>,
}

impl SqliteRecordStore {
    /// Open the store described by the worker configuration
    pub fn open(ctx: &WorkerContext) -> Result<Self, StoreError> {
        Self::new(&ctx.config().database_url, ctx.runtime())
    }

    /// Connect to `database_url` (a `sqlite:` URL) and create the schema if needed
    pub fn new(database_url: &str, rt: Arc<Runtime>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = rt
            .block_on(async {
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
            })
            .with_context(|| "Failed to connect to database")?;

        rt.block_on(Self::initialize_schema(&pool))
            .with_context(|| "Failed to initialize database schema")?;

        Ok(Self { pool, rt })
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for statement in [
            sql::CREATE_REQUESTS_TABLE,
            sql::CREATE_REQUESTS_INDEX,
            sql::CREATE_EVALUATIONS_TABLE,
            sql::CREATE_PROFILES_TABLE,
            sql::CREATE_NOTIFICATIONS_TABLE,
            sql::CREATE_NOTIFICATIONS_INDEX,
        ] {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    /// Queue a tokenization request for an approved evaluation.
    ///
    /// At most one request exists per evaluation: enqueueing the same
    /// evaluation again returns the existing request unchanged.
    pub fn enqueue(&self, evaluation_id: &EvaluationId) -> Result<TokenizationRequest, StoreError> {
        self.enqueue_at(evaluation_id, Utc::now())
    }

    /// Queue a request with an explicit creation time
    pub fn enqueue_at(
        &self,
        evaluation_id: &EvaluationId,
        created_at: DateTime<Utc>,
    ) -> Result<TokenizationRequest, StoreError> {
        self.rt.block_on(async {
            let id = uuid::Uuid::new_v4().to_string();
            let inserted = sqlx::query(sql::ENQUEUE)
                .bind(&id)
                .bind(evaluation_id.as_str())
                .bind(created_at.timestamp_millis())
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to enqueue evaluation {}", evaluation_id))?;

            if inserted.rows_affected() == 0 {
                log::debug!(
                    "Evaluation {} already has a tokenization request",
                    evaluation_id
                );
            }

            let query = format!(
                "SELECT {} FROM tokenization_requests WHERE evaluation_id = ?",
                sql::REQUEST_COLUMNS
            );
            let row = sqlx::query(&query)
                .bind(evaluation_id.as_str())
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("Failed to read request for {}", evaluation_id))?;

            row_to_request(&row)
        })
    }

    /// Write an evaluation together with its farmer's wallet address
    pub fn upsert_evaluation(&self, evaluation: &CropEvaluation) -> Result<(), StoreError> {
        let estimated_value = i64::try_from(evaluation.estimated_value).map_err(|_| {
            StoreError::Serialization(format!(
                "estimated value {} does not fit the evaluations table",
                evaluation.estimated_value
            ))
        })?;

        self.rt.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .with_context(|| "Failed to start database transaction")?;

            sqlx::query(sql::UPSERT_EVALUATION)
                .bind(evaluation.evaluation_id.as_str())
                .bind(evaluation.farmer_id.as_str())
                .bind(&evaluation.crop_type)
                .bind(estimated_value)
                .bind(evaluation.harvest_date.map(|d| d.timestamp_millis()))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to store evaluation {}", evaluation.evaluation_id))?;

            sqlx::query(sql::UPSERT_PROFILE)
                .bind(evaluation.farmer_id.as_str())
                .bind(evaluation.wallet_address.as_deref())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to store profile {}", evaluation.farmer_id))?;

            tx.commit()
                .await
                .with_context(|| "Failed to commit transaction")?;
            Ok(())
        })
    }

    /// Set or clear the wallet address on a farmer profile
    pub fn upsert_farmer_wallet(
        &self,
        user_id: &UserId,
        wallet_address: Option<&str>,
    ) -> Result<(), StoreError> {
        self.rt.block_on(async {
            sqlx::query(sql::UPSERT_PROFILE)
                .bind(user_id.as_str())
                .bind(wallet_address)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to store profile {}", user_id))?;
            Ok(())
        })
    }

    /// All notifications delivered to a user, oldest first
    pub fn notifications_for(&self, user_id: &UserId) -> Result<Vec<NotificationRecord>, StoreError> {
        self.rt.block_on(async {
            let rows = sqlx::query(sql::SELECT_NOTIFICATIONS_FOR_USER)
                .bind(user_id.as_str())
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch notifications for {}", user_id))?;

            rows.iter().map(row_to_notification).collect()
        })
    }

    /// Append-only update of the transaction list inside one database transaction
    async fn append_transaction(
        &self,
        id: &RequestId,
        transaction_id: &TransactionId,
    ) -> Result<Transition, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "Failed to start database transaction")?;

        let row = sqlx::query(sql::SELECT_MINTING_TRANSACTIONS)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("Failed to read transactions of {}", id))?;

        let Some(row) = row else {
            return Ok(Transition::Stale);
        };

        let mut transaction_ids = decode_transaction_ids(&row.get::<String, _>(0))?;
        transaction_ids.push(transaction_id.clone());

        sqlx::query(sql::UPDATE_MINTING_TRANSACTIONS)
            .bind(serde_json::to_string(&transaction_ids)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record transaction {} on {}", transaction_id, id))?;

        tx.commit()
            .await
            .with_context(|| "Failed to commit transaction")?;
        Ok(Transition::Applied)
    }

    /// Move a `minting` record to its terminal state without losing recorded transactions
    async fn settle(
        &self,
        id: &RequestId,
        transaction_ids: &[TransactionId],
        settlement: Settlement<'_>,
    ) -> Result<Transition, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "Failed to start database transaction")?;

        let row = sqlx::query(sql::SELECT_MINTING_TRANSACTIONS)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("Failed to read transactions of {}", id))?;

        let Some(row) = row else {
            return Ok(Transition::Stale);
        };

        let stored = decode_transaction_ids(&row.get::<String, _>(0))?;
        let merged = match settlement {
            // Completion must report the full history itself
            Settlement::Completed if transaction_ids.starts_with(&stored) => transaction_ids,
            Settlement::Failed(_) if transaction_ids.starts_with(&stored) => transaction_ids,
            Settlement::Failed(_) if stored.starts_with(transaction_ids) => stored.as_slice(),
            _ => {
                return Err(StoreError::Corrupt(format!(
                    "settling {} with {:?} would drop recorded transactions {:?}",
                    id, transaction_ids, stored
                )))
            }
        };
        let merged = serde_json::to_string(merged)?;

        match settlement {
            Settlement::Completed => sqlx::query(sql::COMPLETE)
                .bind(merged)
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to complete {}", id))?,
            Settlement::Failed(reason) => sqlx::query(sql::FAIL)
                .bind(merged)
                .bind(reason)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to mark {} as failed", id))?,
        };

        tx.commit()
            .await
            .with_context(|| "Failed to commit transaction")?;
        Ok(Transition::Applied)
    }
}

#[derive(Clone, Copy)]
enum Settlement<'a> {
    Completed,
    Failed(&'a str),
}

impl RecordStore for SqliteRecordStore {
    fn claim_next_batch(&self, limit: usize) -> Result<Vec<TokenizationRequest>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.rt.block_on(async {
            let rows = sqlx::query(sql::SELECT_PENDING_BATCH)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .with_context(|| "Failed to fetch pending tokenization requests")?;

            rows.iter().map(row_to_request).collect()
        })
    }

    fn transition_to_minting(&self, id: &RequestId) -> Result<Transition, StoreError> {
        self.rt.block_on(async {
            let result = sqlx::query(sql::CLAIM_FOR_MINTING)
                .bind(Utc::now().timestamp_millis())
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to claim {}", id))?;

            Ok(transition_from_rows(result.rows_affected()))
        })
    }

    fn record_transaction_id(
        &self,
        id: &RequestId,
        transaction_id: &TransactionId,
    ) -> Result<Transition, StoreError> {
        self.rt.block_on(self.append_transaction(id, transaction_id))
    }

    fn transition_to_completed(
        &self,
        id: &RequestId,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError> {
        self.rt
            .block_on(self.settle(id, transaction_ids, Settlement::Completed))
    }

    fn transition_to_failed(
        &self,
        id: &RequestId,
        reason: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError> {
        self.rt
            .block_on(self.settle(id, transaction_ids, Settlement::Failed(reason)))
    }

    fn lookup_evaluation_with_wallet(
        &self,
        evaluation_id: &EvaluationId,
    ) -> Result<EvaluationLookup, StoreError> {
        self.rt.block_on(async {
            let row = sqlx::query(sql::LOOKUP_EVALUATION)
                .bind(evaluation_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to look up evaluation {}", evaluation_id))?;

            let Some(row) = row else {
                return Ok(EvaluationLookup::NotFound);
            };

            let estimated_value: i64 = row.get("estimated_value");
            let estimated_value = u64::try_from(estimated_value).map_err(|_| {
                StoreError::Corrupt(format!(
                    "evaluation {} has negative estimated value {}",
                    evaluation_id, estimated_value
                ))
            })?;
            let harvest_date: Option<i64> = row.get("harvest_date");

            Ok(EvaluationLookup::Found(CropEvaluation {
                evaluation_id: EvaluationId::new(row.get::<String, _>("id")),
                farmer_id: UserId::new(row.get::<String, _>("farmer_id")),
                crop_type: row.get("crop_type"),
                estimated_value,
                harvest_date: harvest_date.map(from_millis).transpose()?,
                wallet_address: row.get("wallet_address"),
            }))
        })
    }

    fn get(&self, id: &RequestId) -> Result<Option<TokenizationRequest>, StoreError> {
        self.rt.block_on(async {
            let query = format!(
                "SELECT {} FROM tokenization_requests WHERE id = ?",
                sql::REQUEST_COLUMNS
            );
            let row = sqlx::query(&query)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to fetch request {}", id))?;

            row.as_ref().map(row_to_request).transpose()
        })
    }

    fn fail_interrupted(&self, reason: &str) -> Result<Vec<TokenizationRequest>, StoreError> {
        self.rt.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .with_context(|| "Failed to start database transaction")?;

            let rows = sqlx::query(sql::SELECT_ALL_MINTING)
                .fetch_all(&mut *tx)
                .await
                .with_context(|| "Failed to fetch interrupted requests")?;

            let mut interrupted = rows
                .iter()
                .map(row_to_request)
                .collect::<Result<Vec<_>, _>>()?;

            if interrupted.is_empty() {
                return Ok(interrupted);
            }

            sqlx::query(sql::FAIL_ALL_MINTING)
                .bind(reason)
                .execute(&mut *tx)
                .await
                .with_context(|| "Failed to fail interrupted requests")?;

            tx.commit()
                .await
                .with_context(|| "Failed to commit transaction")?;

            for request in &mut interrupted {
                request.status = RequestStatus::Failed;
                request.error_message = Some(reason.to_string());
            }
            Ok(interrupted)
        })
    }
}

impl NotificationSink for SqliteRecordStore {
    fn publish(&self, notification: &NotificationRecord) -> Result<(), StoreError> {
        self.rt.block_on(async {
            sqlx::query(sql::INSERT_NOTIFICATION)
                .bind(&notification.id)
                .bind(notification.user_id.as_str())
                .bind(notification.kind.as_str())
                .bind(&notification.message)
                .bind(serde_json::to_string(&notification.metadata)?)
                .bind(notification.created_at.timestamp_millis())
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to store notification {}", notification.id))?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}

fn transition_from_rows(rows_affected: u64) -> Transition {
    if rows_affected == 1 {
        Transition::Applied
    } else {
        Transition::Stale
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", millis)))
}

fn decode_transaction_ids(raw: &str) -> Result<Vec<TransactionId>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

/// Convert a `tokenization_requests` row to a request
fn row_to_request(row: &SqliteRow) -> Result<TokenizationRequest, StoreError> {
    let status: String = row.get("status");
    let status = RequestStatus::from_str(&status).map_err(StoreError::Corrupt)?;
    let attempts: i64 = row.get("attempts");
    let claimed_at: Option<i64> = row.get("claimed_at");
    let completed_at: Option<i64> = row.get("completed_at");

    Ok(TokenizationRequest {
        id: RequestId::new(row.get::<String, _>("id")),
        evaluation_id: EvaluationId::new(row.get::<String, _>("evaluation_id")),
        status,
        transaction_ids: decode_transaction_ids(&row.get::<String, _>("transaction_ids"))?,
        error_message: row.get("error_message"),
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::Corrupt(format!("invalid attempt count {}", attempts)))?,
        claimed_at: claimed_at.map(from_millis).transpose()?,
        completed_at: completed_at.map(from_millis).transpose()?,
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn row_to_notification(row: &SqliteRow) -> Result<NotificationRecord, StoreError> {
    let kind: String = row.get("type");
    let metadata: String = row.get("metadata");

    Ok(NotificationRecord {
        id: row.get("id"),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        message: row.get("message"),
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_millis(row.get("created_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cropmint_core::objects::NotificationKind;
    use tempfile::TempDir;

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap(),
        )
    }

    fn open_store() -> (TempDir, SqliteRecordStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("queue.db").display());
        let store = SqliteRecordStore::new(&url, test_runtime()).unwrap();
        (dir, store)
    }

    fn evaluation(id: &str, wallet: Option<&str>) -> CropEvaluation {
        CropEvaluation {
            evaluation_id: EvaluationId::new(id),
            farmer_id: UserId::new(format!("farmer-{}", id)),
            crop_type: "cafe".to_string(),
            estimated_value: 4000,
            harvest_date: None,
            wallet_address: wallet.map(str::to_string),
        }
    }

    fn tx(n: u32) -> TransactionId {
        TransactionId::new(format!("0.0.1001@1700000000.{:09}", n))
    }

    #[test]
    fn test_enqueue_is_idempotent_per_evaluation() {
        let (_dir, store) = open_store();

        let first = store.enqueue(&EvaluationId::new("eval-1")).unwrap();
        let second = store.enqueue(&EvaluationId::new("eval-1")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, RequestStatus::Pending);
        assert!(first.transaction_ids.is_empty());
        assert_eq!(first.attempts, 0);
        assert_eq!(store.claim_next_batch(10).unwrap().len(), 1);
    }

    #[test]
    fn test_batch_is_oldest_first_and_bounded() {
        let (_dir, store) = open_store();
        let base = Utc::now();

        // Inserted newest first so that insertion order differs from creation order
        for i in (0..5).rev() {
            store
                .enqueue_at(
                    &EvaluationId::new(format!("eval-{}", i)),
                    base + ChronoDuration::seconds(i),
                )
                .unwrap();
        }

        let batch = store.claim_next_batch(3).unwrap();
        let evaluations: Vec<_> = batch.iter().map(|r| r.evaluation_id.as_str()).collect();
        assert_eq!(evaluations, vec!["eval-0", "eval-1", "eval-2"]);

        // Fetching does not change status
        assert!(batch.iter().all(|r| r.status == RequestStatus::Pending));
        assert_eq!(store.claim_next_batch(10).unwrap().len(), 5);
    }

    #[test]
    fn test_minting_transition_is_conditional() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();

        assert_eq!(store.transition_to_minting(&request.id).unwrap(), Transition::Applied);
        assert_eq!(store.transition_to_minting(&request.id).unwrap(), Transition::Stale);

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Minting);
        assert_eq!(stored.attempts, 1);
        assert!(stored.claimed_at.is_some());

        // Claimed records leave the pending batch
        assert!(store.claim_next_batch(10).unwrap().is_empty());
        assert_eq!(
            store.transition_to_minting(&RequestId::new("missing")).unwrap(),
            Transition::Stale
        );
    }

    #[test]
    fn test_complete_records_transactions_and_clears_error() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();
        store.transition_to_minting(&request.id).unwrap();

        assert_eq!(
            store.record_transaction_id(&request.id, &tx(1)).unwrap(),
            Transition::Applied
        );
        assert_eq!(
            store
                .transition_to_completed(&request.id, &[tx(1), tx(2)])
                .unwrap(),
            Transition::Applied
        );

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Completed);
        assert_eq!(stored.transaction_ids, vec![tx(1), tx(2)]);
        assert!(stored.error_message.is_none());
        assert!(stored.completed_at.is_some());

        // Terminal records accept no further transitions
        assert_eq!(store.transition_to_failed(&request.id, "late", &[]).unwrap(), Transition::Stale);
        assert_eq!(store.record_transaction_id(&request.id, &tx(3)).unwrap(), Transition::Stale);
    }

    #[test]
    fn test_complete_refuses_to_truncate_transactions() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();
        store.transition_to_minting(&request.id).unwrap();
        store.record_transaction_id(&request.id, &tx(1)).unwrap();

        let result = store.transition_to_completed(&request.id, &[tx(2)]);
        assert!(matches!(result, Err(StoreError::Corrupt(_))));

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Minting);
        assert_eq!(stored.transaction_ids, vec![tx(1)]);
    }

    #[test]
    fn test_failed_keeps_partial_transactions() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();

        // Pending records cannot fail directly
        assert_eq!(store.transition_to_failed(&request.id, "early", &[]).unwrap(), Transition::Stale);

        store.transition_to_minting(&request.id).unwrap();
        store.record_transaction_id(&request.id, &tx(1)).unwrap();
        assert_eq!(
            store
                .transition_to_failed(&request.id, "mint reverted", &[])
                .unwrap(),
            Transition::Applied
        );

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Failed);
        assert_eq!(stored.transaction_ids, vec![tx(1)]);
        assert_eq!(stored.error_message.as_deref(), Some("mint reverted"));
        assert!(stored.completed_at.is_none());
    }

    #[test]
    fn test_failed_writes_transactions_whose_append_was_lost() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();
        store.transition_to_minting(&request.id).unwrap();

        assert_eq!(
            store
                .transition_to_failed(&request.id, "mint unreachable", &[tx(1)])
                .unwrap(),
            Transition::Applied
        );

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Failed);
        assert_eq!(stored.transaction_ids, vec![tx(1)]);
    }

    #[test]
    fn test_failed_refuses_conflicting_transactions() {
        let (_dir, store) = open_store();
        let request = store.enqueue(&EvaluationId::new("eval-1")).unwrap();
        store.transition_to_minting(&request.id).unwrap();
        store.record_transaction_id(&request.id, &tx(1)).unwrap();

        let result = store.transition_to_failed(&request.id, "mint reverted", &[tx(2)]);
        assert!(matches!(result, Err(StoreError::Corrupt(_))));

        let stored = store.get(&request.id).unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Minting);
        assert_eq!(stored.transaction_ids, vec![tx(1)]);
    }

    #[test]
    fn test_lookup_distinguishes_missing_evaluation_and_wallet() {
        let (_dir, store) = open_store();
        store.upsert_evaluation(&evaluation("with-wallet", Some("0.0.789012"))).unwrap();
        store.upsert_evaluation(&evaluation("no-wallet", None)).unwrap();

        match store
            .lookup_evaluation_with_wallet(&EvaluationId::new("with-wallet"))
            .unwrap()
        {
            EvaluationLookup::Found(found) => {
                assert_eq!(found.estimated_value, 4000);
                assert_eq!(found.crop_type, "cafe");
                assert_eq!(found.wallet_address.as_deref(), Some("0.0.789012"));
            }
            EvaluationLookup::NotFound => panic!("evaluation should exist"),
        }

        match store
            .lookup_evaluation_with_wallet(&EvaluationId::new("no-wallet"))
            .unwrap()
        {
            EvaluationLookup::Found(found) => assert!(found.wallet_address.is_none()),
            EvaluationLookup::NotFound => panic!("evaluation should exist"),
        }

        store
            .upsert_farmer_wallet(&UserId::new("farmer-no-wallet"), Some("0.0.42"))
            .unwrap();
        match store
            .lookup_evaluation_with_wallet(&EvaluationId::new("no-wallet"))
            .unwrap()
        {
            EvaluationLookup::Found(found) => {
                assert_eq!(found.wallet_address.as_deref(), Some("0.0.42"))
            }
            EvaluationLookup::NotFound => panic!("evaluation should exist"),
        }

        assert_eq!(
            store
                .lookup_evaluation_with_wallet(&EvaluationId::new("ghost"))
                .unwrap(),
            EvaluationLookup::NotFound
        );
    }

    #[test]
    fn test_fail_interrupted_only_touches_minting() {
        let (_dir, store) = open_store();
        let pending = store.enqueue(&EvaluationId::new("eval-pending")).unwrap();
        let stuck = store.enqueue(&EvaluationId::new("eval-stuck")).unwrap();
        let done = store.enqueue(&EvaluationId::new("eval-done")).unwrap();

        store.transition_to_minting(&stuck.id).unwrap();
        store.record_transaction_id(&stuck.id, &tx(7)).unwrap();
        store.transition_to_minting(&done.id).unwrap();
        store.transition_to_completed(&done.id, &[tx(8), tx(9)]).unwrap();

        let failed = store.fail_interrupted("worker interrupted").unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, stuck.id);
        assert_eq!(failed[0].status, RequestStatus::Failed);
        assert_eq!(failed[0].transaction_ids, vec![tx(7)]);

        assert_eq!(store.get(&pending.id).unwrap().unwrap().status, RequestStatus::Pending);
        assert_eq!(store.get(&done.id).unwrap().unwrap().status, RequestStatus::Completed);
        assert!(store.fail_interrupted("again").unwrap().is_empty());
    }

    #[test]
    fn test_notifications_round_trip_metadata() {
        let (_dir, store) = open_store();
        let user = UserId::new("farmer-1");
        let notification = NotificationRecord {
            id: "n-1".to_string(),
            user_id: user.clone(),
            kind: NotificationKind::TokenizationCompleted,
            message: "4000 tokens issued".to_string(),
            metadata: serde_json::json!({ "evaluationId": "eval-1", "tokenAmount": 4000 }),
            created_at: Utc::now(),
        };

        store.publish(&notification).unwrap();

        let stored = store.notifications_for(&user).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::TokenizationCompleted);
        assert_eq!(stored[0].metadata["tokenAmount"], 4000);
        assert!(store.notifications_for(&UserId::new("other")).unwrap().is_empty());
    }
}
