//! PostgreSQL remote store

use crate::remote::{RemoteSnapshot, RemoteStore, SnapshotStream, Transaction, TransactionFn};
use crate::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANGE_CHANNEL: &str = "nuwa_document_changes";

/// PostgreSQL-backed remote document store
///
/// Documents are stored as JSON text keyed by storage path. Watchers are
/// fed from LISTEN/NOTIFY; transactions lock the rows they read.
pub struct PostgresRemoteStore {
    pool: PgPool,
}

impl PostgresRemoteStore {
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create with an existing connection pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE OR REPLACE FUNCTION nuwa_notify_document_change()
            RETURNS TRIGGER AS $$
            BEGIN
                PERFORM pg_notify('nuwa_document_changes', NEW.key);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql
            "#,
            "DROP TRIGGER IF EXISTS nuwa_document_change_trigger ON documents",
            r#"
            CREATE TRIGGER nuwa_document_change_trigger
                AFTER INSERT OR UPDATE ON documents
                FOR EACH ROW EXECUTE FUNCTION nuwa_notify_document_change()
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        Ok(())
    }

    async fn load(pool: &PgPool, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        let row = sqlx::query("SELECT data FROM documents WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(row.map(|row| text_snapshot(row.get("data"))))
    }
}

/// Snapshot whose payload is parsed when first asked for
fn text_snapshot(text: String) -> RemoteSnapshot {
    RemoteSnapshot::lazy(move || serde_json::from_str(&text).unwrap_or(Value::Null))
}

const UPSERT: &str = r#"
    INSERT INTO documents (key, data, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (key) DO UPDATE SET
        data = EXCLUDED.data,
        updated_at = NOW()
"#;

struct PgTransaction {
    txn: sqlx::Transaction<'static, Postgres>,
    writes: Vec<(String, Value)>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(RemoteSnapshot::present(value.clone())));
        }

        let row = sqlx::query("SELECT data FROM documents WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(row.map(|row| text_snapshot(row.get("data"))))
    }

    fn set(&mut self, key: &str, value: Value) {
        self.writes.push((key.to_string(), value));
    }
}

#[async_trait]
impl RemoteStore for PostgresRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        Self::load(&self.pool, key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let text = serde_json::to_string(&value)?;
        sqlx::query(UPSERT)
            .bind(key)
            .bind(text)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<SnapshotStream, StorageError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Change listener failed");
                        break;
                    }
                };
                if notification.payload() != key {
                    continue;
                }
                match Self::load(&pool, &key).await {
                    Ok(Some(snapshot)) => {
                        if tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %key, error = %e, "Failed to load changed document"),
                }
            }
            debug!(key = %key, "Change listener stopped");
        });

        Ok(rx)
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn run_transaction(&self, body: TransactionFn) -> Result<(), StorageError> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let mut handle = PgTransaction {
            txn,
            writes: Vec::new(),
        };

        {
            let staged: &mut dyn Transaction = &mut handle;
            body(staged).await?;
        }

        let PgTransaction { mut txn, writes } = handle;
        for (key, value) in writes {
            let text = serde_json::to_string(&value)?;
            sqlx::query(UPSERT)
                .bind(key)
                .bind(text)
                .execute(&mut *txn)
                .await
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        txn.commit()
            .await
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}
