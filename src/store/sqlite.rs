//! SQLite implementation of [`Store`].
//!
//! All collections share one `messages` table, partitioned by a `collection`
//! column. Timestamps are stored as Unix milliseconds so that range predicates
//! compare integers.
//!
//! # Atomicity
//! A claim is a single `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING`
//! statement. SQLite runs it inside one write transaction, so the selection and
//! the mutation cannot interleave with another writer.

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    FromRow, QueryBuilder, Sqlite, SqlitePool,
};

use crate::{
    config::Config,
    message::{MessageDocument, MessageId, NewDocument},
};

use super::{AckFilter, BoxFuture, Filter, IndexSpec, Store, StoreError, Update, VisibleAt};

const RETURNING: &str = " RETURNING id, payload, visible_at, ack, tries, deleted_at, error";

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    payload: Json<serde_json::Value>,
    visible_at: i64,
    ack: Option<String>,
    tries: i64,
    deleted_at: Option<i64>,
    error: Option<String>,
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Malformed {
        message: format!("timestamp {millis} out of range"),
    })
}

impl TryFrom<MessageRow> for MessageDocument {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: MessageId(row.id),
            payload: row.payload.0,
            visible_at: from_millis(row.visible_at)?,
            ack: row.ack,
            tries: u32::try_from(row.tries).map_err(|_| StoreError::Malformed {
                message: format!("tries {} out of range", row.tries),
            })?,
            deleted_at: row.deleted_at.map(from_millis).transpose()?,
            error: row.error,
        })
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, collection: &str, filter: &Filter) {
    qb.push(" WHERE collection = ").push_bind(collection.to_owned());

    match filter.deleted {
        Some(true) => {
            qb.push(" AND deleted_at IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND deleted_at IS NULL");
        }
        None => {}
    }

    match &filter.visible_at {
        Some(VisibleAt::AtOrBefore(t)) => {
            qb.push(" AND visible_at <= ").push_bind(t.timestamp_millis());
        }
        Some(VisibleAt::After(t)) => {
            qb.push(" AND visible_at > ").push_bind(t.timestamp_millis());
        }
        None => {}
    }

    match &filter.ack {
        Some(AckFilter::Present) => {
            qb.push(" AND ack IS NOT NULL");
        }
        Some(AckFilter::Equals(ack)) => {
            qb.push(" AND ack = ").push_bind(ack.clone());
        }
        None => {}
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Sqlite>, update: &Update) {
    let mut sets = qb.separated(", ");
    // Keeps the statement valid when the update assigns nothing.
    sets.push("id = id");

    if let Some(visible_at) = update.visible_at {
        sets.push("visible_at = ")
            .push_bind_unseparated(visible_at.timestamp_millis());
    }
    if let Some(ack) = &update.ack {
        sets.push("ack = ").push_bind_unseparated(ack.clone());
    }
    if let Some(deleted_at) = update.deleted_at {
        sets.push("deleted_at = ")
            .push_bind_unseparated(deleted_at.timestamp_millis());
    }
    if let Some(error) = &update.error {
        sets.push("error = ").push_bind_unseparated(error.clone());
    }
    if update.increment_tries {
        sets.push("tries = tries + 1");
    }
}

/// A document store backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database file named by the config.
    pub async fn connect_with(config: &Config) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::from_pool(pool).await
    }

    /// A private in-memory database.
    ///
    /// Each SQLite connection to `:memory:` sees its own database, so the pool
    /// is pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new().in_memory(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Store for SqliteStore {
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        documents: Vec<NewDocument>,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, StoreError>> {
        Box::pin(async move {
            let mut ids = Vec::with_capacity(documents.len());

            // One statement per document, outside a transaction: a failure
            // leaves the already inserted prefix in place.
            for document in documents {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO messages (collection, payload, visible_at) VALUES ($1, $2, $3) RETURNING id",
                )
                .bind(collection)
                .bind(Json(document.payload))
                .bind(document.visible_at.timestamp_millis())
                .fetch_one(&self.pool)
                .await?;

                ids.push(MessageId(id));
            }

            Ok(ids)
        })
    }

    fn find_one_and_update<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'a, Result<Option<MessageDocument>, StoreError>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET ");
            push_update(&mut qb, &update);
            qb.push(" WHERE id = (SELECT id FROM messages");
            push_filter(&mut qb, collection, &filter);
            qb.push(" ORDER BY id LIMIT 1)");
            qb.push(RETURNING);

            let row = qb
                .build_query_as::<MessageRow>()
                .fetch_optional(&self.pool)
                .await?;

            row.map(MessageDocument::try_from).transpose()
        })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM messages");
            push_filter(&mut qb, collection, &filter);

            let result = qb.build().execute(&self.pool).await?;

            Ok(result.rows_affected())
        })
    }

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM messages");
            push_filter(&mut qb, collection, &filter);

            let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

            Ok(count as u64)
        })
    }

    fn create_index<'a>(
        &'a self,
        _collection: &'a str,
        index: IndexSpec,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            // Indexes lead with the collection column, so one index per kind
            // serves every queue in the table.
            let sql = match index {
                IndexSpec::Availability => {
                    "CREATE INDEX IF NOT EXISTS messages_availability \
                     ON messages (collection, deleted_at, visible_at)"
                }
                IndexSpec::UniqueAck => {
                    "CREATE UNIQUE INDEX IF NOT EXISTS messages_ack \
                     ON messages (collection, ack) WHERE ack IS NOT NULL"
                }
            };

            sqlx::query(sql).execute(&self.pool).await?;

            Ok(())
        })
    }
}
