//! Document store abstraction.
//!
//! The queue never talks to a database directly. It needs exactly five
//! operations from its backing store, and every correctness guarantee it makes
//! rests on one of them: [`Store::find_one_and_update`] must select and mutate a
//! single document atomically.
//!
//! Filters and updates are typed values covering the predicates and mutations
//! the lease protocol uses, so every backend can translate them natively.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use snafu::Snafu;

use crate::message::{MessageDocument, MessageId, NewDocument};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    /// A write would have broken a unique index.
    #[snafu(display("Duplicate key violates unique index {index}"))]
    DuplicateKey { index: String },

    #[snafu(display("Malformed document: {message}"))]
    Malformed { message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(source: sqlx::Error) -> Self {
        if let sqlx::Error::Database(e) = &source {
            if e.is_unique_violation() {
                return Self::DuplicateKey {
                    index: e.message().to_owned(),
                };
            }
        }
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

/// Indexes the queue asks its store to maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSpec {
    /// Compound `(deleted_at, visible_at)` index backing availability scans.
    Availability,
    /// Unique index over documents that carry an ack token. Two live leases
    /// can never share a token because the store refuses the second write.
    UniqueAck,
}

impl IndexSpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Availability => "messages_availability",
            Self::UniqueAck => "messages_ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisibleAt {
    AtOrBefore(DateTime<Utc>),
    After(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckFilter {
    Present,
    Equals(String),
}

/// Conjunction of optional predicates. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// `Some(true)` matches done documents, `Some(false)` live ones.
    pub deleted: Option<bool>,
    pub visible_at: Option<VisibleAt>,
    pub ack: Option<AckFilter>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Claimable messages: live and visible.
    pub fn available(now: DateTime<Utc>) -> Self {
        Self {
            deleted: Some(false),
            visible_at: Some(VisibleAt::AtOrBefore(now)),
            ack: None,
        }
    }

    /// Messages held under an unexpired lease.
    pub fn leased(now: DateTime<Utc>) -> Self {
        Self {
            deleted: Some(false),
            visible_at: Some(VisibleAt::After(now)),
            ack: Some(AckFilter::Present),
        }
    }

    /// The one message whose live lease is proven by `ack`.
    pub fn lease(ack: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            deleted: Some(false),
            visible_at: Some(VisibleAt::After(now)),
            ack: Some(AckFilter::Equals(ack.into())),
        }
    }

    pub fn done() -> Self {
        Self {
            deleted: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, document: &MessageDocument) -> bool {
        if let Some(deleted) = self.deleted {
            if document.deleted_at.is_some() != deleted {
                return false;
            }
        }

        match &self.visible_at {
            Some(VisibleAt::AtOrBefore(t)) if document.visible_at > *t => return false,
            Some(VisibleAt::After(t)) if document.visible_at <= *t => return false,
            _ => {}
        }

        match &self.ack {
            Some(AckFilter::Present) => document.ack.is_some(),
            Some(AckFilter::Equals(ack)) => document.ack.as_deref() == Some(ack.as_str()),
            None => true,
        }
    }
}

/// Field assignments applied to a matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub visible_at: Option<DateTime<Utc>>,
    pub ack: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub increment_tries: bool,
}

impl Update {
    /// Lease a message: new token, new visibility deadline, one more try.
    pub fn claim(ack: impl Into<String>, visible_at: DateTime<Utc>) -> Self {
        Self {
            visible_at: Some(visible_at),
            ack: Some(ack.into()),
            increment_tries: true,
            ..Self::default()
        }
    }

    pub fn extend(visible_at: DateTime<Utc>) -> Self {
        Self {
            visible_at: Some(visible_at),
            ..Self::default()
        }
    }

    pub fn delete(deleted_at: DateTime<Utc>, error: Option<String>) -> Self {
        Self {
            deleted_at: Some(deleted_at),
            error,
            ..Self::default()
        }
    }

    pub fn apply(&self, document: &mut MessageDocument) {
        if let Some(visible_at) = self.visible_at {
            document.visible_at = visible_at;
        }
        if let Some(ack) = &self.ack {
            document.ack = Some(ack.clone());
        }
        if let Some(deleted_at) = self.deleted_at {
            document.deleted_at = Some(deleted_at);
        }
        if let Some(error) = &self.error {
            document.error = Some(error.clone());
        }
        if self.increment_tries {
            document.tries = document.tries.saturating_add(1);
        }
    }
}

/// The operations a backing store must provide.
///
/// Implementations may be shared by any number of queues; each queue addresses
/// its own collection by name.
pub trait Store: Send + Sync + 'static {
    /// Inserts documents in order and returns their assigned identifiers in the
    /// same order. Not atomic across the batch: on failure, a prefix of the
    /// documents may already be stored.
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        documents: Vec<NewDocument>,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, StoreError>>;

    /// Atomically selects the matching document with the smallest identifier,
    /// applies `update` to it and returns the updated document.
    ///
    /// # Important
    /// Selection and mutation must be one indivisible operation. Two concurrent
    /// callers must never both observe the same document as matching.
    fn find_one_and_update<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'a, Result<Option<MessageDocument>, StoreError>>;

    /// Permanently removes every matching document, returning how many.
    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Creates an index. Creating an index that already exists is a no-op.
    fn create_index<'a>(
        &'a self,
        collection: &'a str,
        index: IndexSpec,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}
