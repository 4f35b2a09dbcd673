//! Message documents and the views handed to consumers.
//!
//! A message lives in the store as a [`MessageDocument`]. Its lifecycle state is
//! never stored explicitly; [`Filter`](crate::store::Filter) derives it from the
//! document's timestamps and ack token at a given instant:
//!
//! 1. `add` creates the document with `visible_at` = now (+ delay).
//! 2. `get` leases it: `tries` is incremented, a fresh ack token is assigned and
//!    `visible_at` moves past the visibility window.
//! 3. `ack` sets `deleted_at`, making it done. If the lease lapses instead, the
//!    message becomes available again without any sweep.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Error, store::StoreError};

/// Store-assigned identifier. Identifiers grow monotonically with insertion
/// order within a collection, which is what claims sort by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A document as the store keeps it. None of these fields leave the crate's
/// public queue API except through [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDocument {
    pub id: MessageId,
    pub payload: serde_json::Value,
    pub visible_at: DateTime<Utc>,
    pub ack: Option<String>,
    pub tries: u32,
    pub deleted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A document about to be inserted; the store assigns the identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub payload: serde_json::Value,
    pub visible_at: DateTime<Utc>,
}

/// A leased message as seen by a consumer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message<T = serde_json::Value> {
    pub id: String,
    /// Proves ownership of the lease; pass it to `ping` or `ack`.
    pub ack: String,
    pub payload: T,
    pub tries: u32,
}

/// What a dead-letter queue receives: the exhausted message, as its last
/// consumer would have seen it, wrapped as the payload.
pub type DeadLetter<T = serde_json::Value> = Message<T>;

impl Message<serde_json::Value> {
    pub(crate) fn from_document(document: MessageDocument) -> Result<Self, Error> {
        let ack = document.ack.ok_or_else(|| StoreError::Malformed {
            message: format!("leased message {} has no ack token", document.id),
        })?;

        Ok(Self {
            id: document.id.to_string(),
            ack,
            payload: document.payload,
            tries: document.tries,
        })
    }

    /// Deserializes the payload into the consumer's type.
    pub fn decode<T: serde::de::DeserializeOwned>(self) -> Result<Message<T>, Error> {
        Ok(Message {
            id: self.id,
            ack: self.ack,
            payload: serde_json::from_value(self.payload)?,
            tries: self.tries,
        })
    }
}
