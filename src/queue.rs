//! The queue: a lease protocol over a collection of message documents.
//!
//! A [`Queue`] holds nothing but configuration. Every decision is re-derived
//! from the store on each call, so any number of processes may produce to and
//! consume from the same collection.
//!
//! # Lifecycle
//!
//! ```text
//! available --get--> leased --ack--> done
//!     ^                |  ^
//!     +-- lease lapses-+  +-- ping
//! ```
//!
//! With a dead-letter queue configured, a claim that pushes `tries` past
//! `max_retries` forwards the message to the dead queue and acknowledges it
//! instead of handing it to the consumer.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::{DEFAULT_MAX_RETRIES, DEFAULT_VISIBILITY_SECS},
    error::Error,
    message::{DeadLetter, Message, MessageDocument, NewDocument},
    store::{Filter, IndexSpec, Store, StoreError, Update},
};

/// When a newly added message becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    /// Relative to the moment of insertion.
    For(Duration),
    /// At an absolute instant.
    Until(DateTime<Utc>),
}

impl From<Duration> for Delay {
    fn from(delay: Duration) -> Self {
        Self::For(delay)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(instant: DateTime<Utc>) -> Self {
        Self::Until(instant)
    }
}

#[derive(Debug, Clone, Default, bon::Builder)]
pub struct AddOptions {
    /// Overrides the queue's default delay.
    #[builder(into)]
    pub delay: Option<Delay>,
}

#[derive(Debug, Clone, Default, bon::Builder)]
pub struct GetOptions {
    /// Overrides the queue's visibility window for this lease.
    pub visibility: Option<Duration>,
}

#[derive(Debug, Clone, Default, bon::Builder)]
pub struct PingOptions {
    /// Overrides the queue's visibility window for the extension.
    pub visibility: Option<Duration>,
}

/// Message counts of a queue at one instant.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total: u64,
    pub size: u64,
    pub in_flight: u64,
    pub done: u64,
}

/// A lease of zero length would lapse the instant it was granted.
fn check_visibility(visibility: Duration) -> Result<Duration, Error> {
    if visibility.is_zero() {
        return Err(Error::validation("visibility must be greater than zero"));
    }
    Ok(visibility)
}

fn offset(now: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, Error> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .ok_or_else(|| Error::validation(format!("duration {by:?} out of range")))
}

/// Random 16-byte token, hex encoded.
fn generate_ack() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

pub struct Queue<S> {
    store: Arc<S>,
    name: String,
    visibility: Duration,
    delay: Duration,
    dead_queue: Option<Arc<Queue<S>>>,
    max_retries: u32,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            visibility: self.visibility,
            delay: self.delay,
            dead_queue: self.dead_queue.clone(),
            max_retries: self.max_retries,
            clock: self.clock.clone(),
        }
    }
}

#[bon::bon]
impl<S: Store> Queue<S> {
    /// Returns a builder for a queue over the collection `name` in `store`.
    ///
    /// # Errors
    /// Fails with [`Error::Validation`] if `name` is blank.
    #[builder]
    pub fn new(
        store: Arc<S>,
        #[builder(into)] name: String,
        // How long a claimed message stays hidden.
        #[builder(default = Duration::from_secs(DEFAULT_VISIBILITY_SECS))] visibility: Duration,
        #[builder(default)] delay: Duration,
        dead_queue: Option<Queue<S>>,
        // Only consulted when a dead queue is configured.
        #[builder(default = DEFAULT_MAX_RETRIES)] max_retries: u32,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        if name.trim().is_empty() {
            return Err(Error::validation("queue name must not be empty"));
        }
        check_visibility(visibility)?;

        Ok(Self {
            store,
            name,
            visibility,
            delay,
            dead_queue: dead_queue.map(Arc::new),
            max_retries,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn dead_queue(&self) -> Option<&Queue<S>> {
        self.dead_queue.as_deref()
    }

    /// Ensures the indexes the lease protocol depends on. Safe to call on
    /// every startup.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn create_indexes(&self) -> Result<(), Error> {
        self.store
            .create_index(&self.name, IndexSpec::Availability)
            .await?;
        self.store
            .create_index(&self.name, IndexSpec::UniqueAck)
            .await?;

        Ok(())
    }

    pub async fn add<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, Error> {
        self.add_with(payload, AddOptions::default()).await
    }

    pub async fn add_with<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: AddOptions,
    ) -> Result<String, Error> {
        let payload = serde_json::to_value(payload)?;

        self.insert(vec![payload], options)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                StoreError::Malformed {
                    message: "store assigned no identifier".to_owned(),
                }
                .into()
            })
    }

    pub async fn add_many<T: Serialize>(&self, payloads: &[T]) -> Result<Vec<String>, Error> {
        self.add_many_with(payloads, AddOptions::default()).await
    }

    /// Adds a batch, returning identifiers in payload order.
    ///
    /// The batch is not atomic: if the store fails part-way, the messages
    /// inserted before the failure remain in the queue.
    pub async fn add_many_with<T: Serialize>(
        &self,
        payloads: &[T],
        options: AddOptions,
    ) -> Result<Vec<String>, Error> {
        if payloads.is_empty() {
            return Err(Error::validation("cannot add an empty batch"));
        }

        let payloads = payloads
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        self.insert(payloads, options).await
    }

    #[tracing::instrument(skip_all, fields(queue = %self.name, count = payloads.len()))]
    async fn insert(
        &self,
        payloads: Vec<serde_json::Value>,
        options: AddOptions,
    ) -> Result<Vec<String>, Error> {
        let now = self.clock.now();
        let visible_at = match options.delay.unwrap_or(Delay::For(self.delay)) {
            Delay::For(delay) => offset(now, delay)?,
            Delay::Until(instant) => instant,
        };

        let documents = payloads
            .into_iter()
            .map(|payload| NewDocument {
                payload,
                visible_at,
            })
            .collect();

        let ids = self.store.insert_many(&self.name, documents).await?;

        debug!(%visible_at, "added messages");

        Ok(ids.into_iter().map(|id| id.to_string()).collect())
    }

    pub async fn get<T: DeserializeOwned>(&self) -> Result<Option<Message<T>>, Error> {
        self.get_with(GetOptions::default()).await
    }

    /// Leases the oldest available message.
    ///
    /// Returns `None` when nothing is available. Messages that exhaust their
    /// retry budget are forwarded to the dead queue and skipped; the loop ends
    /// once a live message is claimed or the queue runs dry, and each skipped
    /// message is acknowledged, so it runs at most once per backlog entry.
    ///
    /// A payload that fails to deserialize into `T` is reported as
    /// [`Error::Payload`] while the lease stays held; the message reappears
    /// when the lease lapses.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        options: GetOptions,
    ) -> Result<Option<Message<T>>, Error> {
        let visibility = check_visibility(options.visibility.unwrap_or(self.visibility))?;

        loop {
            let now = self.clock.now();
            let update = Update::claim(generate_ack(), offset(now, visibility)?);

            let Some(document) = self
                .store
                .find_one_and_update(&self.name, Filter::available(now), update)
                .await?
            else {
                return Ok(None);
            };

            if let Some(dead_queue) = &self.dead_queue {
                if document.tries > self.max_retries {
                    self.forward(dead_queue, document).await?;
                    continue;
                }
            }

            debug!(id = %document.id, tries = document.tries, "leased message");

            return Message::from_document(document)?.decode().map(Some);
        }
    }

    /// Hands an exhausted message to the dead queue, then acknowledges it here.
    ///
    /// If the forward fails the original keeps its lease and will be claimed
    /// (and forwarded) again once the lease lapses.
    async fn forward(&self, dead_queue: &Queue<S>, document: MessageDocument) -> Result<(), Error> {
        let letter: DeadLetter = Message::from_document(document)?;

        warn!(
            id = %letter.id,
            tries = letter.tries,
            dead_queue = %dead_queue.name,
            "retry budget exhausted, forwarding to dead queue"
        );

        dead_queue.add(&letter).await?;
        self.ack(&letter.ack).await?;

        Ok(())
    }

    pub async fn ping(&self, ack: &str) -> Result<String, Error> {
        self.ping_with(ack, PingOptions::default()).await
    }

    /// Extends a live lease by the visibility window, measured from now.
    /// The message's `tries` is left as it is.
    ///
    /// # Errors
    /// [`Error::UnidentifiedAck`] if `ack` does not name an unexpired lease.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn ping_with(&self, ack: &str, options: PingOptions) -> Result<String, Error> {
        let now = self.clock.now();
        let visibility = check_visibility(options.visibility.unwrap_or(self.visibility))?;
        let visible_at = offset(now, visibility)?;

        let document = self
            .store
            .find_one_and_update(&self.name, Filter::lease(ack, now), Update::extend(visible_at))
            .await?
            .ok_or_else(|| Error::unidentified_ack(ack))?;

        debug!(id = %document.id, %visible_at, "extended lease");

        Ok(document.id.to_string())
    }

    /// Marks a leased message as done.
    ///
    /// # Errors
    /// [`Error::UnidentifiedAck`] if `ack` does not name an unexpired lease.
    /// Acknowledging after the lease lapsed is refused because the message may
    /// already belong to another consumer.
    pub async fn ack(&self, ack: &str) -> Result<String, Error> {
        self.complete(ack, None).await
    }

    /// Like [`Queue::ack`], also recording an error description on the message.
    pub async fn ack_with_error(
        &self,
        ack: &str,
        error: impl Into<String>,
    ) -> Result<String, Error> {
        self.complete(ack, Some(error.into())).await
    }

    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    async fn complete(&self, ack: &str, error: Option<String>) -> Result<String, Error> {
        let now = self.clock.now();

        let document = self
            .store
            .find_one_and_update(&self.name, Filter::lease(ack, now), Update::delete(now, error))
            .await?
            .ok_or_else(|| Error::unidentified_ack(ack))?;

        debug!(id = %document.id, "acknowledged message");

        Ok(document.id.to_string())
    }

    /// Number of messages in any state.
    pub async fn total(&self) -> Result<u64, Error> {
        Ok(self.store.count(&self.name, Filter::all()).await?)
    }

    /// Number of messages available to `get` right now.
    pub async fn size(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        Ok(self.store.count(&self.name, Filter::available(now)).await?)
    }

    /// Number of messages held under an unexpired lease.
    pub async fn in_flight(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        Ok(self.store.count(&self.name, Filter::leased(now)).await?)
    }

    /// Number of acknowledged messages not yet purged.
    pub async fn done(&self) -> Result<u64, Error> {
        Ok(self.store.count(&self.name, Filter::done()).await?)
    }

    /// Permanently removes acknowledged messages, returning how many.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn clean(&self) -> Result<u64, Error> {
        let removed = self.store.delete_many(&self.name, Filter::done()).await?;

        debug!(removed, "purged acknowledged messages");

        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        Ok(QueueStats {
            total: self.total().await?,
            size: self.size().await?,
            in_flight: self.in_flight().await?,
            done: self.done().await?,
        })
    }
}
