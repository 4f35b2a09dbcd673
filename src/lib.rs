//! A brokerless message queue built on a document store's atomic
//! find-and-modify.
//!
//! Producers [`add`](Queue::add) payloads. Consumers [`get`](Queue::get) one
//! message at a time, which leases it: the message is hidden from other
//! consumers for a visibility window and comes with an ack token. The consumer
//! then [`ack`](Queue::ack)s it, [`ping`](Queue::ping)s to extend the lease, or
//! lets the lease lapse so the message is redelivered.
//!
//! Delivery is at-least-once, with at most one holder per lease window.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use leasemq::{MemoryStore, Queue};
//!
//! # async fn run() -> Result<(), leasemq::Error> {
//! let queue = Queue::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .name("emails")
//!     .build()?;
//! queue.create_indexes().await?;
//!
//! queue.add("Hello, World!").await?;
//!
//! if let Some(message) = queue.get::<String>().await? {
//!     println!("{}", message.payload);
//!     queue.ack(&message.ack).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::Error;
pub use message::{DeadLetter, Message, MessageId};
pub use queue::{AddOptions, Delay, GetOptions, PingOptions, Queue, QueueStats};
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
