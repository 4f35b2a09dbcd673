//! In-process implementation of [`Store`].
//!
//! Each collection is a `BTreeMap` ordered by identifier behind its own async
//! mutex, so every operation on a collection is trivially atomic. Primarily
//! used for tests and for embedding a queue inside a single process.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use tokio::sync::Mutex;

use crate::message::{MessageDocument, MessageId, NewDocument};

use super::{BoxFuture, Filter, IndexSpec, Store, StoreError, Update};

#[derive(Default)]
struct Collection {
    documents: BTreeMap<MessageId, MessageDocument>,
    indexes: HashSet<IndexSpec>,
    last_id: i64,
}

impl Collection {
    /// Refuses an update whose ack token is already held by another document
    /// while the unique ack index exists.
    fn check_unique_ack(&self, id: MessageId, update: &Update) -> Result<(), StoreError> {
        let Some(ack) = &update.ack else {
            return Ok(());
        };
        if !self.indexes.contains(&IndexSpec::UniqueAck) {
            return Ok(());
        }

        let taken = self
            .documents
            .values()
            .any(|doc| doc.id != id && doc.ack.as_deref() == Some(ack.as_str()));

        if taken {
            return Err(StoreError::DuplicateKey {
                index: IndexSpec::UniqueAck.name().to_owned(),
            });
        }
        Ok(())
    }
}

/// Thread-safe in-memory document store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<papaya::HashMap<String, Arc<Mutex<Collection>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collection, creating it on first write.
    fn collection(&self, name: &str) -> Arc<Mutex<Collection>> {
        self.collections
            .pin()
            .get_or_insert_with(name.to_owned(), || Arc::new(Mutex::new(Collection::default())))
            .clone()
    }

    /// Returns the collection if anything was ever written to it.
    fn existing(&self, name: &str) -> Option<Arc<Mutex<Collection>>> {
        self.collections.pin().get(name).cloned()
    }

    /// Names of the indexes created on a collection.
    pub async fn indexes(&self, collection: &str) -> Vec<&'static str> {
        let Some(collection) = self.existing(collection) else {
            return Vec::new();
        };
        let guard = collection.lock().await;
        let mut names: Vec<_> = guard.indexes.iter().map(|index| index.name()).collect();
        names.sort_unstable();
        names
    }
}

impl Store for MemoryStore {
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        documents: Vec<NewDocument>,
    ) -> BoxFuture<'a, Result<Vec<MessageId>, StoreError>> {
        Box::pin(async move {
            let collection = self.collection(collection);
            let mut guard = collection.lock().await;

            let mut ids = Vec::with_capacity(documents.len());
            for document in documents {
                guard.last_id += 1;
                let id = MessageId(guard.last_id);

                guard.documents.insert(
                    id,
                    MessageDocument {
                        id,
                        payload: document.payload,
                        visible_at: document.visible_at,
                        ack: None,
                        tries: 0,
                        deleted_at: None,
                        error: None,
                    },
                );
                ids.push(id);
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
            let Some(collection) = self.existing(collection) else {
                return Ok(None);
            };
            let mut guard = collection.lock().await;

            let Some(id) = guard
                .documents
                .values()
                .find(|doc| filter.matches(doc))
                .map(|doc| doc.id)
            else {
                return Ok(None);
            };

            guard.check_unique_ack(id, &update)?;

            let Some(document) = guard.documents.get_mut(&id) else {
                return Ok(None);
            };
            update.apply(document);

            Ok(Some(document.clone()))
        })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let Some(collection) = self.existing(collection) else {
                return Ok(0);
            };
            let mut guard = collection.lock().await;

            let before = guard.documents.len();
            guard.documents.retain(|_, doc| !filter.matches(doc));

            Ok((before - guard.documents.len()) as u64)
        })
    }

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let Some(collection) = self.existing(collection) else {
                return Ok(0);
            };
            let guard = collection.lock().await;

            Ok(guard
                .documents
                .values()
                .filter(|doc| filter.matches(doc))
                .count() as u64)
        })
    }

    fn create_index<'a>(
        &'a self,
        collection: &'a str,
        index: IndexSpec,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let collection = self.collection(collection);
            let mut guard = collection.lock().await;

            if index == IndexSpec::UniqueAck {
                let mut seen = HashSet::new();
                let duplicated = guard
                    .documents
                    .values()
                    .filter_map(|doc| doc.ack.as_deref())
                    .any(|ack| !seen.insert(ack));
                if duplicated {
                    return Err(StoreError::DuplicateKey {
                        index: index.name().to_owned(),
                    });
                }
            }

            guard.indexes.insert(index);
            Ok(())
        })
    }
}
