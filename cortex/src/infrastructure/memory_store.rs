// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory memory event store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::{CortexError, Embedding, Fingerprint, MemoryEvent, MemoryEventId};
use crate::infrastructure::repository::{MemoryFilter, MemoryRepository};

#[derive(Default)]
struct Store {
    events: Vec<MemoryEvent>,
    by_id: HashMap<MemoryEventId, usize>,
    by_fingerprint: HashMap<Fingerprint, MemoryEventId>,
}

/// In-memory implementation of MemoryRepository.
/// Retains events for the lifetime of the process.
pub struct InMemoryMemoryRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryMemoryRepository {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
        }
    }
}

impl Default for InMemoryMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryRepository for InMemoryMemoryRepository {
    async fn insert(&self, event: MemoryEvent) -> Result<MemoryEventId, CortexError> {
        let mut store = self.store.write().await;

        if let Some(existing) = store.by_fingerprint.get(&event.fingerprint) {
            return Ok(*existing);
        }

        let id = event.id;
        let index = store.events.len();
        store.by_fingerprint.insert(event.fingerprint.clone(), id);
        store.by_id.insert(id, index);
        store.events.push(event);
        Ok(id)
    }

    async fn query(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEvent>, CortexError> {
        let store = self.store.read().await;
        let matching = store.events.iter().filter(|e| filter.matches(e)).cloned();

        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn find_by_id(&self, id: MemoryEventId) -> Result<Option<MemoryEvent>, CortexError> {
        let store = self.store.read().await;
        Ok(store.by_id.get(&id).map(|&i| store.events[i].clone()))
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<MemoryEvent>, CortexError> {
        let store = self.store.read().await;
        Ok(store
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| store.by_id.get(id))
            .map(|&i| store.events[i].clone()))
    }

    async fn replace_embeddings(
        &self,
        embeddings: Vec<(MemoryEventId, Embedding)>,
    ) -> Result<(), CortexError> {
        let mut store = self.store.write().await;
        let positions = embeddings
            .iter()
            .map(|(id, _)| store.by_id.get(id).copied().ok_or(CortexError::NotFound(*id)))
            .collect::<Result<Vec<_>, _>>()?;

        for (index, (_, embedding)) in positions.into_iter().zip(embeddings) {
            store.events[index].embedding = embedding;
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, CortexError> {
        Ok(self.store.read().await.events.len())
    }
}
