// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # SemanticSearchIndex: Memory Storage & Retrieval
//!
//! Application service that embeds captured interactions and answers
//! nearest-neighbour queries over them.
//!
//! ## Deduplication
//!
//! Capture is at-least-once, so the same interaction can arrive more than
//! once. Every event is keyed by its content [`Fingerprint`]; writes to the
//! same fingerprint are serialized through a per-fingerprint lock and the
//! second writer finds the first one's record and stores nothing.
//!
//! ## Generations
//!
//! All embeddings eligible for a query share one [`IndexGeneration`]. Switching
//! embedder or dimension goes through [`SemanticSearchIndex::reindex`], which
//! re-embeds every stored event under a new generation number. Query vectors
//! of the wrong dimension are rejected rather than compared.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    CortexEvent, Embedding, Fingerprint, IndexGeneration, MemoryEvent, MemoryEventDraft,
    MemoryEventId,
};
use crate::infrastructure::{Embedder, MemoryFilter, MemoryRepository};

pub use crate::domain::CortexError;

/// Sink for cortex domain events
#[async_trait]
pub trait CortexEventPublisher: Send + Sync {
    async fn publish(&self, event: CortexEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Stored(MemoryEventId),
    Duplicate(MemoryEventId),
}

impl IndexOutcome {
    pub fn id(&self) -> MemoryEventId {
        match self {
            IndexOutcome::Stored(id) | IndexOutcome::Duplicate(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub event: MemoryEvent,
    pub similarity: f32,
}

pub struct SemanticSearchIndex {
    repository: Arc<dyn MemoryRepository>,
    embedder: RwLock<Arc<dyn Embedder>>,
    generation: RwLock<IndexGeneration>,
    write_locks: DashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>,
    // Held shared by index(), exclusively by reindex().
    rebuild_gate: tokio::sync::RwLock<()>,
    publisher: Option<Arc<dyn CortexEventPublisher>>,
}

impl SemanticSearchIndex {
    pub fn new(repository: Arc<dyn MemoryRepository>, embedder: Arc<dyn Embedder>) -> Self {
        let generation = IndexGeneration::first(embedder.name(), embedder.dimension());
        Self {
            repository,
            embedder: RwLock::new(embedder),
            generation: RwLock::new(generation),
            write_locks: DashMap::new(),
            rebuild_gate: tokio::sync::RwLock::new(()),
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn CortexEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn generation(&self) -> IndexGeneration {
        self.generation.read().clone()
    }

    pub fn repository(&self) -> Arc<dyn MemoryRepository> {
        self.repository.clone()
    }

    /// Embed and store one interaction unless its fingerprint is already stored.
    pub async fn index(&self, draft: MemoryEventDraft) -> Result<IndexOutcome, CortexError> {
        let _gate = self.rebuild_gate.read().await;
        let fingerprint = draft.fingerprint();

        let lock = self
            .write_locks
            .entry(fingerprint.clone())
            .or_default()
            .clone();
        let outcome = {
            let _guard = lock.lock().await;
            self.index_locked(draft, fingerprint.clone()).await
        };
        drop(lock);
        self.write_locks
            .remove_if(&fingerprint, |_, l| Arc::strong_count(l) == 1);

        outcome
    }

    async fn index_locked(
        &self,
        draft: MemoryEventDraft,
        fingerprint: Fingerprint,
    ) -> Result<IndexOutcome, CortexError> {
        if let Some(existing) = self.repository.find_by_fingerprint(&fingerprint).await? {
            debug!(fingerprint = %fingerprint, existing = %existing.id, "Duplicate memory event skipped");
            self.publish(CortexEvent::DuplicateSkipped {
                existing_id: existing.id,
                fingerprint,
                timestamp: Utc::now(),
            })
            .await;
            return Ok(IndexOutcome::Duplicate(existing.id));
        }

        let embedder = self.embedder.read().clone();
        let generation = self.generation();
        let vector = embedder.embed(&draft.embedding_text()).await?;
        if vector.len() != generation.dimension {
            return Err(CortexError::DimensionMismatch {
                expected: generation.dimension,
                actual: vector.len(),
            });
        }

        let request_id = draft.request_id;
        let event = MemoryEvent::new(
            draft,
            Embedding {
                generation: generation.number,
                vector,
            },
        );
        let id = self.repository.insert(event).await?;

        debug!(event_id = %id, request_id = %request_id, generation = generation.number, "Memory event indexed");
        self.publish(CortexEvent::MemoryIndexed {
            event_id: id,
            request_id,
            fingerprint,
            generation: generation.number,
            timestamp: Utc::now(),
        })
        .await;

        Ok(IndexOutcome::Stored(id))
    }

    /// Top `k` events most similar to `text`, by descending cosine similarity.
    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<SearchHit>, CortexError> {
        let embedder = self.embedder.read().clone();
        let vector = embedder.embed(text).await?;
        self.query_embedding(&vector, k).await
    }

    pub async fn query_embedding(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SearchHit>, CortexError> {
        let generation = self.generation();
        if vector.len() != generation.dimension {
            return Err(CortexError::DimensionMismatch {
                expected: generation.dimension,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .repository
            .query(&MemoryFilter {
                generation: Some(generation.number),
                ..Default::default()
            })
            .await?;

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .map(|event| {
                let similarity = cosine_similarity(vector, &event.embedding.vector);
                SearchHit { event, similarity }
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }

    /// Re-embed every stored event with `embedder` under a new generation.
    ///
    /// Blocks new writes for the duration. Every vector is computed before any
    /// is stored, and the swap is all or nothing: on error the index keeps
    /// serving the current generation unchanged. Returns the number of events
    /// moved.
    pub async fn reindex(&self, embedder: Arc<dyn Embedder>) -> Result<usize, CortexError> {
        let _gate = self.rebuild_gate.write().await;
        let next = self.generation().next(embedder.name(), embedder.dimension());
        info!(
            generation = next.number,
            embedder = %next.embedder,
            dimension = next.dimension,
            "Rebuilding semantic index"
        );

        let events = self.repository.query(&MemoryFilter::default()).await?;
        let mut embeddings = Vec::with_capacity(events.len());
        for event in &events {
            let vector = match embedder.embed(&event.content.embedding_text()).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Reindex aborted, keeping current generation");
                    return Err(e);
                }
            };
            if vector.len() != next.dimension {
                warn!(event_id = %event.id, "Embedder returned wrong dimension during reindex");
                return Err(CortexError::DimensionMismatch {
                    expected: next.dimension,
                    actual: vector.len(),
                });
            }
            embeddings.push((
                event.id,
                Embedding {
                    generation: next.number,
                    vector,
                },
            ));
        }

        let reindexed = embeddings.len();
        self.repository.replace_embeddings(embeddings).await?;

        *self.embedder.write() = embedder;
        *self.generation.write() = next.clone();

        self.publish(CortexEvent::IndexRebuilt {
            generation: next.number,
            dimension: next.dimension,
            embedder: next.embedder,
            reindexed,
            timestamp: Utc::now(),
        })
        .await;

        Ok(reindexed)
    }

    async fn publish(&self, event: CortexEvent) {
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(event).await {
                warn!(error = %e, "Failed to publish cortex event");
            }
        }
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{HashingEmbedder, InMemoryMemoryRepository};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct MockEventBus {
        events: Arc<Mutex<Vec<CortexEvent>>>,
    }

    impl MockEventBus {
        fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn get_events(&self) -> Vec<CortexEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CortexEventPublisher for MockEventBus {
        async fn publish(&self, event: CortexEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Maps known words onto fixed axes so similarities are predictable.
    struct AxisEmbedder {
        dimension: usize,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn name(&self) -> &str {
            "axis"
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, CortexError> {
            let mut v = vec![0.0; self.dimension];
            for (axis, word) in ["airport", "stadium", "downtown"].iter().enumerate() {
                if axis < self.dimension {
                    v[axis] = text.matches(word).count() as f32;
                }
            }
            Ok(v)
        }
    }

    fn draft(request: u128, stage: &str, response: &str) -> MemoryEventDraft {
        let mut d = MemoryEventDraft::stage_attempt(Uuid::from_u128(request), stage, 1);
        d.prompt = Some("plan".into());
        d.response = Some(response.into());
        d.success = true;
        d
    }

    fn axis_index(dimension: usize) -> SemanticSearchIndex {
        SemanticSearchIndex::new(
            Arc::new(InMemoryMemoryRepository::new()),
            Arc::new(AxisEmbedder { dimension }),
        )
    }

    #[tokio::test]
    async fn test_duplicate_submission_stores_one_record() {
        let repo = Arc::new(InMemoryMemoryRepository::new());
        let bus = Arc::new(MockEventBus::new());
        let index = SemanticSearchIndex::new(repo.clone(), Arc::new(HashingEmbedder::default()))
            .with_publisher(bus.clone());

        let first = draft(1, "strategist", "go to the airport");
        let mut redelivered = first.clone();
        redelivered.recorded_at = first.recorded_at + chrono::Duration::seconds(5);

        let a = index.index(first).await.unwrap();
        let b = index.index(redelivered).await.unwrap();

        assert!(matches!(a, IndexOutcome::Stored(_)));
        assert_eq!(b, IndexOutcome::Duplicate(a.id()));
        assert_eq!(repo.count().await.unwrap(), 1);

        let events = bus.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "memory_indexed");
        assert_eq!(events[1].event_type(), "duplicate_skipped");
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_serialize_on_fingerprint() {
        let repo = Arc::new(InMemoryMemoryRepository::new());
        let index = Arc::new(SemanticSearchIndex::new(
            repo.clone(),
            Arc::new(HashingEmbedder::default()),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index.index(draft(7, "briefer", "stadium traffic")).await
            }));
        }
        let mut stored = 0;
        for handle in handles {
            if let IndexOutcome::Stored(_) = handle.await.unwrap().unwrap() {
                stored += 1;
            }
        }

        assert_eq!(stored, 1);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert!(index.write_locks.is_empty());
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity_and_caps_at_k() {
        let index = axis_index(3);
        index.index(draft(1, "strategist", "airport")).await.unwrap();
        index.index(draft(2, "strategist", "airport airport stadium")).await.unwrap();
        index.index(draft(3, "strategist", "downtown")).await.unwrap();
        index.index(draft(4, "strategist", "stadium")).await.unwrap();

        let hits = index.query("airport", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].event.content.response.as_deref(), Some("airport"));
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);

        let all = index.query("airport", 10).await.unwrap();
        assert_eq!(all.len(), 4);
        for pair in all.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[tokio::test]
    async fn test_query_rejects_mismatched_dimension() {
        let index = axis_index(3);
        let err = index.query_embedding(&[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(
            err,
            CortexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_reindex_moves_every_event_to_new_generation() {
        let repo = Arc::new(InMemoryMemoryRepository::new());
        let bus = Arc::new(MockEventBus::new());
        let index = SemanticSearchIndex::new(repo.clone(), Arc::new(AxisEmbedder { dimension: 3 }))
            .with_publisher(bus.clone());
        index.index(draft(1, "strategist", "airport")).await.unwrap();
        index.index(draft(2, "briefer", "stadium")).await.unwrap();

        let moved = index
            .reindex(Arc::new(HashingEmbedder::new(64)))
            .await
            .unwrap();

        assert_eq!(moved, 2);
        let generation = index.generation();
        assert_eq!(generation.number, 2);
        assert_eq!(generation.dimension, 64);

        let old = repo
            .query(&MemoryFilter {
                generation: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(old.is_empty());

        assert!(index.query_embedding(&[1.0, 0.0, 0.0], 1).await.is_err());
        assert_eq!(index.query("airport", 5).await.unwrap().len(), 2);
        assert_eq!(bus.get_events().last().unwrap().event_type(), "index_rebuilt");
    }

    /// Succeeds for the first `healthy_calls` embeddings, then fails.
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        healthy_calls: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, CortexError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call >= self.healthy_calls {
                return Err(CortexError::Embedding("upstream unavailable".into()));
            }
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn test_failed_reindex_keeps_every_event_queryable() {
        let repo = Arc::new(InMemoryMemoryRepository::new());
        let bus = Arc::new(MockEventBus::new());
        let index = SemanticSearchIndex::new(repo.clone(), Arc::new(HashingEmbedder::new(64)))
            .with_publisher(bus.clone());
        for (request, response) in [(1, "airport"), (2, "stadium"), (3, "downtown"), (4, "arena")] {
            index.index(draft(request, "strategist", response)).await.unwrap();
        }

        let result = index
            .reindex(Arc::new(FlakyEmbedder {
                inner: HashingEmbedder::new(32),
                healthy_calls: 2,
                calls: Default::default(),
            }))
            .await;

        assert!(matches!(result, Err(CortexError::Embedding(_))));
        let generation = index.generation();
        assert_eq!(generation.number, 1);
        assert_eq!(generation.dimension, 64);
        assert_eq!(index.query("airport", 10).await.unwrap().len(), 4);
        assert!(repo
            .query(&MemoryFilter::default())
            .await
            .unwrap()
            .iter()
            .all(|e| e.embedding.generation == 1 && e.embedding.dimension() == 64));
        assert!(bus
            .get_events()
            .iter()
            .all(|e| e.event_type() != "index_rebuilt"));

        // A later successful rebuild still works.
        assert_eq!(index.reindex(Arc::new(HashingEmbedder::new(32))).await.unwrap(), 4);
        assert_eq!(index.generation().number, 2);
    }

    #[tokio::test]
    async fn test_zero_k_returns_nothing() {
        let index = axis_index(3);
        index.index(draft(1, "strategist", "airport")).await.unwrap();
        assert!(index.query("airport", 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}