//! Enrichment Engine (C5, §4.5): the bounded worker pool that drains the
//! job queue, orchestrates the three-stage per-memory pipeline, persists
//! partial progress, retries with backoff, and fires lifecycle callbacks.
//! Built from a bounded `async_channel` plus a `tokio::select!` worker loop,
//! scaled from a single queue consumer into an `N`-worker pool running the
//! full entities/relationships/embedding pipeline.

pub mod capability;
pub mod debug;
mod stage;

pub use capability::{AgentIdentity, DefaultAgentIdentity, Embedder, HashEmbedder, LlmExtractor, NaiveExtractor};
pub use debug::{CandidateTrace, DebugOrchestrator, DebugRecallTrace, FilteredCandidate, ScoreBreakdown};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{MementoError, Result};
use crate::events::dropdir::DropDirWriter;
use crate::events::{enrichment_complete, enrichment_started, memory_created, EventHub};
use crate::storage::Store;
use crate::types::{EnrichmentPatch, MemoryId, MemoryStatus, StageStatus};

/// Default bounded job queue capacity (§4.5).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A callback invoked exactly once per memory on a given lifecycle transition
/// (§4.5). Must not block on the store; observers post to a non-blocking
/// queue of their own.
pub type MemoryCallback = Arc<dyn Fn(&MemoryId) + Send + Sync>;

/// Engine tuning parameters (§4.5, §5).
#[derive(Clone)]
pub struct EngineConfig {
    /// Worker count. §5: forced to 1 for embedded-file backends paired with
    /// a local-hosted LLM provider — callers compute this before constructing.
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub max_retries: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub decay_interval: Duration,
    pub embedding_model: String,
    /// Entity type ids the active taxonomy recognizes; anything else is
    /// counted via `record_unknown_type` and dropped (§4.5).
    pub valid_entity_types: Vec<String>,
    pub valid_relationship_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            decay_interval: Duration::from_secs(60),
            embedding_model: "nomic-embed-text".to_string(),
            valid_entity_types: Vec::new(),
            valid_relationship_types: Vec::new(),
        }
    }
}

#[derive(Clone)]
enum Job {
    Enrich { id: MemoryId, content: String, attempt: i64 },
    EmbedOnly { id: MemoryId, content: String, attempt: i64 },
}

impl Job {
    fn id(&self) -> &MemoryId {
        match self {
            Job::Enrich { id, .. } | Job::EmbedOnly { id, .. } => id,
        }
    }

    fn attempt(&self) -> i64 {
        match self {
            Job::Enrich { attempt, .. } | Job::EmbedOnly { attempt, .. } => *attempt,
        }
    }
}

struct Callbacks {
    on_created: RwLock<Option<MemoryCallback>>,
    on_started: RwLock<Option<MemoryCallback>>,
    on_complete: RwLock<Option<MemoryCallback>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_created: RwLock::new(None),
            on_started: RwLock::new(None),
            on_complete: RwLock::new(None),
        }
    }
}

/// The worker pool + job queue for one connection's store (§4.5).
pub struct MemoryEngine {
    store: Arc<dyn Store>,
    extractor: Arc<dyn LlmExtractor>,
    embedder: Arc<dyn Embedder>,
    event_hub: Option<EventHub>,
    dropdir: Option<Arc<DropDirWriter>>,
    config: EngineConfig,
    sender: async_channel::Sender<Job>,
    receiver: async_channel::Receiver<Job>,
    queued: Arc<AtomicI64>,
    accepting: Arc<std::sync::atomic::AtomicBool>,
    callbacks: Arc<Callbacks>,
    worker_handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    decay_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryEngine {
    /// Construct the engine; does not start workers (§4.5 `NewMemoryEngine`).
    ///
    /// `dropdir`, when set, mirrors every published event into the
    /// cross-process drop directory (§4.2) so a peer process without its own
    /// engine instance (e.g. the HTTP front end when the stdio front end owns
    /// enrichment for a shared store) can observe lifecycle transitions.
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn LlmExtractor>,
        embedder: Arc<dyn Embedder>,
        event_hub: Option<EventHub>,
        dropdir: Option<Arc<DropDirWriter>>,
        config: EngineConfig,
    ) -> Self {
        let (sender, receiver) = async_channel::bounded(config.queue_capacity.max(1));
        Self {
            store,
            extractor,
            embedder,
            event_hub,
            dropdir,
            config,
            sender,
            receiver,
            queued: Arc::new(AtomicI64::new(0)),
            accepting: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            callbacks: Arc::new(Callbacks::default()),
            worker_handles: parking_lot::Mutex::new(Vec::new()),
            decay_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_on_memory_created(&self, cb: MemoryCallback) {
        *self.callbacks.on_created.write() = Some(cb);
    }

    pub fn set_on_enrichment_started(&self, cb: MemoryCallback) {
        *self.callbacks.on_started.write() = Some(cb);
    }

    pub fn set_on_enrichment_complete(&self, cb: MemoryCallback) {
        *self.callbacks.on_complete.write() = Some(cb);
    }

    /// Spawn `config.num_workers` worker tasks plus the decay ticker (§4.5, §5).
    pub fn start(self: &Arc<Self>, token: CancellationToken) {
        let mut handles = self.worker_handles.lock();
        for worker_id in 0..self.config.num_workers.max(1) {
            let engine = self.clone();
            let worker_token = token.clone();
            handles.push(tokio::spawn(async move {
                engine.run_worker(worker_id, worker_token).await;
            }));
        }
        drop(handles);

        let engine = self.clone();
        let decay_token = token;
        *self.decay_handle.lock() = Some(tokio::spawn(async move {
            engine.run_decay_ticker(decay_token).await;
        }));
    }

    /// Stop accepting new jobs; wait for in-flight jobs up to `deadline`
    /// (§4.5 `Shutdown`). Jobs still running when `deadline` elapses are
    /// abandoned in whatever partial state their last successful stage wrote.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.sender.close();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_handles.lock());
        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("enrichment engine shutdown deadline elapsed with workers still in flight");
        }
        if let Some(handle) = self.decay_handle.lock().take() {
            handle.abort();
        }
    }

    /// Admit a full three-stage enrichment job (§4.5 `QueueEnrichmentForMemory`).
    pub fn queue_enrichment(&self, id: MemoryId, content: String) -> bool {
        self.try_admit(Job::Enrich { id, content, attempt: 0 })
    }

    /// Admit an embedding-only backfill job (§4.5 `QueueEmbeddingForMemory`).
    pub fn queue_embedding(&self, id: MemoryId, content: String) -> bool {
        self.try_admit(Job::EmbedOnly { id, content, attempt: 0 })
    }

    fn try_admit(&self, job: Job) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        match self.sender.try_send(job) {
            Ok(()) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Advisory in-flight + buffered count (§4.5 `GetQueueSize`).
    pub fn queue_size(&self) -> i64 {
        self.queued.load(Ordering::SeqCst).max(0)
    }

    /// Reset a `Failed` memory to `Pending` and re-admit it with a fresh
    /// attempt counter (§4.5 `RetryEnrichment`). `Conflict` if the memory is
    /// not currently `Failed`.
    pub async fn retry_enrichment(&self, id: &MemoryId, token: &CancellationToken) -> Result<bool> {
        let memory = self.store.get(id, token).await?;
        if memory.status != MemoryStatus::Failed {
            return Err(MementoError::Conflict(format!(
                "memory {id} is not in a failed state (status: {:?})",
                memory.status
            )));
        }
        self.store.update_status(id, MemoryStatus::Pending, token).await?;
        self.store
            .update_enrichment(
                id,
                EnrichmentPatch {
                    enrichment_attempts: Some(0),
                    enrichment_error: Some(None),
                    ..Default::default()
                },
                token,
            )
            .await?;
        Ok(self.queue_enrichment(id.clone(), memory.content))
    }

    /// Publish `memory_created` in-process and, if wired, to the drop
    /// directory, and fire the corresponding callback (§4.2, §4.5).
    pub fn notify_created(&self, id: &MemoryId) {
        self.publish_event(memory_created(id.clone()));
        if let Some(cb) = self.callbacks.on_created.read().as_ref() {
            cb(id);
        }
    }

    /// Publish one lifecycle event to the in-process hub and, if wired, the
    /// drop directory (§4.2).
    fn publish_event(&self, event: crate::types::Event) {
        if let Some(writer) = &self.dropdir {
            writer.write(&event);
        }
        if let Some(hub) = &self.event_hub {
            hub.publish(event);
        }
    }

    async fn run_decay_ticker(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.decay_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {
                    match self.store.update_decay_scores(&token).await {
                        Ok(count) => info!(count, "recomputed decay scores"),
                        Err(err) => error!(%err, "decay score recomputation failed"),
                    }
                }
            }
        }
    }

    async fn run_worker(&self, worker_id: usize, token: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => return,
                job = self.receiver.recv() => job,
            };
            let Ok(job) = job else { return };
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.process_job(worker_id, job, &token).await;
        }
    }

    async fn process_job(&self, worker_id: usize, job: Job, token: &CancellationToken) {
        let id = job.id().clone();
        let attempt = job.attempt();

        if let Err(err) = self.store.update_status(&id, MemoryStatus::Processing, token).await {
            warn!(worker_id, %id, %err, "failed to claim memory for processing");
            return;
        }

        if attempt == 0 {
            self.publish_event(enrichment_started(id.clone()));
            if let Some(cb) = self.callbacks.on_started.read().as_ref() {
                cb(&id);
            }
        }

        match &job {
            Job::Enrich { content, .. } => {
                let (entity_status, relationship_status, embedding_status, last_error) =
                    self.run_pipeline(&id, content, token).await;
                let any_failed = matches!(entity_status, StageStatus::Failed)
                    || matches!(relationship_status, StageStatus::Failed)
                    || matches!(embedding_status, StageStatus::Failed);

                if any_failed {
                    self.handle_stage_failure(&id, job, attempt, last_error, token).await;
                } else {
                    self.mark_enriched(&id, token).await;
                }
            }
            Job::EmbedOnly { content, .. } => {
                let (embedding_status, error) =
                    stage::run_embedding_stage(&self.store, &self.embedder, &id, content, token).await;
                // Persist only the embedding stage status — an embed-only job
                // never ran entity/relationship extraction and must not touch
                // those columns (§8 Invariant 1).
                let _ = self
                    .store
                    .update_enrichment(
                        &id,
                        EnrichmentPatch {
                            embedding_status: Some(embedding_status),
                            ..Default::default()
                        },
                        token,
                    )
                    .await;

                if matches!(embedding_status, StageStatus::Failed) {
                    self.handle_stage_failure(&id, job, attempt, error, token).await;
                    return;
                }

                // Only promote to Enriched if entity/relationship extraction
                // already completed for this memory; otherwise leave `status`
                // as-is (still Pending/Processing until those stages run).
                if let Ok(current) = self.store.get(&id, token).await {
                    if current.entity_status == StageStatus::Done
                        && current.relationship_status == StageStatus::Done
                    {
                        self.mark_enriched(&id, token).await;
                    }
                }
            }
        }
    }

    /// Persist the terminal `Enriched` transition and fire lifecycle callbacks.
    async fn mark_enriched(&self, id: &MemoryId, token: &CancellationToken) {
        let now = chrono::Utc::now();
        let _ = self
            .store
            .update_enrichment(
                id,
                EnrichmentPatch {
                    status: Some(MemoryStatus::Enriched),
                    enriched_at: Some(Some(now)),
                    ..Default::default()
                },
                token,
            )
            .await;
        self.publish_event(enrichment_complete(id.clone()));
        if let Some(cb) = self.callbacks.on_complete.read().as_ref() {
            cb(id);
        }
    }

    /// Shared retry/terminal-failure handling for a job whose stage(s) failed
    /// this attempt (§4.5). Below `max_retries`, resets to `Pending` and
    /// re-admits with backoff; at the ceiling, sets `status = Failed`.
    async fn handle_stage_failure(
        &self,
        id: &MemoryId,
        job: Job,
        attempt: i64,
        last_error: Option<String>,
        token: &CancellationToken,
    ) {
        let next_attempt = attempt + 1;
        if next_attempt < self.config.max_retries {
            let _ = self
                .store
                .update_enrichment(
                    id,
                    EnrichmentPatch {
                        status: Some(MemoryStatus::Pending),
                        enrichment_attempts: Some(next_attempt),
                        enrichment_error: Some(last_error),
                        ..Default::default()
                    },
                    token,
                )
                .await;
            self.requeue_with_backoff(job, next_attempt);
        } else {
            let now = chrono::Utc::now();
            let _ = self
                .store
                .update_enrichment(
                    id,
                    EnrichmentPatch {
                        status: Some(MemoryStatus::Failed),
                        enrichment_attempts: Some(next_attempt),
                        enrichment_error: Some(last_error),
                        enriched_at: Some(Some(now)),
                        ..Default::default()
                    },
                    token,
                )
                .await;
            self.publish_event(enrichment_complete(id.clone()));
            if let Some(cb) = self.callbacks.on_complete.read().as_ref() {
                cb(id);
            }
        }
    }

    /// Entity + embedding run concurrently; relationships depend on the
    /// entity outcome and run after (§4.5's stage diagram).
    async fn run_pipeline(
        &self,
        id: &MemoryId,
        content: &str,
        token: &CancellationToken,
    ) -> (StageStatus, StageStatus, StageStatus, Option<String>) {
        let entity_fut =
            stage::run_entity_stage(&self.store, &self.extractor, id, content, &self.config.valid_entity_types, token);
        let embedding_fut = stage::run_embedding_stage(&self.store, &self.embedder, id, content, token);
        let (entity_outcome, (embedding_status, embedding_error)) = tokio::join!(entity_fut, embedding_fut);

        let _ = self
            .store
            .update_enrichment(
                id,
                EnrichmentPatch {
                    entity_status: Some(entity_outcome.status),
                    embedding_status: Some(embedding_status),
                    ..Default::default()
                },
                token,
            )
            .await;

        let (relationship_status, relationship_error) = stage::run_relationship_stage(
            &self.store,
            &self.extractor,
            content,
            &entity_outcome,
            &self.config.valid_relationship_types,
            token,
        )
        .await;
        let _ = self
            .store
            .update_enrichment(
                id,
                EnrichmentPatch {
                    relationship_status: Some(relationship_status),
                    ..Default::default()
                },
                token,
            )
            .await;

        let last_error = [entity_outcome.error.clone(), relationship_error, embedding_error]
            .into_iter()
            .flatten()
            .last();

        (entity_outcome.status, relationship_status, embedding_status, last_error)
    }

    fn requeue_with_backoff(&self, job: Job, next_attempt: i64) {
        let delay = self.backoff_delay(next_attempt);
        let sender = self.sender.clone();
        let queued = self.queued.clone();
        let accepting = self.accepting.clone();
        let job = match job {
            Job::Enrich { id, content, .. } => Job::Enrich { id, content, attempt: next_attempt },
            Job::EmbedOnly { id, content, .. } => Job::EmbedOnly { id, content, attempt: next_attempt },
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !accepting.load(Ordering::SeqCst) {
                return;
            }
            if sender.try_send(job).is_ok() {
                queued.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    /// Exponential backoff with a jittered base, capped (§9 open question (b):
    /// backoff policy is implementer's discretion provided attempts stay bounded).
    fn backoff_delay(&self, attempt: i64) -> Duration {
        let exp = 2u32.saturating_pow(attempt.max(0) as u32 - 1 + 1);
        let scaled = self.config.backoff_base.saturating_mul(exp);
        let jitter = 1.0 + crate::types::jitter_fraction() * 0.25;
        let millis = (scaled.as_millis() as f64 * jitter) as u64;
        Duration::from_millis(millis).min(self.config.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteBackend;
    use crate::types::Memory;
    use std::sync::atomic::AtomicUsize;

    fn engine(max_retries: i64) -> (Arc<MemoryEngine>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let config = EngineConfig {
            num_workers: 1,
            max_retries,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            valid_entity_types: vec!["concept".to_string()],
            ..Default::default()
        };
        let engine = Arc::new(MemoryEngine::new(
            store.clone(),
            Arc::new(NaiveExtractor),
            Arc::new(HashEmbedder::new("test-model", 8)),
            None,
            None,
            config,
        ));
        (engine, store)
    }

    #[tokio::test]
    async fn happy_path_enriches_memory() {
        let (engine, store) = engine(3);
        let token = CancellationToken::new();
        let memory = Memory::new("default", "Go is a language built at Google");
        store.store(memory.clone(), &token).await.unwrap();

        let complete_count = Arc::new(AtomicUsize::new(0));
        {
            let counter = complete_count.clone();
            engine.set_on_enrichment_complete(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        engine.start(token.clone());
        assert!(engine.queue_enrichment(memory.id.clone(), memory.content.clone()));

        for _ in 0..50 {
            let fetched = store.get(&memory.id, &token).await.unwrap();
            if fetched.status == MemoryStatus::Enriched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let fetched = store.get(&memory.id, &token).await.unwrap();
        assert_eq!(fetched.status, MemoryStatus::Enriched);
        assert_eq!(fetched.entity_status, StageStatus::Done);
        assert_eq!(fetched.relationship_status, StageStatus::Done);
        assert_eq!(fetched.embedding_status, StageStatus::Done);
        assert!(fetched.enriched_at.is_some());
        assert_eq!(complete_count.load(Ordering::SeqCst), 1);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn retry_enrichment_rejects_non_failed_memory() {
        let (engine, store) = engine(3);
        let token = CancellationToken::new();
        let memory = Memory::new("default", "hello");
        store.store(memory.clone(), &token).await.unwrap();

        let result = engine.retry_enrichment(&memory.id, &token).await;
        assert!(matches!(result, Err(MementoError::Conflict(_))));
    }

    #[test]
    fn queue_full_returns_false_not_blocking() {
        let store: Arc<dyn Store> =
            Arc::new(crate::storage::SqliteBackend::open_in_memory().unwrap());
        let config = EngineConfig { queue_capacity: 1, ..Default::default() };
        let engine = MemoryEngine::new(
            store,
            Arc::new(NaiveExtractor),
            Arc::new(HashEmbedder::new("m", 4)),
            None,
            None,
            config,
        );
        assert!(engine.queue_enrichment(MemoryId::from_parts("default", "a"), "x".to_string()));
        assert!(!engine.queue_enrichment(MemoryId::from_parts("default", "b"), "y".to_string()));
    }

    /// Always-failing embedder, for exercising the embed-only failure branch.
    struct FailingEmbedder;

    #[async_trait::async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(MementoError::Embedding("provider unavailable".to_string()))
        }

        fn model_name(&self) -> &str {
            "failing-model"
        }
    }

    #[tokio::test]
    async fn embed_only_does_not_promote_to_enriched_before_other_stages_finish() {
        let (engine, store) = engine(3);
        let token = CancellationToken::new();
        let memory = Memory::new("default", "some content");
        store.store(memory.clone(), &token).await.unwrap();

        engine.start(token.clone());
        assert!(engine.queue_embedding(memory.id.clone(), memory.content.clone()));

        for _ in 0..50 {
            let fetched = store.get(&memory.id, &token).await.unwrap();
            if fetched.embedding_status == StageStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let fetched = store.get(&memory.id, &token).await.unwrap();
        assert_eq!(fetched.embedding_status, StageStatus::Done, "embedding stage should complete");
        assert_eq!(fetched.entity_status, StageStatus::Pending, "entity stage was never run");
        assert_eq!(fetched.relationship_status, StageStatus::Pending, "relationship stage was never run");
        assert_ne!(
            fetched.status,
            MemoryStatus::Enriched,
            "must not claim Enriched while entity/relationship stages are still pending (Invariant 1)"
        );

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn embed_only_promotes_to_enriched_once_other_stages_are_already_done() {
        let (engine, store) = engine(3);
        let token = CancellationToken::new();
        let memory = Memory::new("default", "some content");
        store.store(memory.clone(), &token).await.unwrap();
        store
            .update_enrichment(
                &memory.id,
                EnrichmentPatch {
                    entity_status: Some(StageStatus::Done),
                    relationship_status: Some(StageStatus::Done),
                    ..Default::default()
                },
                &token,
            )
            .await
            .unwrap();

        engine.start(token.clone());
        assert!(engine.queue_embedding(memory.id.clone(), memory.content.clone()));

        for _ in 0..50 {
            let fetched = store.get(&memory.id, &token).await.unwrap();
            if fetched.status == MemoryStatus::Enriched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let fetched = store.get(&memory.id, &token).await.unwrap();
        assert_eq!(fetched.status, MemoryStatus::Enriched);
        assert_eq!(fetched.embedding_status, StageStatus::Done);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn embed_only_failure_persists_embedding_failed_stage_status() {
        let store: Arc<dyn Store> = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let config = EngineConfig {
            num_workers: 1,
            max_retries: 1,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = Arc::new(MemoryEngine::new(
            store.clone(),
            Arc::new(NaiveExtractor),
            Arc::new(FailingEmbedder),
            None,
            None,
            config,
        ));
        let token = CancellationToken::new();
        let memory = Memory::new("default", "some content");
        store.store(memory.clone(), &token).await.unwrap();

        engine.start(token.clone());
        assert!(engine.queue_embedding(memory.id.clone(), memory.content.clone()));

        for _ in 0..50 {
            let fetched = store.get(&memory.id, &token).await.unwrap();
            if fetched.status == MemoryStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let fetched = store.get(&memory.id, &token).await.unwrap();
        assert_eq!(fetched.status, MemoryStatus::Failed);
        assert_eq!(
            fetched.embedding_status,
            StageStatus::Failed,
            "embed-only failure must record a Failed stage status, not just overall status (Invariant 2)"
        );
        assert!(fetched.enrichment_attempts >= 1);

        engine.shutdown(Duration::from_secs(1)).await;
    }
}
