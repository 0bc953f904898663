//! Content resolution orchestrator.
//!
//! Answers "best available data now" from the reactive cache, the local
//! store or the remote API, in that order, and hands partial records to
//! the poller so they improve in the background.

use crate::api::ApiClient;
use crate::cache::ReactiveCache;
use crate::content::{ContentKind, ContentRecord};
use crate::db::{self, Database};
use crate::error::{ContentError, Result};
use crate::keys::CacheKey;
use crate::metrics::{MetricsReport, ResolutionMetrics};
use crate::poller::{InstallFn, PersistFn, PollOptions, PollRequest, TranslationPoller};
use futures::FutureExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One resolution: which record, where it lives remotely, and what to do
/// once it is complete.
pub struct ResolveRequest {
    pub kind: ContentKind,
    pub key: CacheKey,
    /// Normalized identity passed to `install` (the HL code)
    pub identity: String,
    pub remote_path: String,
    pub install: Option<InstallFn>,
}

impl ResolveRequest {
    pub fn new(kind: ContentKind, key: CacheKey, identity: &str, remote_path: impl Into<String>) -> Self {
        Self {
            kind,
            key,
            identity: identity.trim().to_string(),
            remote_path: remote_path.into(),
            install: None,
        }
    }

    pub fn with_install(mut self, install: InstallFn) -> Self {
        self.install = Some(install);
        self
    }
}

pub struct ContentResolver {
    api: ApiClient,
    db: Database,
    poller: TranslationPoller,
    cache: Arc<dyn ReactiveCache>,
    poll_options: PollOptions,
    metrics: Arc<ResolutionMetrics>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ContentResolver {
    pub fn new(api: ApiClient, db: Database, cache: Arc<dyn ReactiveCache>) -> Self {
        Self {
            poller: TranslationPoller::new(api.clone()),
            api,
            db,
            cache,
            poll_options: PollOptions::default(),
            metrics: Arc::new(ResolutionMetrics::new()),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &Arc<dyn ReactiveCache> {
        &self.cache
    }

    pub fn poller(&self) -> &TranslationPoller {
        &self.poller
    }

    pub fn metrics(&self) -> MetricsReport {
        self.metrics.report()
    }

    /// Resolve a record. Only a failed remote fetch is reported as an
    /// error; cache and store failures fall through to the next tier.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<ContentRecord> {
        let key = &request.key;

        if let Some(record) = self.cache.get(key) {
            debug!("Reactive cache hit for {}", key);
            self.metrics.record_reactive_hit();
            self.kick_if_partial(&request, &record);
            return Ok(record);
        }

        match self.db.get_record(request.kind, key).await {
            Ok(Some(record)) => {
                debug!("Local store hit for {}", key);
                self.metrics.record_store_hit();
                self.cache.set(key, record.clone());
                self.kick_if_partial(&request, &record);
                return Ok(record);
            }
            Ok(None) => {}
            Err(e) => warn!("Local store read failed for {}: {}", key, e),
        }

        self.metrics.record_remote_fetch();
        let record = match self.api.get_payload(&request.remote_path).await {
            Ok(Some(record)) if db::is_meaningful(record.as_value()) => record,
            Ok(_) => {
                self.metrics.record_remote_failure();
                return Err(ContentError::EmptyPayload(request.remote_path.clone()));
            }
            Err(e) => {
                self.metrics.record_remote_failure();
                warn!("Remote fetch failed for {}: {}", key, e);
                return Err(e);
            }
        };

        info!("Fetched {} from {}", key, request.remote_path);
        if let Err(e) = self.db.save_record(request.kind, key, &record).await {
            warn!("Failed to persist {}: {}", key, e);
        }
        self.cache.set(key, record.clone());
        self.kick_if_partial(&request, &record);
        Ok(record)
    }

    /// Start (or join) a background poll for a partial record.
    fn kick_if_partial(&self, request: &ResolveRequest, record: &ContentRecord) {
        if record.is_complete() || !request.kind.is_translatable() {
            return;
        }

        let mut poll = PollRequest::new(request.kind, &request.identity, &request.remote_path)
            .for_resource(request.key.as_str())
            .with_options(self.poll_options)
            .with_persist(self.persist_fn(request.kind, &request.key));
        if let Some(install) = &request.install {
            poll = poll.with_install(Arc::clone(install));
        }

        let handle = match self.poller.start_or_join(poll) {
            Ok((handle, true)) => handle,
            // The task that started it is already watching.
            Ok((_, false)) => return,
            Err(e) => {
                warn!("Could not start background poll for {}: {}", request.key, e);
                return;
            }
        };

        self.metrics.record_poll_started();
        let metrics = Arc::clone(&self.metrics);
        let key = request.key.clone();
        let task = tokio::spawn(async move {
            match handle.await {
                Ok(_) => metrics.record_poll_completed(),
                Err(ContentError::Superseded(_)) => debug!("Background poll for {} overtaken", key),
                Err(e) => {
                    metrics.record_poll_failed();
                    warn!("Background poll for {} failed: {}", key, e);
                }
            }
        });

        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        background.retain(|task| !task.is_finished());
        background.push(task);
    }

    /// Completed records go to the store (best effort) and the reactive cache.
    fn persist_fn(&self, kind: ContentKind, key: &CacheKey) -> PersistFn {
        let db = self.db.clone();
        let cache = Arc::clone(&self.cache);
        let key = key.clone();
        Arc::new(move |record: ContentRecord| {
            let db = db.clone();
            let cache = Arc::clone(&cache);
            let key = key.clone();
            async move {
                if let Err(e) = db.save_record(kind, &key, &record).await {
                    warn!("Failed to persist completed {}: {}", key, e);
                }
                cache.set(&key, record);
                Ok::<(), ContentError>(())
            }
            .boxed()
        })
    }

    /// Wait for every background poll started so far, including polls
    /// started while waiting.
    pub async fn settle_background_polls(&self) {
        loop {
            let pending = {
                let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *background)
            };
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(e) = task.await {
                    warn!("Background poll task aborted: {}", e);
                }
            }
        }
    }
}
