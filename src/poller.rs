//! Translation completion poller.
//!
//! Drives a partial record to completion: fetch, nudge the backend job,
//! wait, repeat, up to a fixed attempt budget. Identical concurrent
//! requests share one in-flight poll.

use crate::api::ApiClient;
use crate::content::{ContentKind, ContentRecord};
use crate::error::{ContentError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Writes a completed record to durable storage.
pub type PersistFn = Arc<dyn Fn(ContentRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Called with (identity, record) once a record is complete.
pub type InstallFn = Arc<dyn Fn(&str, &ContentRecord) + Send + Sync>;

/// A pending poll outcome; clones resolve to the same result.
pub type PollHandle = Shared<BoxFuture<'static, Result<ContentRecord>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub interval: Duration,
    /// Fail when an incomplete payload carries no cron key
    pub require_job_token: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_millis(300),
            require_job_token: true,
        }
    }
}

pub struct PollRequest {
    pub kind: ContentKind,
    /// Normalized identity handed to the install callback (the HL code)
    pub identity: String,
    /// Logical resource the poll updates; newer polls for it win
    pub resource: String,
    /// Logical endpoint path, without cache-busting parameters
    pub endpoint: String,
    pub options: PollOptions,
    pub persist: Option<PersistFn>,
    pub install: Option<InstallFn>,
}

impl PollRequest {
    pub fn new(kind: ContentKind, identity: &str, endpoint: &str) -> Self {
        Self {
            kind,
            identity: identity.trim().to_string(),
            resource: endpoint.to_string(),
            endpoint: endpoint.to_string(),
            options: PollOptions::default(),
            persist: None,
            install: None,
        }
    }

    pub fn for_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }

    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_persist(mut self, persist: PersistFn) -> Self {
        self.persist = Some(persist);
        self
    }

    pub fn with_install(mut self, install: InstallFn) -> Self {
        self.install = Some(install);
        self
    }
}

/// Dedup key: (kind, normalized identity, logical endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollKey {
    kind: ContentKind,
    identity: String,
    endpoint: String,
}

impl fmt::Display for PollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.identity, self.endpoint)
    }
}

struct InFlight {
    id: u64,
    handle: PollHandle,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    in_flight: HashMap<PollKey, InFlight>,
    generations: HashMap<(ContentKind, String), u64>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its own registry entries when the poll settles or is dropped.
struct InFlightGuard {
    registry: Arc<Mutex<Registry>>,
    key: PollKey,
    resource: (ContentKind, String),
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let removed = {
            let mut registry = lock(&self.registry);
            if registry.generations.get(&self.resource) == Some(&self.id) {
                registry.generations.remove(&self.resource);
            }
            match registry.in_flight.get(&self.key) {
                Some(entry) if entry.id == self.id => registry.in_flight.remove(&self.key),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!("Poll {} settled", self.key);
        }
    }
}

#[derive(Clone)]
pub struct TranslationPoller {
    api: ApiClient,
    registry: Arc<Mutex<Registry>>,
}

impl TranslationPoller {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Number of polls currently in flight.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.registry).in_flight.len()
    }

    /// Number of resources with a live generation token.
    pub fn tracked_resources(&self) -> usize {
        lock(&self.registry).generations.len()
    }

    /// Start (or join) a poll for `request`.
    ///
    /// Configuration errors are returned immediately; everything else is
    /// reported through the returned handle.
    pub fn poll_until_complete(&self, request: PollRequest) -> Result<PollHandle> {
        self.start_or_join(request).map(|(handle, _)| handle)
    }

    /// Like [`poll_until_complete`](Self::poll_until_complete), also
    /// reporting whether this call started the poll (`true`) or joined one
    /// already in flight (`false`).
    pub fn start_or_join(&self, request: PollRequest) -> Result<(PollHandle, bool)> {
        if !request.kind.is_translatable() {
            return Err(ContentError::UnsupportedKind(request.kind.to_string()));
        }
        if request.identity.is_empty() {
            return Err(ContentError::MissingIdentity("identity".to_string()));
        }
        if request.endpoint.trim().is_empty() {
            return Err(ContentError::MissingIdentity("endpoint".to_string()));
        }

        let key = PollKey {
            kind: request.kind,
            identity: request.identity.clone(),
            endpoint: request.endpoint.clone(),
        };

        let mut registry = lock(&self.registry);
        if let Some(existing) = registry.in_flight.get(&key) {
            debug!("Joining in-flight poll {}", key);
            return Ok((existing.handle.clone(), false));
        }

        // Ids never repeat, so the id doubles as the resource's generation.
        registry.next_id += 1;
        let id = registry.next_id;
        let generation = id;
        let resource = (request.kind, request.resource.clone());
        registry.generations.insert(resource.clone(), generation);

        let guard = InFlightGuard {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            resource,
            id,
        };
        let run = PollRun {
            api: self.api.clone(),
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            generation,
            request,
        };

        let handle = async move {
            let _guard = guard;
            run.execute().await
        }
        .boxed()
        .shared();

        debug!("Starting poll {} (generation {})", key, generation);
        registry.in_flight.insert(
            key,
            InFlight {
                id,
                handle: handle.clone(),
            },
        );
        Ok((handle, true))
    }
}

struct PollRun {
    api: ApiClient,
    registry: Arc<Mutex<Registry>>,
    key: PollKey,
    generation: u64,
    request: PollRequest,
}

impl PollRun {
    /// Fails with `Superseded` once a newer poll owns the resource.
    fn ensure_current(&self) -> Result<()> {
        let registry = lock(&self.registry);
        let latest = registry
            .generations
            .get(&(self.request.kind, self.request.resource.clone()))
            .copied();
        if latest == Some(self.generation) {
            Ok(())
        } else {
            debug!("Poll {} overtaken, discarding", self.key);
            Err(ContentError::Superseded(self.key.to_string()))
        }
    }

    async fn execute(self) -> Result<ContentRecord> {
        let PollOptions {
            max_attempts,
            interval,
            require_job_token,
        } = self.request.options;
        let max_attempts = max_attempts.max(1);
        let endpoint = self.request.endpoint.as_str();

        for attempt in 1..=max_attempts {
            debug!("Poll {} attempt {}/{}", self.key, attempt, max_attempts);

            let fetched = self.api.get_fresh_payload(endpoint).await;
            self.ensure_current()?;

            let record = match fetched {
                Ok(Some(record)) => record,
                Ok(None) => return Err(ContentError::EmptyPayload(endpoint.to_string())),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "Poll {} attempt {}/{} failed ({}), retrying",
                        self.key, attempt, max_attempts, e
                    );
                    sleep(interval).await;
                    self.ensure_current()?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if record.is_complete() {
                if let Some(persist) = &self.request.persist {
                    persist(record.clone()).await?;
                    self.ensure_current()?;
                }
                if let Some(install) = &self.request.install {
                    install(&self.request.identity, &record);
                }
                info!("Translation complete for {} after {} attempt(s)", self.key, attempt);
                return Ok(record);
            }

            match record.cron_key() {
                Some(cron_key) => {
                    // Best effort: a failed nudge only costs this attempt.
                    if let Err(e) = self.api.nudge(&cron_key).await {
                        warn!("Cron trigger failed for {}: {}", self.key, e);
                    }
                    self.ensure_current()?;
                }
                None if require_job_token => {
                    return Err(ContentError::ContractViolation(format!(
                        "missing cronKey in translation meta for {}",
                        self.key
                    )));
                }
                None => {}
            }

            if attempt < max_attempts {
                sleep(interval).await;
                self.ensure_current()?;
            }
        }

        Err(ContentError::PollExhausted {
            key: self.key.to_string(),
            attempts: max_attempts,
        })
    }
}
