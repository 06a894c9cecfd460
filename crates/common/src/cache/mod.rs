//! Coalescing answer cache
//!
//! Provides:
//! - Session-scoped answer storage with lazy TTL expiry
//! - At most one pipeline execution per key, shared by every concurrent caller
//! - Identical fan-out of the single result (or error) to all waiters
//! - Session clearing and an optional expired-entry sweeper
//!
//! The only locked section is the check-and-register step over the entry
//! store and the in-flight registry. Pipeline stages never run under it.

use crate::config::PipelineConfig;
use crate::errors::{AppError, Result};
use crate::metrics::{self, CacheLookup};
use crate::persona::SafetyPolicy;
use crate::pipeline::{Deadline, RagPipeline};
use crate::types::{Answer, CacheKey, Query, MAX_QUERY_CHARS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Published result of one execution; `None` until the execution finishes
type Outcome = Option<Result<Answer>>;

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Lifetime of a stored answer
    pub ttl: Duration,
    /// Deadline for one pipeline execution, measured from registration
    pub pipeline_timeout: Duration,
    /// Maximum accepted query length in characters
    pub max_query_chars: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            pipeline_timeout: Duration::from_secs(10),
            max_query_chars: MAX_QUERY_CHARS,
        }
    }
}

impl From<&PipelineConfig> for CacheSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            ttl: config.ttl(),
            pipeline_timeout: config.pipeline_timeout(),
            max_query_chars: config.max_query_chars,
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry_at: Option<DateTime<Utc>>,
}

struct CacheEntry {
    answer: Answer,
    stored_at: Instant,
    stored_at_wall: DateTime<Utc>,
    ttl: Duration,
    session_id: String,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

struct InFlightRequest {
    id: Uuid,
    result: watch::Receiver<Outcome>,
    waiters: usize,
    session_id: String,
    /// Set when the session is cleared mid-execution; the result is then not stored
    skip_store: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, InFlightRequest>,
    sessions: HashMap<String, HashSet<CacheKey>>,
}

impl CacheState {
    fn store(&mut self, key: CacheKey, entry: CacheEntry) {
        self.sessions
            .entry(entry.session_id.clone())
            .or_default()
            .insert(key.clone());
        self.entries.insert(key, entry);
    }

    fn remove_entry(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(keys) = self.sessions.get_mut(&entry.session_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.sessions.remove(&entry.session_id);
            }
        }
        true
    }
}

enum Lookup {
    Hit(Answer),
    Join(watch::Receiver<Outcome>),
    Lead {
        id: Uuid,
        tx: watch::Sender<Outcome>,
        rx: watch::Receiver<Outcome>,
    },
}

/// Session-scoped answer cache that coalesces identical in-flight queries
pub struct AnswerCache {
    pipeline: Arc<RagPipeline>,
    policy: RwLock<Arc<SafetyPolicy>>,
    settings: CacheSettings,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl AnswerCache {
    pub fn new(pipeline: Arc<RagPipeline>, policy: SafetyPolicy, settings: CacheSettings) -> Self {
        Self {
            pipeline,
            policy: RwLock::new(Arc::new(policy)),
            settings,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy_snapshot(&self) -> Arc<SafetyPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate raw input and answer it
    pub async fn ask(self: &Arc<Self>, text: &str, session_id: &str) -> Result<Answer> {
        let query = Query::with_limit(text, session_id, self.settings.max_query_chars)?;
        self.answer(query).await
    }

    /// Answer a query from cache, by joining an in-flight execution, or by
    /// starting a new one
    pub async fn answer(self: &Arc<Self>, query: Query) -> Result<Answer> {
        let start = Instant::now();
        let key = CacheKey::derive(&query);

        let rx = match self.lookup(&key, query.session_id()) {
            Lookup::Hit(answer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache(CacheLookup::Hit);
                metrics::record_answer(start.elapsed().as_secs_f64(), "hit", answer.emergency);
                debug!(key = %key, "Cache hit");
                return Ok(answer);
            }
            Lookup::Join(rx) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache(CacheLookup::Coalesced);
                debug!(key = %key, "Joined in-flight execution");
                rx
            }
            Lookup::Lead { id, tx, rx } => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache(CacheLookup::Miss);
                debug!(key = %key, execution_id = %id, "Cache miss");
                self.spawn_execution(key, query, id, tx);
                rx
            }
        };

        let result = Self::wait(rx).await;
        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(answer) => metrics::record_answer(elapsed, "ok", answer.emergency),
            Err(_) => metrics::record_answer(elapsed, "error", false),
        }
        result
    }

    /// The single critical section: hit, join, or register as leader
    fn lookup(&self, key: &CacheKey, session_id: &str) -> Lookup {
        let now = Instant::now();
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let expired = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Lookup::Hit(entry.answer.as_cached()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove_entry(key);
            debug!(key = %key, "Cache entry expired");
        }

        if let Some(request) = state.in_flight.get_mut(key) {
            request.waiters += 1;
            return Lookup::Join(request.result.clone());
        }

        let (tx, rx) = watch::channel(None);
        let id = Uuid::new_v4();
        state.in_flight.insert(
            key.clone(),
            InFlightRequest {
                id,
                result: rx.clone(),
                waiters: 1,
                session_id: session_id.to_string(),
                skip_store: false,
            },
        );
        metrics::set_in_flight(state.in_flight.len());

        Lookup::Lead { id, tx, rx }
    }

    /// Run the pipeline on its own task so no single caller can cancel it
    fn spawn_execution(self: &Arc<Self>, key: CacheKey, query: Query, id: Uuid, tx: watch::Sender<Outcome>) {
        let deadline = Deadline::after(self.settings.pipeline_timeout);
        let policy = self.policy_snapshot();
        let span = info_span!(
            "pipeline",
            execution_id = %id,
            key = %key,
            session_id = %query.session_id()
        );

        let mut guard = InFlightGuard {
            cache: Arc::clone(self),
            key,
            id,
            finished: false,
        };

        tokio::spawn(
            async move {
                let outcome = guard.cache.pipeline.run(&query, &policy, deadline).await;
                guard.cache.complete(&guard.key, query.session_id(), id, outcome, tx);
                guard.finished = true;
            }
            .instrument(span),
        );
    }

    /// Store (on success), retire the in-flight record, then release waiters
    fn complete(
        &self,
        key: &CacheKey,
        session_id: &str,
        id: Uuid,
        outcome: Result<Answer>,
        tx: watch::Sender<Outcome>,
    ) {
        let (waiters, stored) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;

            let request = match state.in_flight.get(key) {
                Some(request) if request.id == id => state.in_flight.remove(key),
                _ => None,
            };
            let (waiters, storable) = request
                .map(|r| (r.waiters, !r.skip_store))
                .unwrap_or((0, false));

            let stored = match &outcome {
                Ok(answer) if storable => {
                    let entry = CacheEntry {
                        answer: answer.clone(),
                        stored_at: Instant::now(),
                        stored_at_wall: Utc::now(),
                        ttl: self.settings.ttl,
                        session_id: session_id.to_string(),
                    };
                    state.store(key.clone(), entry);
                    true
                }
                _ => false,
            };
            metrics::set_in_flight(state.in_flight.len());
            (waiters, stored)
        };

        match &outcome {
            Ok(_) => info!(key = %key, waiters, stored, "Execution finished"),
            Err(e) => warn!(key = %key, waiters, error = %e, "Execution failed, nothing cached"),
        }
        tx.send_replace(Some(outcome));
    }

    /// Drop the in-flight record of an execution that never completed
    fn abandon(&self, key: &CacheKey, id: Uuid) {
        let mut state = self.lock_state();
        if state.in_flight.get(key).is_some_and(|r| r.id == id) {
            state.in_flight.remove(key);
            metrics::set_in_flight(state.in_flight.len());
            warn!(key = %key, execution_id = %id, "Execution abandoned");
        }
    }

    async fn wait(mut rx: watch::Receiver<Outcome>) -> Result<Answer> {
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(abandoned())),
            Err(_) => Err(abandoned()),
        }
    }

    /// Remove every entry derived from `session_id`, returning how many were removed
    ///
    /// Executions already running for the session still answer their
    /// waiters but no longer write an entry.
    pub fn clear_session(&self, session_id: &str) -> usize {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        state
            .in_flight
            .values_mut()
            .filter(|request| request.session_id == session_id)
            .for_each(|request| request.skip_store = true);

        let removed = match state.sessions.remove(session_id) {
            Some(keys) => keys
                .iter()
                .filter_map(|key| state.entries.remove(key))
                .count(),
            None => 0,
        };

        info!(session_id, removed, "Session cache cleared");
        removed
    }

    /// Replace the emergency phrase list for subsequent executions
    pub fn set_emergency_phrases(&self, phrases: Vec<String>) {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        *policy = Arc::new(policy.with_emergency_phrases(phrases));
        info!(count = policy.emergency_phrases().len(), "Emergency phrases updated");
    }

    pub fn emergency_phrases(&self) -> Vec<String> {
        self.policy_snapshot().emergency_phrases().to_vec()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_state();
        CacheStats {
            entries: state.entries.len(),
            in_flight: state.in_flight.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            oldest_entry_at: state.entries.values().map(|e| e.stored_at_wall).min(),
        }
    }

    /// Remove every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock_state();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove_entry(key);
        }
        expired.len()
    }

    /// Periodically purge expired entries until the cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    debug!("Cache dropped, sweeper stopping");
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Expired cache entries purged");
                }
            }
        })
    }
}

fn abandoned() -> AppError {
    AppError::Internal {
        message: "pipeline execution ended without a result".to_string(),
    }
}

/// Clears the in-flight record if the execution task panics or is cancelled
struct InFlightGuard {
    cache: Arc<AnswerCache>,
    key: CacheKey,
    id: Uuid,
    finished: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.abandon(&self.key, self.id);
        }
    }
}
