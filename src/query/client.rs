//! Process-wide query cache.
//!
//! `QueryClient` owns every cache entry, starts fetches through the entry's
//! [`QueryFn`], retries failed reads according to the retry policy, collapses
//! concurrent fetches of one key into a single call and evicts entries nobody
//! has looked at for the GC window.
//!
//! # Example
//!
//! ```ignore
//! let api = ApiClient::new(&config.api)?;
//! let queries = QueryClient::from_api(api.clone(), config.queries.clone());
//!
//! let mut habits = queries.subscribe(QueryKey::new("/api/habits"));
//! let state = habits.settled().await;
//!
//! queries
//!   .mutate(&[QueryKey::new("/api/habits")], || {
//!     api.request_json(Method::POST, "/api/habits", Some(&body))
//!   })
//!   .await?;
//! ```

use chrono::Utc;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::QueryKey;
use super::retry::OperationKind;
use super::state::{QueryState, QueryStatus};
use crate::api::{ApiClient, ApiError, FetchResult, On401, QueryFetcher, QueryFn};
use crate::config::QueryConfig;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
  generation: u64,
  future: SharedFetch,
}

struct CacheEntry {
  /// Distinguishes this entry from a later one recreated under the same key
  id: u64,
  key: QueryKey,
  state: QueryState,
  tx: watch::Sender<QueryState>,
  query_fn: QueryFn,
  /// Generation of the most recently started fetch; only it may commit
  generation: u64,
  in_flight: Option<InFlight>,
  subscribers: usize,
  fetched_at: Option<Instant>,
  invalidated: bool,
  idle_since: Option<Instant>,
}

impl CacheEntry {
  fn new(id: u64, key: QueryKey, query_fn: QueryFn) -> Self {
    let (tx, _) = watch::channel(QueryState::default());
    Self {
      id,
      key,
      state: QueryState::default(),
      tx,
      query_fn,
      generation: 0,
      in_flight: None,
      subscribers: 0,
      fetched_at: None,
      invalidated: false,
      idle_since: None,
    }
  }

  fn publish(&self) {
    self.tx.send_replace(self.state.clone());
  }

  fn is_stale(&self, stale_time: Duration) -> bool {
    if self.invalidated || self.state.status != QueryStatus::Success {
      return true;
    }
    self
      .fetched_at
      .map(|t| t.elapsed() >= stale_time)
      .unwrap_or(true)
  }

  fn is_collectable(&self, gc_time: Duration) -> bool {
    self.subscribers == 0
      && self.in_flight.is_none()
      && self.idle_since.is_some_and(|t| t.elapsed() >= gc_time)
  }
}

struct Inner {
  config: QueryConfig,
  default_fn: QueryFn,
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  generations: AtomicU64,
  entry_ids: AtomicU64,
}

/// Handle to the query cache. Clones share the same store.
///
/// Fetches and GC timers are spawned onto the current Tokio runtime when there
/// is one. Outside a runtime a started fetch only runs once something awaits
/// it, e.g. a later `refetch` or `fetch_query` on the same key.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

impl QueryClient {
  /// Create a cache whose queries fetch with `default_fn` unless a subscriber
  /// supplies its own.
  pub fn new(config: QueryConfig, default_fn: QueryFn) -> Self {
    Self {
      inner: Arc::new(Inner {
        config,
        default_fn,
        entries: Mutex::new(HashMap::new()),
        generations: AtomicU64::new(0),
        entry_ids: AtomicU64::new(0),
      }),
    }
  }

  /// Cache backed by HTTP GETs that propagate 401s.
  pub fn from_api(api: ApiClient, config: QueryConfig) -> Self {
    Self::new(config, QueryFetcher::new(api, On401::Throw).into_query_fn())
  }

  pub fn config(&self) -> &QueryConfig {
    &self.inner.config
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
    // Entries stay consistent even if a holder panicked; nothing is left half-written.
    self
      .inner
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn entry_mut<'a>(
    &self,
    entries: &'a mut HashMap<QueryKey, CacheEntry>,
    key: &QueryKey,
    query_fn: Option<QueryFn>,
  ) -> &'a mut CacheEntry {
    let entry = entries.entry(key.clone()).or_insert_with(|| {
      let id = self.inner.entry_ids.fetch_add(1, Ordering::SeqCst);
      CacheEntry::new(id, key.clone(), Arc::clone(&self.inner.default_fn))
    });
    if let Some(query_fn) = query_fn {
      entry.query_fn = query_fn;
    }
    entry
  }

  // --------------------------------------------------------------------------
  // Subscriptions
  // --------------------------------------------------------------------------

  /// Attach to `key` with the default fetch function.
  pub fn subscribe(&self, key: QueryKey) -> QuerySubscription {
    self.attach(key, None)
  }

  /// Attach to `key`, fetching with `query_fn` (e.g. a fetcher that returns no
  /// data on 401).
  ///
  /// The override applies to the whole entry while this subscription lives; the
  /// most recent override wins. Once the subscription that installed it drops,
  /// the entry goes back to the default fetch function.
  pub fn subscribe_with(&self, key: QueryKey, query_fn: QueryFn) -> QuerySubscription {
    self.attach(key, Some(query_fn))
  }

  fn attach(&self, key: QueryKey, query_fn: Option<QueryFn>) -> QuerySubscription {
    let stale_time = self.inner.config.stale_time();
    let refetch_on_mount = self.inner.config.refetch_on_mount;

    let (entry_id, rx) = {
      let mut entries = self.entries();
      let entry = self.entry_mut(&mut entries, &key, query_fn.clone());
      entry.subscribers += 1;
      entry.idle_since = None;
      let rx = entry.tx.subscribe();

      if entry.state.is_idle() || (refetch_on_mount && entry.is_stale(stale_time)) {
        let _ = self.begin_fetch(entry, false);
      }
      (entry.id, rx)
    };

    QuerySubscription {
      client: self.clone(),
      key,
      entry_id,
      query_fn,
      rx,
    }
  }

  fn detach(&self, key: &QueryKey, entry_id: u64, query_fn: Option<&QueryFn>) {
    let mut entries = self.entries();
    let Some(entry) = entries.get_mut(key) else {
      return;
    };
    // The entry this subscription attached to was removed; a newer one under
    // the same key has its own subscribers.
    if entry.id != entry_id {
      debug!(key = %key, "detaching from a removed entry");
      return;
    }
    entry.subscribers = entry.subscribers.saturating_sub(1);
    if query_fn.is_some_and(|f| Arc::ptr_eq(f, &entry.query_fn)) {
      entry.query_fn = Arc::clone(&self.inner.default_fn);
    }
    if entry.subscribers == 0 && entry.in_flight.is_none() {
      self.schedule_gc(entry);
    }
  }

  // --------------------------------------------------------------------------
  // Fetching
  // --------------------------------------------------------------------------

  /// Start a fetch for `entry`, or join the one already running.
  ///
  /// With `supersede` a new generation starts even if a fetch is in flight; the
  /// older fetch keeps running but its result is discarded on arrival.
  fn begin_fetch(&self, entry: &mut CacheEntry, supersede: bool) -> SharedFetch {
    if let Some(in_flight) = &entry.in_flight {
      if !supersede {
        debug!(key = %entry.key, generation = in_flight.generation, "joining in-flight fetch");
        return in_flight.future.clone();
      }
      debug!(key = %entry.key, generation = in_flight.generation, "superseding in-flight fetch");
    }

    let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
    entry.generation = generation;
    entry.state.status = QueryStatus::Loading;
    entry.publish();

    debug!(key = %entry.key, hash = %entry.key.cache_hash(), generation, "starting fetch");
    let future = self
      .clone()
      .run_fetch(entry.key.clone(), generation, Arc::clone(&entry.query_fn))
      .boxed()
      .shared();
    entry.in_flight = Some(InFlight {
      generation,
      future: future.clone(),
    });

    // Drive the fetch even if no caller awaits it.
    match Handle::try_current() {
      Ok(handle) => {
        let driver = future.clone();
        handle.spawn(async move {
          let _ = driver.await;
        });
      }
      Err(_) => debug!(key = %entry.key, generation, "no runtime, fetch runs when awaited"),
    }

    future
  }

  async fn run_fetch(self, key: QueryKey, generation: u64, query_fn: QueryFn) -> FetchResult {
    let policy = self.inner.config.retry;
    let mut attempt = 0;

    loop {
      let err = match query_fn(&key).await {
        Ok(data) => {
          self.commit_success(&key, generation, data.clone());
          return Ok(data);
        }
        Err(err) => err,
      };

      if !policy.should_retry(attempt, &err, OperationKind::Read) {
        self.commit_error(&key, generation, attempt + 1, &err);
        return Err(err);
      }

      if !self.record_failure(&key, generation, attempt + 1) {
        debug!(key = %key, generation, "fetch superseded, not retrying");
        return Err(err);
      }

      let delay = policy.delay_for(attempt, OperationKind::Read);
      warn!(
        key = %key,
        attempt,
        delay = ?delay,
        error = %err,
        "fetch failed, retrying"
      );
      tokio::time::sleep(delay).await;

      if !self.is_current(&key, generation) {
        debug!(key = %key, generation, "fetch superseded during backoff, not retrying");
        return Err(err);
      }
      attempt += 1;
    }
  }

  fn is_current(&self, key: &QueryKey, generation: u64) -> bool {
    let mut entries = self.entries();
    Self::current_entry(&mut entries, key, generation).is_some()
  }

  /// Look up the entry a fetch of `generation` may still write to.
  fn current_entry<'a>(
    entries: &'a mut HashMap<QueryKey, CacheEntry>,
    key: &QueryKey,
    generation: u64,
  ) -> Option<&'a mut CacheEntry> {
    match entries.get_mut(key) {
      Some(entry) if entry.generation == generation => Some(entry),
      Some(_) => {
        debug!(key = %key, generation, "discarding superseded fetch result");
        None
      }
      None => {
        debug!(key = %key, generation, "query removed before fetch completed");
        None
      }
    }
  }

  fn commit_success(&self, key: &QueryKey, generation: u64, data: Option<Value>) {
    let mut entries = self.entries();
    let Some(entry) = Self::current_entry(&mut entries, key, generation) else {
      return;
    };

    entry.in_flight = None;
    entry.fetched_at = Some(Instant::now());
    entry.invalidated = false;
    entry.state = QueryState {
      status: QueryStatus::Success,
      data,
      error: None,
      last_fetched_at: Some(Utc::now()),
      attempt_count: 0,
    };
    entry.publish();

    if entry.subscribers == 0 {
      self.schedule_gc(entry);
    }
  }

  fn commit_error(&self, key: &QueryKey, generation: u64, failures: u32, err: &ApiError) {
    let mut entries = self.entries();
    let Some(entry) = Self::current_entry(&mut entries, key, generation) else {
      return;
    };

    warn!(key = %key, failures, error = %err, "query failed");
    entry.in_flight = None;
    entry.state.status = QueryStatus::Error;
    entry.state.error = Some(err.record());
    entry.state.attempt_count = failures;
    entry.publish();

    if entry.subscribers == 0 {
      self.schedule_gc(entry);
    }
  }

  /// Returns false when the fetch has been superseded and must stop retrying.
  fn record_failure(&self, key: &QueryKey, generation: u64, failures: u32) -> bool {
    let mut entries = self.entries();
    match Self::current_entry(&mut entries, key, generation) {
      Some(entry) => {
        entry.state.attempt_count = failures;
        entry.publish();
        true
      }
      None => false,
    }
  }

  /// Cached data if fresh, otherwise fetch (joining any in-flight fetch).
  pub async fn fetch_query(&self, key: &QueryKey) -> FetchResult {
    let fetch = {
      let mut entries = self.entries();
      let stale_time = self.inner.config.stale_time();
      let entry = self.entry_mut(&mut entries, key, None);
      if entry.in_flight.is_none() && !entry.is_stale(stale_time) {
        return Ok(entry.state.data.clone());
      }
      self.begin_fetch(entry, false)
    };
    fetch.await
  }

  /// Explicit refetch. Joins a fetch that is already running.
  pub async fn refetch(&self, key: &QueryKey) -> FetchResult {
    let fetch = {
      let mut entries = self.entries();
      let entry = self.entry_mut(&mut entries, key, None);
      self.begin_fetch(entry, false)
    };
    fetch.await
  }

  /// Refetch even if a fetch is running; the newest fetch wins.
  pub async fn force_refetch(&self, key: &QueryKey) -> FetchResult {
    let fetch = {
      let mut entries = self.entries();
      let entry = self.entry_mut(&mut entries, key, None);
      self.begin_fetch(entry, true)
    };
    fetch.await
  }

  // --------------------------------------------------------------------------
  // Invalidation and staleness triggers
  // --------------------------------------------------------------------------

  /// Mark the exact key stale and refetch it if anyone is watching.
  pub async fn invalidate(&self, key: &QueryKey) {
    self.invalidate_matching(|k| k == key).await
  }

  /// Mark every key starting with `prefix` stale and refetch the watched ones.
  pub async fn invalidate_queries(&self, prefix: &QueryKey) {
    self.invalidate_matching(|k| k.starts_with(prefix)).await
  }

  async fn invalidate_matching(&self, matches: impl Fn(&QueryKey) -> bool) {
    let fetches: Vec<SharedFetch> = {
      let mut entries = self.entries();
      entries
        .values_mut()
        .filter(|entry| matches(&entry.key))
        .filter_map(|entry| {
          entry.invalidated = true;
          // A fetch started before the invalidation may carry outdated data.
          (entry.subscribers > 0 || entry.in_flight.is_some())
            .then(|| self.begin_fetch(entry, true))
        })
        .collect()
    };

    debug!(count = fetches.len(), "refetching invalidated queries");
    join_all(fetches).await;
  }

  /// The application window regained focus.
  pub fn on_window_focus(&self) -> usize {
    if !self.inner.config.refetch_on_window_focus {
      return 0;
    }
    self.refetch_stale_watched("window focus")
  }

  /// Network connectivity came back.
  pub fn on_reconnect(&self) -> usize {
    if !self.inner.config.refetch_on_reconnect {
      return 0;
    }
    self.refetch_stale_watched("reconnect")
  }

  fn refetch_stale_watched(&self, trigger: &str) -> usize {
    let stale_time = self.inner.config.stale_time();
    let mut entries = self.entries();
    let mut count = 0;
    for entry in entries.values_mut() {
      if entry.subscribers > 0 && entry.in_flight.is_none() && entry.is_stale(stale_time) {
        let _ = self.begin_fetch(entry, false);
        count += 1;
      }
    }
    debug!(trigger, count, "refetching stale queries");
    count
  }

  // --------------------------------------------------------------------------
  // Writes
  // --------------------------------------------------------------------------

  /// Run a write with the write retry policy, then invalidate `invalidates`
  /// (as key prefixes) if it succeeded.
  pub async fn mutate<F, Fut>(&self, invalidates: &[QueryKey], operation: F) -> FetchResult
  where
    F: Fn() -> Fut,
    Fut: Future<Output = FetchResult>,
  {
    let policy = self.inner.config.retry;
    let mut attempt = 0;

    let result = loop {
      match operation().await {
        Ok(data) => break Ok(data),
        Err(err) if policy.should_retry(attempt, &err, OperationKind::Write) => {
          let delay = policy.delay_for(attempt, OperationKind::Write);
          warn!(
            attempt,
            delay = ?delay,
            error = %err,
            "mutation failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => break Err(err),
      }
    };

    if result.is_ok() {
      for prefix in invalidates {
        self.invalidate_queries(prefix).await;
      }
    }
    result
  }

  // --------------------------------------------------------------------------
  // Direct store access
  // --------------------------------------------------------------------------

  pub fn get_query_data(&self, key: &QueryKey) -> Option<Value> {
    self
      .entries()
      .get(key)
      .and_then(|entry| entry.state.data.clone())
  }

  pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
    self.entries().get(key).map(|entry| entry.state.clone())
  }

  /// Write data into the cache as if it had just been fetched. Any in-flight
  /// fetch for the key is superseded.
  pub fn set_query_data(&self, key: &QueryKey, data: Value) {
    let mut entries = self.entries();
    let entry = self.entry_mut(&mut entries, key, None);

    entry.generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
    entry.in_flight = None;
    entry.fetched_at = Some(Instant::now());
    entry.invalidated = false;
    entry.state = QueryState {
      status: QueryStatus::Success,
      data: Some(data),
      error: None,
      last_fetched_at: Some(Utc::now()),
      attempt_count: 0,
    };
    entry.publish();

    if entry.subscribers == 0 {
      self.schedule_gc(entry);
    }
  }

  pub fn remove_query(&self, key: &QueryKey) -> bool {
    self.entries().remove(key).is_some()
  }

  /// Drop every entry. Open subscriptions keep their last state.
  pub fn clear(&self) {
    self.entries().clear();
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }

  // --------------------------------------------------------------------------
  // Garbage collection
  // --------------------------------------------------------------------------

  fn schedule_gc(&self, entry: &mut CacheEntry) {
    entry.idle_since = Some(Instant::now());

    let Ok(handle) = Handle::try_current() else {
      return;
    };
    let inner = Arc::downgrade(&self.inner);
    let key = entry.key.clone();
    let gc_time = self.inner.config.gc_time();
    handle.spawn(async move {
      tokio::time::sleep(gc_time).await;
      if let Some(inner) = inner.upgrade() {
        QueryClient { inner }.evict_if_idle(&key);
      }
    });
  }

  fn evict_if_idle(&self, key: &QueryKey) -> bool {
    let gc_time = self.inner.config.gc_time();
    let mut entries = self.entries();
    let expired = entries
      .get(key)
      .is_some_and(|entry| entry.is_collectable(gc_time));
    if expired {
      entries.remove(key);
      debug!(key = %key, "evicted idle query");
    }
    expired
  }

  /// Evict every entry idle past the GC window. Returns the number removed.
  pub fn collect_garbage(&self) -> usize {
    let gc_time = self.inner.config.gc_time();
    let mut entries = self.entries();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_collectable(gc_time));
    let removed = before - entries.len();
    if removed > 0 {
      debug!(removed, "collected idle queries");
    }
    removed
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("config", &self.inner.config)
      .field("entries", &self.len())
      .finish_non_exhaustive()
  }
}

/// A live subscription to one query. Dropping it detaches from the entry.
pub struct QuerySubscription {
  client: QueryClient,
  key: QueryKey,
  entry_id: u64,
  query_fn: Option<QueryFn>,
  rx: watch::Receiver<QueryState>,
}

impl QuerySubscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Current state of the entry.
  pub fn state(&self) -> QueryState {
    self.rx.borrow().clone()
  }

  /// Wait for the next state change. `None` once the entry has been removed.
  pub async fn changed(&mut self) -> Option<QueryState> {
    self.rx.changed().await.ok()?;
    Some(self.rx.borrow_and_update().clone())
  }

  /// Wait until no fetch is pending (success or terminal error).
  pub async fn settled(&mut self) -> QueryState {
    if let Ok(state) = self.rx.wait_for(QueryState::is_settled).await {
      return state.clone();
    }
    self.state()
  }

  /// Explicitly refetch this subscription's query.
  pub async fn refetch(&self) -> FetchResult {
    self.client.refetch(&self.key).await
  }
}

impl Drop for QuerySubscription {
  fn drop(&mut self) {
    self
      .client
      .detach(&self.key, self.entry_id, self.query_fn.as_ref());
  }
}

impl std::fmt::Debug for QuerySubscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuerySubscription")
      .field("key", &self.key)
      .field("state", &*self.rx.borrow())
      .finish()
  }
}
