//! Named locks and semaphores with timeouts.
//!
//! The [`ConcurrencyManager`] lazily creates one primitive per name in three
//! namespaces:
//!
//! - exclusive locks (`tokio::sync::Mutex`), at most one holder per name
//! - shared locks (`tokio::sync::RwLock` read side), any number of holders
//! - semaphores (`tokio::sync::Semaphore`), capacity fixed on first reference
//!
//! Every held permit is recorded in the manager under a [`HolderId`]. Scoped
//! acquisition returns a [`LockGuard`] that releases on drop; the unscoped
//! `acquire`/`release` pair and [`cleanup_stale`](ConcurrencyManager::cleanup_stale)
//! release through the same record, so a force-released guard drops cleanly.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedSemaphorePermit, RwLock,
    Semaphore,
};
use tracing::{debug, info, warn};

use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use crate::config::ConcurrencySettings;

/// Error returned by lock and semaphore acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    /// The lock was not acquired in time; the protected section was not entered
    #[error("timed out after {:.1}s waiting for lock '{name}'", .timeout.as_secs_f64())]
    LockTimeout {
        /// Lock name
        name: String,
        /// Timeout that elapsed
        timeout: Duration,
    },
    /// The semaphore was not acquired in time
    #[error("timed out after {:.1}s waiting for semaphore '{name}'", .timeout.as_secs_f64())]
    SemaphoreTimeout {
        /// Semaphore name
        name: String,
        /// Timeout that elapsed
        timeout: Duration,
    },
    /// Creating another named lock would exceed `max_locks` names in use
    #[error("maximum number of locks reached: {max}")]
    CapacityExceeded {
        /// Configured cap
        max: usize,
    },
    /// The manager was shut down
    #[error("concurrency manager is shut down")]
    ShutDown,
}

/// Identifies one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder-{}", self.0)
    }
}

/// Namespace a primitive lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Exclusive named lock
    Exclusive,
    /// Shared named lock
    Shared,
    /// Counting semaphore
    Semaphore,
}

/// Ownership record of one held primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Primitive name
    pub name: String,
    /// Namespace
    pub kind: LockKind,
    /// Acquisition identity
    pub holder: HolderId,
    /// When the primitive was acquired
    pub acquired_at: Instant,
    /// Timeout used for the acquisition
    pub timeout: Duration,
}

/// Per-name acquisition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounters {
    /// Successful acquisitions
    pub acquired: u64,
    /// Timed-out acquisitions
    pub timeouts: u64,
    /// Holders force-released by the stale sweep
    pub deadlocks: u64,
}

/// One currently held primitive, as reported by [`ConcurrencyManager::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    /// Ownership record
    pub info: LockInfo,
    /// Time held so far
    pub held_for: Duration,
}

/// Snapshot of the manager's namespaces and counters.
///
/// Lock totals count names currently held or awaited; unused names are evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyStats {
    /// Named exclusive locks in use
    pub total_locks: usize,
    /// Named shared locks in use
    pub total_shared_locks: usize,
    /// Named semaphores created
    pub total_semaphores: usize,
    /// Currently held primitives, oldest first
    pub active: Vec<ActiveLock>,
    /// Counters per name
    pub per_name: BTreeMap<String, LockCounters>,
    /// Configured lock cap
    pub max_locks: usize,
    /// Configured default timeout
    pub default_timeout: Duration,
}

enum Permit {
    Exclusive(OwnedMutexGuard<()>),
    Shared(OwnedRwLockReadGuard<()>),
    Semaphore(OwnedSemaphorePermit),
}

struct Held {
    info: LockInfo,
    _permit: Permit,
}

#[derive(Default)]
struct Primitives {
    exclusive: HashMap<String, Arc<AsyncMutex<()>>>,
    shared: HashMap<String, Arc<RwLock<()>>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    counters: HashMap<String, LockCounters>,
}

impl Primitives {
    fn lock_count(&self) -> usize {
        self.exclusive.len() + self.shared.len()
    }

    fn counters(&mut self, name: &str) -> &mut LockCounters {
        self.counters.entry(name.to_string()).or_default()
    }
}

struct ManagerInner {
    primitives: Mutex<Primitives>,
    held: Mutex<HashMap<HolderId, Held>>,
    next_holder: AtomicU64,
    closed: AtomicBool,
    settings: ConcurrencySettings,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl ManagerInner {
    fn release_holder(&self, holder: HolderId) -> Option<LockInfo> {
        // Permit drops after the map lock is released
        let Held { info, _permit } = self.held.lock().remove(&holder)?;
        drop(_permit);
        self.evict_idle(&info.name, info.kind);
        debug!(lock = %info.name, holder = %holder, "lock released");
        Some(info)
    }

    // Holders and waiters each keep a clone of the primitive, so a count of one
    // means the name is unused and no longer counts toward `max_locks`
    fn evict_idle(&self, name: &str, kind: LockKind) {
        let mut primitives = self.primitives.lock();
        let evicted = match kind {
            LockKind::Exclusive => evict_unused(&mut primitives.exclusive, name),
            LockKind::Shared => evict_unused(&mut primitives.shared, name),
            LockKind::Semaphore => false,
        };
        if evicted {
            debug!(lock = name, ?kind, "idle lock evicted");
        }
    }

    fn oldest_holder(&self, name: &str, kinds: &[LockKind]) -> Option<HolderId> {
        self.held
            .lock()
            .values()
            .filter(|held| held.info.name == name && kinds.contains(&held.info.kind))
            .min_by_key(|held| (held.info.acquired_at, held.info.holder))
            .map(|held| held.info.holder)
    }
}

fn evict_unused<T>(map: &mut HashMap<String, Arc<T>>, name: &str) -> bool {
    if map.get(name).is_some_and(|primitive| Arc::strong_count(primitive) == 1) {
        map.remove(name);
        true
    } else {
        false
    }
}

/// Registry of named async locks and semaphores.
///
/// Cloning is cheap; clones share the same namespaces.
#[derive(Clone)]
pub struct ConcurrencyManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("settings", &self.inner.settings)
            .field("held", &self.inner.held.lock().len())
            .finish()
    }
}

/// Scoped ownership of a lock or semaphore permit. Releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    inner: Arc<ManagerInner>,
    holder: HolderId,
    name: String,
    kind: LockKind,
}

impl LockGuard {
    /// Acquisition identity.
    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Primitive name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace of the primitive.
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder", &self.holder)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.inner.release_holder(self.holder);
    }
}

impl ConcurrencyManager {
    /// Create an empty manager.
    pub fn new(settings: ConcurrencySettings, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                primitives: Mutex::new(Primitives::default()),
                held: Mutex::new(HashMap::new()),
                next_holder: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                settings,
                clock,
                metrics,
            }),
        }
    }

    /// Acquire a named lock and hold it until the guard drops.
    ///
    /// `timeout` defaults to the configured `default_timeout`.
    ///
    /// # Errors
    /// [`ConcurrencyError::LockTimeout`] if the lock is not acquired in time,
    /// [`ConcurrencyError::CapacityExceeded`] if the name would exceed `max_locks`,
    /// [`ConcurrencyError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn with_lock(
        &self,
        name: &str,
        timeout: Option<Duration>,
        shared: bool,
    ) -> Result<LockGuard, ConcurrencyError> {
        let holder = self.try_acquire(name, timeout, shared).await?;
        Ok(self.guard(holder, name, if shared { LockKind::Shared } else { LockKind::Exclusive }))
    }

    /// Acquire one permit of a named semaphore and hold it until the guard drops.
    ///
    /// `capacity` only applies when the semaphore is first created.
    pub async fn with_semaphore(
        &self,
        name: &str,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> Result<LockGuard, ConcurrencyError> {
        let holder = self.try_acquire_semaphore(name, capacity, timeout).await?;
        Ok(self.guard(holder, name, LockKind::Semaphore))
    }

    /// Acquire a named lock without a scope. Pair with [`release`](Self::release).
    pub async fn try_acquire(
        &self,
        name: &str,
        timeout: Option<Duration>,
        shared: bool,
    ) -> Result<HolderId, ConcurrencyError> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.inner.settings.default_timeout);

        let acquired = if shared {
            let lock = self.shared_lock(name)?;
            tokio::time::timeout(timeout, lock.read_owned())
                .await
                .map(Permit::Shared)
        } else {
            let lock = self.exclusive_lock(name)?;
            tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map(Permit::Exclusive)
        };

        let kind = if shared { LockKind::Shared } else { LockKind::Exclusive };
        match acquired {
            Ok(permit) => self.record(name, kind, timeout, permit),
            Err(_) => {
                self.inner.evict_idle(name, kind);
                self.record_timeout(name, timeout, "lock");
                Err(ConcurrencyError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Boolean form of [`try_acquire`](Self::try_acquire).
    pub async fn acquire(&self, name: &str, timeout: Option<Duration>, shared: bool) -> bool {
        self.try_acquire(name, timeout, shared).await.is_ok()
    }

    /// Release the oldest holder of a named lock (exclusive namespace first).
    ///
    /// Returns `false` if nothing by that name is held.
    pub fn release(&self, name: &str) -> bool {
        let holder = self
            .inner
            .oldest_holder(name, &[LockKind::Exclusive])
            .or_else(|| self.inner.oldest_holder(name, &[LockKind::Shared]));
        match holder {
            Some(holder) => self.inner.release_holder(holder).is_some(),
            None => {
                warn!(lock = name, "lock not found");
                false
            }
        }
    }

    /// Acquire one permit of a named semaphore without a scope.
    pub async fn try_acquire_semaphore(
        &self,
        name: &str,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> Result<HolderId, ConcurrencyError> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.inner.settings.default_timeout);
        let semaphore = self.semaphore(name, capacity);

        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => self.record(name, LockKind::Semaphore, timeout, Permit::Semaphore(permit)),
            Ok(Err(_closed)) => Err(ConcurrencyError::ShutDown),
            Err(_) => {
                self.record_timeout(name, timeout, "semaphore");
                Err(ConcurrencyError::SemaphoreTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Boolean form of [`try_acquire_semaphore`](Self::try_acquire_semaphore).
    pub async fn acquire_semaphore(
        &self,
        name: &str,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> bool {
        self.try_acquire_semaphore(name, capacity, timeout)
            .await
            .is_ok()
    }

    /// Return the oldest held permit of a named semaphore.
    pub fn release_semaphore(&self, name: &str) -> bool {
        match self.inner.oldest_holder(name, &[LockKind::Semaphore]) {
            Some(holder) => self.inner.release_holder(holder).is_some(),
            None => {
                warn!(semaphore = name, "semaphore not held");
                false
            }
        }
    }

    /// Release one specific acquisition.
    pub fn release_holder(&self, holder: HolderId) -> bool {
        self.inner.release_holder(holder).is_some()
    }

    /// Force-release every primitive held longer than `max_age`.
    ///
    /// Each release is counted as a possible deadlock. Returns the number released.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = self.inner.clock.now();
        let stale: Vec<HolderId> = self
            .inner
            .held
            .lock()
            .values()
            .filter(|held| now.saturating_duration_since(held.info.acquired_at) > max_age)
            .map(|held| held.info.holder)
            .collect();

        let mut released = 0;
        for holder in stale {
            if let Some(info) = self.inner.release_holder(holder) {
                warn!(
                    lock = %info.name,
                    holder = %holder,
                    held_secs = now.saturating_duration_since(info.acquired_at).as_secs_f64(),
                    "cleaning up stale lock"
                );
                self.inner.primitives.lock().counters(&info.name).deadlocks += 1;
                self.inner.metrics.record_stale_lock();
                released += 1;
            }
        }
        released
    }

    /// Snapshot of namespaces, holders and counters.
    pub fn stats(&self) -> ConcurrencyStats {
        let now = self.inner.clock.now();
        let mut active: Vec<ActiveLock> = self
            .inner
            .held
            .lock()
            .values()
            .map(|held| ActiveLock {
                info: held.info.clone(),
                held_for: now.saturating_duration_since(held.info.acquired_at),
            })
            .collect();
        active.sort_by_key(|lock| (lock.info.acquired_at, lock.info.holder));

        let primitives = self.inner.primitives.lock();
        ConcurrencyStats {
            total_locks: primitives.exclusive.len(),
            total_shared_locks: primitives.shared.len(),
            total_semaphores: primitives.semaphores.len(),
            active,
            per_name: primitives
                .counters
                .iter()
                .map(|(name, counters)| (name.clone(), *counters))
                .collect(),
            max_locks: self.inner.settings.max_locks,
            default_timeout: self.inner.settings.default_timeout,
        }
    }

    /// Release every held primitive, clear the namespaces and refuse new acquisitions.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let held: Vec<Held> = self.inner.held.lock().drain().map(|(_, held)| held).collect();
        let released = held.len();
        drop(held);

        let mut primitives = self.inner.primitives.lock();
        for semaphore in primitives.semaphores.values() {
            semaphore.close();
        }
        primitives.exclusive.clear();
        primitives.shared.clear();
        primitives.semaphores.clear();
        info!(released, "concurrency manager shut down");
    }

    /// Applied settings.
    pub fn settings(&self) -> &ConcurrencySettings {
        &self.inner.settings
    }

    fn ensure_open(&self) -> Result<(), ConcurrencyError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(ConcurrencyError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn exclusive_lock(&self, name: &str) -> Result<Arc<AsyncMutex<()>>, ConcurrencyError> {
        let mut primitives = self.inner.primitives.lock();
        if let Some(lock) = primitives.exclusive.get(name) {
            return Ok(Arc::clone(lock));
        }
        self.check_capacity(&primitives)?;
        let lock = Arc::new(AsyncMutex::new(()));
        primitives.exclusive.insert(name.to_string(), Arc::clone(&lock));
        Ok(lock)
    }

    fn shared_lock(&self, name: &str) -> Result<Arc<RwLock<()>>, ConcurrencyError> {
        let mut primitives = self.inner.primitives.lock();
        if let Some(lock) = primitives.shared.get(name) {
            return Ok(Arc::clone(lock));
        }
        self.check_capacity(&primitives)?;
        let lock = Arc::new(RwLock::new(()));
        primitives.shared.insert(name.to_string(), Arc::clone(&lock));
        Ok(lock)
    }

    fn semaphore(&self, name: &str, capacity: usize) -> Arc<Semaphore> {
        let mut primitives = self.inner.primitives.lock();
        let semaphore = primitives
            .semaphores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(capacity.max(1))));
        Arc::clone(semaphore)
    }

    fn check_capacity(&self, primitives: &Primitives) -> Result<(), ConcurrencyError> {
        let max = self.inner.settings.max_locks;
        if primitives.lock_count() >= max {
            warn!(max, "maximum number of locks reached");
            return Err(ConcurrencyError::CapacityExceeded { max });
        }
        Ok(())
    }

    fn record(
        &self,
        name: &str,
        kind: LockKind,
        timeout: Duration,
        permit: Permit,
    ) -> Result<HolderId, ConcurrencyError> {
        // A waiter may be woken after shutdown drained the namespaces
        self.ensure_open()?;

        let holder = HolderId(self.inner.next_holder.fetch_add(1, Ordering::Relaxed));
        let info = LockInfo {
            name: name.to_string(),
            kind,
            holder,
            acquired_at: self.inner.clock.now(),
            timeout,
        };
        self.inner.held.lock().insert(
            holder,
            Held {
                info,
                _permit: permit,
            },
        );
        self.inner.primitives.lock().counters(name).acquired += 1;
        self.inner.metrics.record_lock_acquired();
        debug!(lock = name, holder = %holder, ?kind, "lock acquired");
        Ok(holder)
    }

    fn record_timeout(&self, name: &str, timeout: Duration, what: &'static str) {
        self.inner.primitives.lock().counters(name).timeouts += 1;
        self.inner.metrics.record_lock_timeout();
        warn!(
            lock = name,
            kind = what,
            timeout_secs = timeout.as_secs_f64(),
            "acquisition timed out"
        );
    }

    fn guard(&self, holder: HolderId, name: &str, kind: LockKind) -> LockGuard {
        LockGuard {
            inner: Arc::clone(&self.inner),
            holder,
            name: name.to_string(),
            kind,
        }
    }
}
