//! Connection pool.
//!
//! Idle connections are kept per [`Target`] and handed out most recently
//! used first. Capacity is counted per target and globally; a connection
//! counts against both from the moment its slot is reserved until it is
//! discarded, whether it is idle, in use or still connecting.
//!
//! Expired entries are reaped lazily: on every `acquire` for the touched
//! target, and across all targets at most once per cleaner period.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::Notify;

use crate::{config::PoolConfig, error::TooManyConnections, sync::Mutex, target::Target};

/// A connection the pool can hold.
pub(crate) trait Poolable: Send + 'static {
    /// False once the transport is known to be closed.
    fn is_open(&self) -> bool;
}

/// Process-unique identity of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections checked out by a request.
    pub in_use: usize,
    /// Every slot held: idle, in use, or reserved for a connection being opened.
    pub total: usize,
}

type CloseHook = Box<dyn Fn(ConnectionId) + Send + Sync>;

pub(crate) struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    config: PoolConfig,
    state: Mutex<State<T>>,
    available: Notify,
    on_close: OnceLock<CloseHook>,
}

struct State<T> {
    // Oldest first; the back of each list is the most recently used.
    idle: HashMap<Target, Vec<Idle<T>>>,
    open: HashMap<Target, usize>,
    total: usize,
    in_use: usize,
    last_sweep: Instant,
}

struct Idle<T> {
    value: T,
    meta: Meta,
    idle_at: Instant,
}

#[derive(Debug, Clone)]
struct Meta {
    id: ConnectionId,
    target: Target,
    created_at: Instant,
}

/// A connection checked out of the pool.
///
/// Dropping it without [`Pool::release`] discards the connection.
pub(crate) struct Pooled<T: Poolable> {
    value: Option<T>,
    meta: Meta,
    reused: bool,
    poolable: bool,
    pool: Weak<PoolInner<T>>,
}

/// Capacity claimed for a connection that is still being opened.
pub(crate) struct Reservation<T: Poolable> {
    target: Target,
    pool: Weak<PoolInner<T>>,
    fulfilled: bool,
}

/// The outcome of [`Pool::checkout`].
pub(crate) enum Checkout<T: Poolable> {
    Idle(Pooled<T>),
    Reserved(Reservation<T>),
}

// Connections evicted while the lock was held; dropped (and reported to the
// close hook) after it is released.
type Graveyard<T> = Vec<(ConnectionId, T)>;

impl<T: Poolable> Pool<T> {
    pub(crate) fn new(config: PoolConfig) -> Pool<T> {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(State {
                    idle: HashMap::new(),
                    open: HashMap::new(),
                    total: 0,
                    in_use: 0,
                    last_sweep: Instant::now(),
                }),
                available: Notify::new(),
                on_close: OnceLock::new(),
            }),
        }
    }

    /// Registers the hook called whenever a connection leaves the pool for
    /// good. Only the first registration takes effect.
    pub(crate) fn on_close<F>(&self, hook: F)
    where
        F: Fn(ConnectionId) + Send + Sync + 'static,
    {
        if self.inner.on_close.set(Box::new(hook)).is_err() {
            log::warn!("pool close hook already registered");
        }
    }

    /// Takes the most recently used live idle connection for `target`.
    pub(crate) fn acquire(&self, target: &Target) -> Option<Pooled<T>> {
        let mut dead = Graveyard::new();
        let found = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            if now.duration_since(state.last_sweep) >= self.inner.config.cleaner_period {
                state.last_sweep = now;
                state.sweep(&self.inner.config, now, &mut dead);
            }
            state.reap(target, &self.inner.config, now, &mut dead);

            let entry = state.idle.get_mut(target).and_then(Vec::pop);
            if let Some(ref idle) = entry {
                state.in_use += 1;
                log::trace!("reusing idle connection {} for {}", idle.meta.id, target);
            }
            entry
        };
        self.inner.bury(dead);

        found.map(|idle| Pooled {
            value: Some(idle.value),
            meta: idle.meta,
            reused: true,
            poolable: true,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Claims capacity for a new connection to `target`, evicting the
    /// oldest idle connection when a limit is reached and one can be spared.
    pub(crate) fn reserve(&self, target: &Target) -> Result<Reservation<T>, TooManyConnections> {
        let mut dead = Graveyard::new();
        let reserved = self.inner.state.lock().reserve(target, &self.inner.config, &mut dead);
        self.inner.bury(dead);

        reserved.map(|()| Reservation {
            target: target.clone(),
            pool: Arc::downgrade(&self.inner),
            fulfilled: false,
        })
    }

    /// Either an idle connection for `target` or capacity for a new one.
    ///
    /// With `wait` set, an exhausted pool is retried as connections are
    /// released or discarded until the wait elapses.
    pub(crate) async fn checkout(
        &self,
        target: &Target,
        wait: Option<Duration>,
    ) -> Result<Checkout<T>, TooManyConnections> {
        let attempt = || {
            if let Some(pooled) = self.acquire(target) {
                return Some(Checkout::Idle(pooled));
            }
            self.reserve(target).ok().map(Checkout::Reserved)
        };

        match wait {
            Some(wait) => self.wait_for(wait, attempt).await,
            None => attempt().ok_or(TooManyConnections),
        }
    }

    async fn wait_for<R>(
        &self,
        wait: Duration,
        mut attempt: impl FnMut() -> Option<R>,
    ) -> Result<R, TooManyConnections> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = attempt() {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return attempt().ok_or(TooManyConnections);
            }
        }
    }

    /// Returns a connection to the idle set, or discards it when it cannot
    /// be reused.
    pub(crate) fn release(&self, mut pooled: Pooled<T>) {
        let value = match pooled.value.take() {
            Some(value) => value,
            None => return,
        };
        let config = &self.inner.config;
        let allowed = if pooled.meta.target.is_secure() {
            config.allow_pooling_ssl
        } else {
            config.allow_pooling
        };
        let expired = config
            .connection_ttl
            .map_or(false, |ttl| pooled.meta.created_at.elapsed() > ttl);

        if !pooled.poolable || !allowed || expired || !value.is_open() {
            log::debug!(
                "discarding connection {} to {}",
                pooled.meta.id,
                pooled.meta.target
            );
            self.inner.discard(&pooled.meta, value);
            return;
        }

        {
            let mut state = self.inner.state.lock();
            state.in_use -= 1;
            state
                .idle
                .entry(pooled.meta.target.clone())
                .or_default()
                .push(Idle {
                    value,
                    meta: pooled.meta.clone(),
                    idle_at: Instant::now(),
                });
        }
        log::trace!("connection {} returned to pool", pooled.meta.id);
        self.inner.available.notify_waiters();
    }

    /// Discards a checked-out connection.
    pub(crate) fn remove(&self, pooled: Pooled<T>) {
        drop(pooled);
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.values().map(Vec::len).sum(),
            in_use: state.in_use,
            total: state.total,
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, target: &Target) -> usize {
        let state = self.inner.state.lock();
        state.idle.get(target).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self, target: &Target) -> usize {
        let state = self.inner.state.lock();
        state.open.get(target).copied().unwrap_or(0)
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<T: Poolable> PoolInner<T> {
    fn discard(&self, meta: &Meta, value: T) {
        {
            let mut state = self.state.lock();
            state.in_use -= 1;
            state.forget(&meta.target);
        }
        drop(value);
        self.closed(meta.id);
        self.available.notify_waiters();
    }

    fn bury(&self, dead: Graveyard<T>) {
        if dead.is_empty() {
            return;
        }
        for (id, value) in dead {
            drop(value);
            self.closed(id);
        }
        self.available.notify_waiters();
    }

    fn closed(&self, id: ConnectionId) {
        if let Some(hook) = self.on_close.get() {
            hook(id);
        }
    }
}

impl<T: Poolable> State<T> {
    fn forget(&mut self, target: &Target) {
        self.total -= 1;
        if let Some(open) = self.open.get_mut(target) {
            *open -= 1;
            if *open == 0 {
                self.open.remove(target);
            }
        }
    }

    fn reap(&mut self, target: &Target, config: &PoolConfig, now: Instant, dead: &mut Graveyard<T>) {
        let list = match self.idle.get_mut(target) {
            Some(list) => list,
            None => return,
        };
        let mut evicted = 0;
        let mut i = 0;
        while i < list.len() {
            if list[i].is_expired(config, now) {
                let idle = list.remove(i);
                log::debug!("evicting expired connection {} to {}", idle.meta.id, target);
                dead.push((idle.meta.id, idle.value));
                evicted += 1;
            } else {
                i += 1;
            }
        }
        if list.is_empty() {
            self.idle.remove(target);
        }
        for _ in 0..evicted {
            self.forget(target);
        }
    }

    fn sweep(&mut self, config: &PoolConfig, now: Instant, dead: &mut Graveyard<T>) {
        let targets: Vec<Target> = self.idle.keys().cloned().collect();
        for target in targets {
            self.reap(&target, config, now, dead);
        }
    }

    fn reserve(
        &mut self,
        target: &Target,
        config: &PoolConfig,
        dead: &mut Graveyard<T>,
    ) -> Result<(), TooManyConnections> {
        if let Some(max) = config.max_connections_per_host {
            while self.open.get(target).copied().unwrap_or(0) >= max {
                if !self.evict_oldest(Some(target), dead) {
                    log::debug!("per-host connection limit {} reached for {}", max, target);
                    return Err(TooManyConnections);
                }
            }
        }
        if let Some(max) = config.max_connections {
            while self.total >= max {
                if !self.evict_oldest(None, dead) {
                    log::debug!("connection limit {} reached", max);
                    return Err(TooManyConnections);
                }
            }
        }

        *self.open.entry(target.clone()).or_insert(0) += 1;
        self.total += 1;
        Ok(())
    }

    // FIFO: the connection idle the longest is sacrificed first.
    fn evict_oldest(&mut self, scope: Option<&Target>, dead: &mut Graveyard<T>) -> bool {
        let victim = self
            .idle
            .iter()
            .filter(|(target, list)| scope.map_or(true, |s| s == *target) && !list.is_empty())
            .min_by_key(|(_, list)| list[0].idle_at)
            .map(|(target, _)| target.clone());

        let target = match victim {
            Some(target) => target,
            None => return false,
        };
        if let Some(list) = self.idle.get_mut(&target) {
            let idle = list.remove(0);
            if list.is_empty() {
                self.idle.remove(&target);
            }
            log::debug!("evicting idle connection {} to {} to make room", idle.meta.id, target);
            dead.push((idle.meta.id, idle.value));
            self.forget(&target);
        }
        true
    }
}

impl<T: Poolable> Idle<T> {
    fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        if !self.value.is_open() {
            return true;
        }
        if let Some(timeout) = config.idle_timeout {
            if now.saturating_duration_since(self.idle_at) > timeout {
                return true;
            }
        }
        if let Some(ttl) = config.connection_ttl {
            if now.saturating_duration_since(self.meta.created_at) > ttl {
                return true;
            }
        }
        false
    }
}

impl<T: Poolable> Pooled<T> {
    pub(crate) fn id(&self) -> ConnectionId {
        self.meta.id
    }

    pub(crate) fn target(&self) -> &Target {
        &self.meta.target
    }

    /// True when the connection came out of the idle set.
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    /// Prevents the connection from going back to the idle set.
    pub(crate) fn set_unpoolable(&mut self) {
        self.poolable = false;
    }

    pub(crate) fn is_poolable(&self) -> bool {
        self.poolable && self.value.as_ref().map_or(false, T::is_open)
    }
}

impl<T: Poolable> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("not dropped")
    }
}

impl<T: Poolable> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("not dropped")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            match self.pool.upgrade() {
                Some(pool) => {
                    log::debug!("dropping connection {} to {}", self.meta.id, self.meta.target);
                    pool.discard(&self.meta, value);
                }
                None => drop(value),
            }
        }
    }
}

impl<T: Poolable> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.meta.id)
            .field("target", &self.meta.target)
            .field("reused", &self.reused)
            .finish()
    }
}

impl<T: Poolable> Reservation<T> {
    #[cfg(test)]
    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    /// Turns the reservation into a checked-out connection.
    pub(crate) fn fulfill(mut self, value: T) -> Pooled<T> {
        self.fulfilled = true;
        let meta = Meta {
            id: ConnectionId::next(),
            target: self.target.clone(),
            created_at: Instant::now(),
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.state.lock().in_use += 1;
        }
        log::debug!("new connection {} to {}", meta.id, meta.target);
        Pooled {
            value: Some(value),
            meta,
            reused: false,
            poolable: true,
            pool: self.pool.clone(),
        }
    }
}

impl<T: Poolable> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.state.lock().forget(&self.target);
            pool.available.notify_waiters();
        }
    }
}
