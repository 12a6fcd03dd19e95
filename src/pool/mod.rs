//! 资源池模块：管理有界、可复用、带健康检查的连接资源，并以 FIFO 方式服务等待者。
//!
//! # Connection Pool
//!
//! [`ConnectionPool`] owns a bounded set of resources produced by a
//! [`ResourceFactory`]. Every resource is either *available* or *busy*, never
//! both, and `available + busy + pending creations` never exceeds
//! `max_connections`.
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`ConnectionPool::acquire`] | Least-used healthy resource, else create, else wait FIFO until timeout |
//! | [`ConnectionPool::release`] | Health-check, then serve the oldest waiter or return to the available set |
//! | [`ConnectionPool::pre_warm`] | Create resources ahead of demand |
//! | [`ConnectionPool::health_sweep`] | Check idle resources, evict extras above `min_connections`, replace losses |
//!
//! All set mutations and waiter hand-offs happen under one mutex, so a waiter
//! and a concurrent `acquire` can never receive the same resource. Factory calls
//! (create, health check, close) always run outside the lock.

mod resource;

pub use resource::{NoopResourceFactory, PooledResource, ResourceFactory};

use crate::error::ErrorContext;
use crate::events::{emit, noop_sink, RuntimeEvent, SharedEventSink};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    /// Idle resources above `min_connections` are evicted after this long.
    pub idle_timeout_ms: Option<u64>,
    /// Resources older than this are retired on release or sweep.
    pub max_lifetime_ms: Option<u64>,
    pub health_check_interval_ms: u64,
    /// Upper bound on replacement creations started per release or sweep.
    pub max_replacements_per_cycle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: Some(300_000),
            max_lifetime_ms: None,
            health_check_interval_ms: 30_000,
            max_replacements_per_cycle: 2,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }
    pub fn with_acquire_timeout(mut self, d: Duration) -> Self {
        self.acquire_timeout_ms = d.as_millis() as u64;
        self
    }
    pub fn with_idle_timeout(mut self, d: Option<Duration>) -> Self {
        self.idle_timeout_ms = d.map(|d| d.as_millis() as u64);
        self
    }
    pub fn with_max_lifetime(mut self, d: Option<Duration>) -> Self {
        self.max_lifetime_ms = d.map(|d| d.as_millis() as u64);
        self
    }
    pub fn with_health_check_interval(mut self, d: Duration) -> Self {
        self.health_check_interval_ms = d.as_millis() as u64;
        self
    }
    pub fn with_max_replacements_per_cycle(mut self, n: usize) -> Self {
        self.max_replacements_per_cycle = n;
        self
    }
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_ms.map(Duration::from_millis)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub busy: usize,
    pub pending_creates: usize,
    pub waiters: usize,
    pub max_connections: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.available + self.busy + self.pending_creates
    }

    /// Demand relative to capacity in `0.0..=1.0`; used as the queue component of a load signal.
    pub fn load(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        ((self.busy + self.waiters) as f64 / self.max_connections as f64).min(1.0)
    }
}

/// What one [`ConnectionPool::health_sweep`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub unhealthy: usize,
    pub evicted: usize,
    pub replacements_started: usize,
}

struct Waiter<H> {
    id: u64,
    tx: oneshot::Sender<PooledResource<H>>,
}

enum Acquire<H> {
    Ready(PooledResource<H>),
    Create,
    Wait(u64, oneshot::Receiver<PooledResource<H>>),
}

struct PoolState<H> {
    available: Vec<PooledResource<H>>,
    busy: HashSet<u64>,
    pending_creates: usize,
    waiters: VecDeque<Waiter<H>>,
    next_waiter_id: u64,
    created_total: u64,
    destroyed_total: u64,
    closed: bool,
}

impl<H> PoolState<H> {
    fn total(&self) -> usize {
        self.available.len() + self.busy.len() + self.pending_creates
    }

    /// Give a busy resource to the oldest live waiter, or park it as available.
    fn hand_off(&mut self, mut res: PooledResource<H>) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(res) {
                Ok(()) => return,
                // Waiter gave up between timing out and taking the lock.
                Err(back) => res = back,
            }
        }
        self.busy.remove(&res.id());
        self.available.push(res);
    }

    fn remove_waiter(&mut self, id: u64) {
        if let Some(pos) = self.waiters.iter().position(|w| w.id == id) {
            self.waiters.remove(pos);
        }
    }

    fn least_used_healthy(&self) -> Option<usize> {
        self.available
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_healthy())
            .min_by_key(|(_, r)| r.use_count())
            .map(|(i, _)| i)
    }
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Handle>>,
    next_resource_id: AtomicU64,
}

/// Bounded, health-checked pool of reusable resources. Cheap to clone.
pub struct ConnectionPool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
    events: SharedEventSink,
}

impl<F: ResourceFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            events: self.events.clone(),
        }
    }
}

impl<F: ResourceFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                state: Mutex::new(PoolState {
                    available: Vec::with_capacity(config.max_connections),
                    busy: HashSet::new(),
                    pending_creates: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    created_total: 0,
                    destroyed_total: 0,
                    closed: false,
                }),
                config,
                next_resource_id: AtomicU64::new(1),
            }),
            events: noop_sink(),
        }
    }

    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Handle>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.lock();
        PoolStats {
            available: st.available.len(),
            busy: st.busy.len(),
            pending_creates: st.pending_creates,
            waiters: st.waiters.len(),
            max_connections: self.inner.config.max_connections,
            created_total: st.created_total,
            destroyed_total: st.destroyed_total,
        }
    }

    pub async fn acquire(&self) -> Result<PooledResource<F::Handle>> {
        self.acquire_timeout(self.inner.config.acquire_timeout())
            .await
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledResource<F::Handle>> {
        let started = Instant::now();

        let next = {
            let mut st = self.lock();
            if st.closed {
                return Err(closed_error());
            }
            if let Some(pos) = st.least_used_healthy() {
                let mut res = st.available.swap_remove(pos);
                st.busy.insert(res.id());
                res.touch();
                Acquire::Ready(res)
            } else if st.total() < self.inner.config.max_connections {
                st.pending_creates += 1;
                Acquire::Create
            } else {
                let (tx, rx) = oneshot::channel();
                let id = st.next_waiter_id;
                st.next_waiter_id = st.next_waiter_id.wrapping_add(1);
                st.waiters.push_back(Waiter { id, tx });
                Acquire::Wait(id, rx)
            }
        };

        let (id, rx) = match next {
            Acquire::Ready(res) => return Ok(res),
            Acquire::Create => return self.create_for_caller(timeout, started).await,
            Acquire::Wait(id, rx) => (id, rx),
        };

        let mut ticket = WaitTicket {
            pool: self,
            id,
            rx,
            done: false,
        };
        let outcome = tokio::time::timeout(timeout, &mut ticket.rx).await;
        ticket.done = true;
        match outcome {
            Ok(Ok(mut res)) => {
                res.touch();
                Ok(res)
            }
            Ok(Err(_)) => Err(closed_error()),
            Err(_) => {
                let handed = {
                    let mut st = self.lock();
                    st.remove_waiter(ticket.id);
                    // Hand-offs happen under the lock, so anything sent is already buffered.
                    ticket.rx.try_recv().ok()
                };
                if let Some(mut res) = handed {
                    res.touch();
                    return Ok(res);
                }
                self.exhausted(started).await
            }
        }
    }

    async fn exhausted(&self, started: Instant) -> Result<PooledResource<F::Handle>> {
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(waited_ms, "connection pool exhausted");
        emit(&self.events, RuntimeEvent::PoolExhausted { waited_ms }).await;
        Err(Error::ResourceTimeout { waited_ms })
    }

    /// Create a resource for an acquire that reserved a slot, within `timeout`.
    ///
    /// A new resource that fails its first health check is closed and reported
    /// as [`Error::ResourceUnhealthy`].
    async fn create_for_caller(
        &self,
        timeout: Duration,
        started: Instant,
    ) -> Result<PooledResource<F::Handle>> {
        let created = match tokio::time::timeout(timeout, self.create_reserved()).await {
            Ok(created) => created?,
            Err(_) => return self.exhausted(started).await,
        };
        // Guarded so a caller dropped mid-check still returns the resource.
        let guard = PoolGuard {
            pool: self.clone(),
            resource: Some(created),
        };
        let healthy = match guard.handle() {
            Some(handle) => self.inner.factory.health_check(handle).await,
            None => false,
        };
        let Some(mut res) = guard.into_resource() else {
            return Err(Error::runtime("pooled resource already released"));
        };
        if !healthy {
            let resource_id = res.id();
            warn!(resource_id, "new resource failed its health check");
            {
                let mut st = self.lock();
                st.busy.remove(&resource_id);
                st.destroyed_total += 1;
            }
            self.inner.factory.close(res.into_handle()).await;
            self.spawn_replacements(1);
            return Err(Error::ResourceUnhealthy { resource_id });
        }
        res.touch();
        Ok(res)
    }

    /// Run the factory for a slot already counted in `pending_creates`. The new
    /// resource moves straight into `busy` so the slot stays counted.
    ///
    /// Dropping the future before the factory returns gives the slot back.
    async fn create_reserved(&self) -> Result<PooledResource<F::Handle>> {
        let mut reservation = CreateReservation {
            pool: self,
            done: false,
        };
        let created = self.inner.factory.create().await;
        reservation.done = true;
        let mut st = self.lock();
        st.pending_creates = st.pending_creates.saturating_sub(1);
        match created {
            Ok(handle) => {
                st.created_total += 1;
                let id = self.inner.next_resource_id.fetch_add(1, Ordering::Relaxed);
                st.busy.insert(id);
                debug!(resource_id = id, "pooled resource created");
                Ok(PooledResource::new(id, handle))
            }
            Err(e) => Err(Error::runtime_with_context(
                format!("resource creation failed: {:#}", e),
                ErrorContext::new().with_source("connection_pool"),
            )),
        }
    }

    /// Return a checked-out resource.
    ///
    /// Unhealthy or expired resources are closed and replaced in the background.
    pub async fn release(&self, mut res: PooledResource<F::Handle>) {
        let healthy = self.inner.factory.health_check(res.handle()).await;
        let expired = self.expired(&res);
        res.set_healthy(healthy);

        let closed = {
            let mut st = self.lock();
            if healthy && !expired && !st.closed {
                st.hand_off(res);
                return;
            }
            st.busy.remove(&res.id());
            st.destroyed_total += 1;
            st.closed
        };
        if closed {
            self.inner.factory.close(res.into_handle()).await;
            return;
        }
        if expired && healthy {
            debug!(resource_id = res.id(), "retiring resource past max lifetime");
        } else {
            warn!(resource_id = res.id(), "discarding unhealthy resource");
        }
        self.inner.factory.close(res.into_handle()).await;
        self.spawn_replacements(1);
    }

    fn expired(&self, res: &PooledResource<F::Handle>) -> bool {
        self.inner
            .config
            .max_lifetime()
            .is_some_and(|max| res.age() >= max)
    }

    /// Start up to `wanted` background creations, bounded per cycle, and only
    /// while the pool is below `min_connections` or has waiters.
    fn spawn_replacements(&self, wanted: usize) -> usize {
        let cap = wanted.min(self.inner.config.max_replacements_per_cycle);
        let mut started = 0;
        {
            let mut st = self.lock();
            while started < cap
                && !st.closed
                && st.total() < self.inner.config.max_connections
                && (st.total() < self.inner.config.min_connections || st.waiters.len() > started)
            {
                st.pending_creates += 1;
                started += 1;
            }
        }
        for _ in 0..started {
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.create_reserved().await {
                    Ok(res) => pool.lock().hand_off(res),
                    Err(e) => warn!(error = %e, "replacement resource creation failed"),
                }
            });
        }
        started
    }

    /// Create up to `n` resources ahead of demand; returns how many were added.
    pub async fn pre_warm(&self, n: usize) -> usize {
        let reserved = {
            let mut st = self.lock();
            let room = self.inner.config.max_connections.saturating_sub(st.total());
            let take = n.min(room);
            st.pending_creates += take;
            take
        };
        let created = futures::future::join_all((0..reserved).map(|_| self.create_reserved())).await;
        let mut added = 0;
        let mut st = self.lock();
        for res in created {
            match res {
                Ok(res) => {
                    st.hand_off(res);
                    added += 1;
                }
                Err(e) => warn!(error = %e, "pre-warm creation failed"),
            }
        }
        info!(requested = n, added, "connection pool pre-warmed");
        added
    }

    /// Check every idle resource once, evict idle extras above `min_connections`,
    /// retire expired ones and start a bounded number of replacements.
    pub async fn health_sweep(&self) -> SweepReport {
        // Check idle resources out as the sweeper so nobody acquires them mid-check.
        let idle = {
            let mut st = self.lock();
            let idle = std::mem::take(&mut st.available);
            for r in &idle {
                st.busy.insert(r.id());
            }
            idle
        };

        let mut report = SweepReport {
            checked: idle.len(),
            ..SweepReport::default()
        };
        let mut checked = Vec::with_capacity(idle.len());
        for mut res in idle {
            let healthy = self.inner.factory.health_check(res.handle()).await;
            res.set_healthy(healthy);
            checked.push(res);
        }

        let idle_timeout = self.inner.config.idle_timeout();
        let min = self.inner.config.min_connections;
        let mut discard = Vec::new();
        {
            let mut st = self.lock();
            for res in checked {
                let idle_expired = idle_timeout.is_some_and(|t| res.idle_for() >= t);
                let drop_it = if !res.is_healthy() {
                    report.unhealthy += 1;
                    true
                } else if self.expired(&res) || (idle_expired && st.total() > min) {
                    report.evicted += 1;
                    true
                } else {
                    false
                };
                if drop_it || st.closed {
                    st.busy.remove(&res.id());
                    st.destroyed_total += 1;
                    discard.push(res);
                } else {
                    st.hand_off(res);
                }
            }
        }
        for res in discard {
            self.inner.factory.close(res.into_handle()).await;
        }

        let deficit = {
            let st = self.lock();
            min.saturating_sub(st.total()).max(report.unhealthy)
        };
        report.replacements_started = self.spawn_replacements(deficit);
        if report.unhealthy > 0 || report.evicted > 0 {
            info!(
                checked = report.checked,
                unhealthy = report.unhealthy,
                evicted = report.evicted,
                replacements = report.replacements_started,
                "pool health sweep"
            );
        }
        report
    }

    /// Run [`ConnectionPool::health_sweep`] every `health_check_interval` until cancelled.
    pub fn spawn_health_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let every = self.inner.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.health_sweep().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("pool health sweeper stopped");
        })
    }

    /// Close idle resources and fail every waiter; busy resources are closed on release.
    pub async fn close(&self) {
        let idle = {
            let mut st = self.lock();
            st.closed = true;
            st.waiters.clear();
            let idle = std::mem::take(&mut st.available);
            st.destroyed_total += idle.len() as u64;
            idle
        };
        for res in idle {
            self.inner.factory.close(res.into_handle()).await;
        }
    }
}

/// A queued acquire. Dropped mid-wait, it leaves the queue and passes on any
/// resource already handed to it.
struct WaitTicket<'a, F: ResourceFactory> {
    pool: &'a ConnectionPool<F>,
    id: u64,
    rx: oneshot::Receiver<PooledResource<F::Handle>>,
    done: bool,
}

impl<F: ResourceFactory> Drop for WaitTicket<'_, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut st = self.pool.lock();
        st.remove_waiter(self.id);
        self.rx.close();
        if let Ok(res) = self.rx.try_recv() {
            debug!(resource_id = res.id(), "abandoned waiter passed its resource on");
            st.hand_off(res);
        }
    }
}

/// One slot counted in `pending_creates` while the factory runs.
struct CreateReservation<'a, F: ResourceFactory> {
    pool: &'a ConnectionPool<F>,
    done: bool,
}

impl<F: ResourceFactory> Drop for CreateReservation<'_, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let waiting = {
            let mut st = self.pool.lock();
            st.pending_creates = st.pending_creates.saturating_sub(1);
            !st.waiters.is_empty()
        };
        debug!("abandoned resource creation released its slot");
        if waiting && tokio::runtime::Handle::try_current().is_ok() {
            self.pool.spawn_replacements(1);
        }
    }
}

/// A checked-out resource that goes back to its pool when dropped.
///
/// Prefer [`PoolGuard::release`]; dropping spawns the release on the current
/// runtime, which is what happens when a batch future is cancelled by a timeout.
pub struct PoolGuard<F: ResourceFactory> {
    pool: ConnectionPool<F>,
    resource: Option<PooledResource<F::Handle>>,
}

impl<F: ResourceFactory> PoolGuard<F> {
    /// `None` only after the resource has been handed back.
    pub fn resource(&self) -> Option<&PooledResource<F::Handle>> {
        self.resource.as_ref()
    }

    pub fn handle(&self) -> Option<&F::Handle> {
        self.resource.as_ref().map(PooledResource::handle)
    }

    fn into_resource(mut self) -> Option<PooledResource<F::Handle>> {
        self.resource.take()
    }

    pub async fn release(mut self) {
        if let Some(res) = self.resource.take() {
            self.pool.release(res).await;
        }
    }
}

impl<F: ResourceFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        let Some(res) = self.resource.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let pool = self.pool.clone();
                rt.spawn(async move { pool.release(res).await });
            }
            Err(_) => warn!(resource_id = res.id(), "resource dropped outside a runtime; slot stays busy"),
        }
    }
}

impl<F: ResourceFactory> ConnectionPool<F> {
    /// [`ConnectionPool::acquire`] wrapped in a [`PoolGuard`].
    pub async fn acquire_guard(&self) -> Result<PoolGuard<F>> {
        let resource = self.acquire().await?;
        Ok(PoolGuard {
            pool: self.clone(),
            resource: Some(resource),
        })
    }
}

fn closed_error() -> Error {
    Error::runtime_with_context(
        "connection pool is closed",
        ErrorContext::new().with_source("connection_pool"),
    )
}
