//! Pooled resources and the factory that produces them.

use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Creates, checks and disposes of the handles a [`super::ConnectionPool`] manages.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    async fn create(&self) -> anyhow::Result<Self::Handle>;

    /// Lightweight liveness probe, run on every release and by the health sweeper.
    async fn health_check(&self, handle: &Self::Handle) -> bool;

    async fn close(&self, _handle: Self::Handle) {}
}

/// Factory for pools that only bound concurrency and hold no real connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResourceFactory;

#[async_trait]
impl ResourceFactory for NoopResourceFactory {
    type Handle = ();

    async fn create(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self, _handle: &()) -> bool {
        true
    }
}

/// A resource owned by the pool.
///
/// While checked out the caller owns the value and must hand it back with
/// [`super::ConnectionPool::release`]; a dropped resource keeps its slot busy.
#[derive(Debug)]
pub struct PooledResource<H> {
    id: u64,
    handle: H,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    healthy: bool,
}

impl<H> PooledResource<H> {
    pub(crate) fn new(id: u64, handle: H) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            healthy: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
        self.use_count = self.use_count.saturating_add(1);
    }

    pub(crate) fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}
