//! Bounded connection pool with background health checking.
//!
//! Idle connections live in a `flume::bounded` channel gated by a
//! `Semaphore` that caps total live connections, and a background task
//! periodically probes a sample of the idle set so a connection that died
//! silently (server restart, firewall reset) is caught before a caller
//! gets it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnState, PgConfig, QueryResult};
use crate::error::{PgError, PgResult};
use crate::wire::types::PgValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Database connection URL
    pub url: String,
    /// Minimum number of connections pre-created at `Pool::connect`
    pub min_connections: u32,
    /// Maximum number of live connections (bounds the idle queue capacity
    /// and the acquire semaphore)
    pub max_connections: u32,
    /// Statement cache capacity per connection
    pub statement_cache_capacity: usize,
    /// Health check tick interval
    pub health_check_interval: Duration,
    /// Probe query run against a sample of idle connections each tick
    pub health_check_query: String,
    /// Maximum number of idle connections sampled per health check tick
    pub health_check_sample_size: usize,
}

impl PoolConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            min_connections: 1,
            max_connections: 10,
            statement_cache_capacity: 100,
            health_check_interval: Duration::from_millis(600_000),
            health_check_query: "SELECT 1".to_string(),
            health_check_sample_size: 4,
        }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn health_check_query(mut self, query: &str) -> Self {
        self.health_check_query = query.to_string();
        self
    }
}

// ============================================================================
// Pool statistics
// ============================================================================

/// Lock-free counters exposed for observability.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub checked: AtomicU64,
    pub alive: AtomicU64,
    /// Connections opened by the health loop to replace one that failed its
    /// probe, not every connection the pool ever opens.
    pub reconnected: AtomicU64,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub retired: AtomicU64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            checked: self.checked.load(Ordering::Relaxed),
            alive: self.alive.load(Ordering::Relaxed),
            reconnected: self.reconnected.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolStats`] for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStatsSnapshot {
    pub checked: u64,
    pub alive: u64,
    pub reconnected: u64,
    pub acquired: u64,
    pub released: u64,
    pub retired: u64,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool. Returned to the idle queue on
/// drop unless it was marked dirty/bad, in which case it is retired.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.conn_mut()?.simple_query(query).await
    }

    pub async fn query(&mut self, query: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.conn_mut()?.query(query, params).await
    }

    pub async fn query_no_sync(
        &mut self,
        query: &str,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.conn_mut()?.query_no_sync(query, params).await
    }

    pub async fn sync(&mut self) -> PgResult<()> {
        self.conn_mut()?.sync().await
    }

    pub async fn begin(&mut self) -> PgResult<()> {
        self.conn_mut()?.begin().await
    }

    pub async fn begin_deferred(&mut self) -> PgResult<()> {
        self.conn_mut()?.begin_deferred().await
    }

    pub async fn query_in_transaction(
        &mut self,
        query: &str,
        params: &[PgValue],
        consume_begin: bool,
    ) -> PgResult<QueryResult> {
        self.conn_mut()?
            .query_in_transaction(query, params, consume_begin)
            .await
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.conn_mut()?.commit().await
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.conn_mut()?.rollback().await
    }

    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().map(|c| c.is_reusable()).unwrap_or(false)
    }

    /// Borrow the underlying connection directly, e.g. for `COPY`/cursor
    /// calls that have no `PooledConnection` forwarding method.
    pub fn connection_mut(&mut self) -> PgResult<&mut Connection> {
        self.conn_mut()
    }

    /// Take ownership of the underlying connection and its semaphore
    /// permit, e.g. to pin it for the lifetime of a transaction. The pool
    /// will not see this connection again until the caller (typically
    /// `Transaction::finish`) returns both via `Pool::release_connection_async`
    /// — holding onto the permit is what keeps it counted against
    /// `live_count` while the transaction is in flight.
    pub fn take(mut self) -> Option<(Connection, OwnedSemaphorePermit)> {
        let conn = self.conn.take()?;
        let permit = self.permit.take()?;
        Some((conn, permit))
    }

    fn conn_mut(&mut self) -> PgResult<&mut Connection> {
        self.conn.as_mut().ok_or(PgError::ConnectionClosed)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_sync(conn);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolInner {
    config: PoolConfig,
    idle_tx: flume::Sender<Connection>,
    idle_rx: flume::Receiver<Connection>,
    semaphore: Arc<Semaphore>,
    stats: PoolStats,
}

impl PoolInner {
    async fn create_connection(&self) -> PgResult<Connection> {
        let mut config = PgConfig::from_url(&self.config.url)?;
        config.statement_cache_capacity = self.config.statement_cache_capacity;
        Connection::connect_with_config(config).await
    }

    /// Non-async release path used from `Drop`: retire a dirty/bad
    /// connection immediately, otherwise push it back (best-effort — if the
    /// bounded channel is full the connection is dropped and its socket
    /// closed by `Connection::drop`, which is a reasonable fallback since
    /// the channel capacity equals `max_connections`).
    fn release_sync(&self, conn: Connection) {
        if !conn.is_reusable() {
            self.stats.retired.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        if self.idle_tx.try_send(conn).is_err() {
            debug!("pool idle queue full, dropping returned connection");
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A bounded pool of PostgreSQL connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Connect and pre-create `min_connections` idle connections.
    pub async fn connect(config: PoolConfig) -> PgResult<Self> {
        let (idle_tx, idle_rx) = flume::bounded(config.max_connections.max(1) as usize);
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle_tx,
            idle_rx,
            stats: PoolStats::default(),
            config,
        });

        let pool = Self { inner };

        for _ in 0..pool.inner.config.min_connections {
            let conn = pool.inner.create_connection().await?;
            let _ = pool.inner.idle_tx.try_send(conn);
        }

        Ok(pool)
    }

    /// Start the background health-check loop. Safe to call once per pool;
    /// the returned `JoinHandle` may be dropped to detach it.
    pub fn start_health_loop(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.health_check_interval);
            loop {
                ticker.tick().await;
                health_check_tick(&inner).await;
            }
        })
    }

    /// Pop an idle connection without growing the pool or waiting.
    pub fn try_acquire(&self) -> Option<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore).try_acquire_owned().ok()?;
        let conn = self.inner.idle_rx.try_recv().ok()?;
        self.inner.stats.acquired.fetch_add(1, Ordering::Relaxed);
        Some(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }

    /// Acquire a connection, waiting for a permit and creating a fresh
    /// connection if the idle queue is empty.
    pub async fn acquire_connection(&self) -> PgResult<PooledConnection> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PgError::Pool("pool is closed".to_string()))?;

        let conn = match self.inner.idle_rx.try_recv() {
            Ok(c) if c.is_reusable() => c,
            _ => self.inner.create_connection().await?,
        };

        self.inner.stats.acquired.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }

    /// Shorter alias for `acquire_connection`.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        self.acquire_connection().await
    }

    /// Release a connection back to the pool, cleaning it up first if it was
    /// left mid-pipeline (e.g. a transaction abandoned mid-`COPY`). Every
    /// non-`Idle` state (`Busy`/`InCopyIn`/`InCopyOut`/`InCursor`/
    /// `Connecting`) means the server is not expecting a fresh `Query` on
    /// the wire, so `release_sync`'s `is_reusable` check alone is not enough;
    /// it only rejects `Dirty`/`Bad`. Where cleanup is cheap and safe
    /// (`CopyFail` for an abandoned `COPY IN`, draining the remaining rows
    /// of an abandoned `COPY OUT`) it's done here. `InCursor` has no cursor
    /// name tracked at this layer to issue `CLOSE` against, so it, like any
    /// other state cleanup that fails, falls through to `mark_dirty` and
    /// is retired instead of risking a hang on a connection whose wire
    /// state can't be fully accounted for.
    pub async fn release_connection_async(&self, mut conn: Connection, permit: OwnedSemaphorePermit) {
        match conn.state() {
            ConnState::Idle => {}
            ConnState::Busy => {
                let _ = conn.drain_async().await;
            }
            ConnState::InCopyIn => {
                let _ = conn.copy_in_abort("connection released mid-COPY IN").await;
            }
            ConnState::InCopyOut => {
                loop {
                    match conn.copy_out_read().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
            }
            ConnState::InCursor | ConnState::Connecting => {
                conn.mark_dirty();
            }
            ConnState::Dirty | ConnState::Bad => {}
        }
        if conn.state() != ConnState::Idle {
            conn.mark_dirty();
        }
        drop(permit);
        self.inner.release_sync(conn);
    }

    /// Force a connection out of circulation (e.g. the caller observed a
    /// transport error directly and doesn't want it reused).
    pub fn mark_dead(&self, mut conn: Connection) {
        conn.mark_dirty();
        self.inner.stats.retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Execute a one-off simple query on a freshly acquired connection.
    pub async fn simple_query(&self, query: &str) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.acquire_connection().await?;
        conn.simple_query(query).await
    }

    /// Execute a one-off parameterized query.
    pub async fn query(&self, query: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut conn = self.acquire_connection().await?;
        conn.query(query, params).await
    }

    /// Execute a query and return the affected row count.
    pub async fn execute(&self, query: &str, params: &[PgValue]) -> PgResult<u64> {
        let result = self.query(query, params).await?;
        Ok(result.rows_affected)
    }

    /// Close the pool: drain and close every idle connection. In-flight
    /// checkouts are closed by their own `Drop` once returned.
    pub async fn close(&self) {
        while let Ok(mut conn) = self.inner.idle_rx.try_recv() {
            let _ = conn.close().await;
        }
    }

    /// Number of connections currently sitting idle in the queue.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_rx.len()
    }

    /// Number of permits currently checked out (`max_connections -
    /// available`).
    pub fn live_count(&self) -> usize {
        self.inner.config.max_connections as usize - self.inner.semaphore.available_permits()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

async fn health_check_tick(inner: &Arc<PoolInner>) {
    let sample_size = inner.config.health_check_sample_size;
    let mut sampled = Vec::with_capacity(sample_size);

    for _ in 0..sample_size {
        match inner.idle_rx.try_recv() {
            Ok(conn) => sampled.push(conn),
            Err(_) => break,
        }
    }

    for mut conn in sampled {
        inner.stats.checked.fetch_add(1, Ordering::Relaxed);

        let probe = conn.simple_query(&inner.config.health_check_query).await;
        match probe {
            Ok(_) => {
                inner.stats.alive.fetch_add(1, Ordering::Relaxed);
                let _ = inner.idle_tx.try_send(conn);
            }
            Err(e) => {
                warn!(error = %e, "pool health check failed, replacing connection");
                match inner.create_connection().await {
                    Ok(fresh) => {
                        inner.stats.reconnected.fetch_add(1, Ordering::Relaxed);
                        let _ = inner.idle_tx.try_send(fresh);
                    }
                    Err(e) => {
                        warn!(error = %e, "pool health check reconnect failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgresql://localhost/test")
            .min_connections(2)
            .max_connections(20)
            .statement_cache_capacity(50);

        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.statement_cache_capacity, 50);
    }

    #[test]
    fn test_pool_stats_snapshot_starts_zero() {
        let stats = PoolStats::default();
        let snap = stats.snapshot();
        assert_eq!(snap.checked, 0);
        assert_eq!(snap.acquired, 0);
    }
}
