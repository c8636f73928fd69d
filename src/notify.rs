//! `LISTEN`/`NOTIFY` multiplexer: one dedicated connection fanned out to
//! many named channels (including `.*` wildcard subscriptions), with
//! per-channel bounded queues, rate limiting, recursion protection, and
//! transparent reconnect/resubscribe.
//!
//! Grounded on `joeydewaal-sqlx`'s `listener.rs` (`PgListener`): the
//! reconnect-on-next-call shape and the "never hand this connection back to
//! a pool" discipline come from there, generalized from sqlx's single
//! `recv()` stream into the many-channel, many-handler fan-out `spec.md`
//! §4.5 describes. The dedicated connection itself is plain
//! `connection::Connection::connect`, not a `pool::Pool` checkout, for the
//! same reason: a listener connection's lifetime is the multiplexer's own,
//! not governed by acquire/release.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{PgError, PgResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A subscriber callback: `(channel, payload, backend_pid) -> future`.
///
/// Boxed so the multiplexer can hold a heterogeneous list of closures and
/// async blocks behind one trait object — the "dynamic dispatch" capability
/// `spec.md` §9 describes; concrete variants (logger, alerter, reactor)
/// live in application code, not in this crate.
pub trait NotifyHandler: Send + Sync + 'static {
    fn call(&self, channel: &str, payload: &str, backend_pid: i32) -> BoxFuture<'static, ()>;
}

impl<F, Fut> NotifyHandler for F
where
    F: Fn(String, String, i32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, channel: &str, payload: &str, backend_pid: i32) -> BoxFuture<'static, ()> {
        Box::pin((self)(channel.to_string(), payload.to_string(), backend_pid))
    }
}

struct Handler {
    id: u64,
    handler: Arc<dyn NotifyHandler>,
}

/// Returned from `add_handler`; pass back to `remove_handler` to unregister
/// exactly this one subscription.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    pub id: u64,
    pub channel: String,
    pub wildcard: bool,
}

/// One arrived `NOTIFY` event, as queued per-channel and as buffered in
/// `pending_after_disconnect`.
#[derive(Debug, Clone)]
struct Event {
    channel: String,
    payload: String,
    backend_pid: i32,
}

/// Per-channel bookkeeping: the bounded delivery queue, the worker's
/// running flag, drop counters, and the sliding rate-limit window.
struct ChannelRuntime {
    tx: flume::Sender<Event>,
    running: Arc<AtomicBool>,
    dropped_rate_limited: Arc<AtomicU64>,
    dropped_overflow: Arc<AtomicU64>,
    dropped_recursive: Arc<AtomicU64>,
    rate_window: Mutex<RateWindow>,
    worker: tokio::task::JoinHandle<()>,
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Sliding 1-second window: returns `true` if this tick is within
    /// budget, bumping the internal counter as a side effect.
    fn allow(&mut self, per_sec: u32) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= per_sec {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Database connection URL for the dedicated connection.
    pub url: String,
    /// Bounded capacity of each per-channel delivery queue.
    pub channel_queue_capacity: usize,
    /// Max `NOTIFY` events admitted per channel per second; additional
    /// events in the same 1-second window are dropped
    /// (`dropped_rate_limited`).
    pub rate_limit_per_sec: u32,
    /// Max in-flight recursive depth per channel+payload before a worker
    /// drops an event (`dropped_recursive`) instead of re-dispatching it.
    pub max_recursive_depth: u32,
    /// Capacity of the deque buffering events that arrive while the
    /// dedicated connection is disconnected; once full, further events are
    /// dropped silently, per `spec.md` §4.5 step 1.
    pub pending_after_disconnect_capacity: usize,
    /// Backoff between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// How long an idle channel worker sleeps between polls of an empty
    /// queue, to give up CPU without hot-spinning (`spec.md` §4.5).
    pub worker_idle_sleep: Duration,
}

impl MultiplexerConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            channel_queue_capacity: 256,
            rate_limit_per_sec: 1000,
            max_recursive_depth: 8,
            pending_after_disconnect_capacity: 1024,
            reconnect_backoff: Duration::from_millis(500),
            worker_idle_sleep: Duration::from_millis(5),
        }
    }

    pub fn channel_queue_capacity(mut self, n: usize) -> Self {
        self.channel_queue_capacity = n;
        self
    }

    pub fn rate_limit_per_sec(mut self, n: u32) -> Self {
        self.rate_limit_per_sec = n;
        self
    }

    pub fn max_recursive_depth(mut self, n: u32) -> Self {
        self.max_recursive_depth = n;
        self
    }

    pub fn reconnect_backoff(mut self, d: Duration) -> Self {
        self.reconnect_backoff = d;
        self
    }
}

/// Aggregate drop/delivery counters, summed across every channel, for
/// `Multiplexer::stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplexerStats {
    pub delivered: u64,
    pub dropped_rate_limited: u64,
    pub dropped_overflow: u64,
    pub dropped_recursive: u64,
    pub dropped_disconnect_overflow: u64,
    pub reconnects: u64,
}

struct Inner {
    config: MultiplexerConfig,
    // `tokio::sync::Mutex` rather than `parking_lot`: `listen`/`unlisten`
    // and the read loop hold this across `.await` points (the connection
    // itself is mid-send/receive), which a sync mutex must never do.
    conn: AsyncMutex<Option<Connection>>,
    exact_map: Mutex<HashMap<String, Vec<Handler>>>,
    wildcard_map: Mutex<HashMap<String, Vec<Handler>>>,
    channel_runtime: Mutex<HashMap<String, ChannelRuntime>>,
    pending_after_disconnect: Mutex<std::collections::VecDeque<Event>>,
    handler_id_seq: AtomicU64,
    delivered: AtomicU64,
    dropped_disconnect_overflow: AtomicU64,
    reconnects: AtomicU64,
}

/// A `LISTEN`/`NOTIFY` fan-out running on its own connection.
///
/// `exact_map[channel]` non-empty iff the physical `LISTEN <channel>` is
/// active on the dedicated connection (`spec.md` §3 invariant);
/// `wildcard_map` entries never themselves issue a `LISTEN` — they only
/// match events delivered on some other, exactly-subscribed channel.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Build a multiplexer and open its dedicated connection. Does not
    /// start the read loop — call [`Multiplexer::run`] (typically
    /// `tokio::spawn`ed) once.
    pub async fn connect(config: MultiplexerConfig) -> PgResult<Self> {
        let conn = Connection::connect(&config.url).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                conn: AsyncMutex::new(Some(conn)),
                exact_map: Mutex::new(HashMap::new()),
                wildcard_map: Mutex::new(HashMap::new()),
                channel_runtime: Mutex::new(HashMap::new()),
                pending_after_disconnect: Mutex::new(std::collections::VecDeque::new()),
                handler_id_seq: AtomicU64::new(1),
                delivered: AtomicU64::new(0),
                dropped_disconnect_overflow: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        })
    }

    /// Register `handler` for `channel`. A channel ending in `.*` is a
    /// wildcard: it never issues `LISTEN`, and only matches events arriving
    /// on some other, exactly-subscribed channel whose name starts with the
    /// prefix before the `*`. Returns `None` if the physical `LISTEN`
    /// (first subscriber on a new exact channel) fails.
    pub async fn add_handler(
        &self,
        channel: &str,
        handler: Arc<dyn NotifyHandler>,
    ) -> Option<HandlerHandle> {
        let id = self.inner.handler_id_seq.fetch_add(1, Ordering::Relaxed);
        let wildcard = is_wildcard(channel);

        if wildcard {
            self.inner
                .wildcard_map
                .lock()
                .entry(channel.to_string())
                .or_default()
                .push(Handler { id, handler });
            return Some(HandlerHandle {
                id,
                channel: channel.to_string(),
                wildcard: true,
            });
        }

        let is_first = {
            let exact = self.inner.exact_map.lock();
            exact.get(channel).map(|v| v.is_empty()).unwrap_or(true)
        };

        if is_first {
            if let Err(e) = self.listen(channel).await {
                warn!(channel, error = %e, "LISTEN failed, handler not registered");
                return None;
            }
            self.spawn_channel_worker(channel.to_string());
        }

        self.inner
            .exact_map
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Handler { id, handler });

        Some(HandlerHandle {
            id,
            channel: channel.to_string(),
            wildcard: false,
        })
    }

    /// Remove exactly one subscription. Issues `UNLISTEN` and tears down the
    /// channel runtime if this was the last handler for an exact channel.
    pub async fn remove_handler(&self, handle: &HandlerHandle) {
        if handle.wildcard {
            let mut wc = self.inner.wildcard_map.lock();
            if let Some(list) = wc.get_mut(&handle.channel) {
                list.retain(|h| h.id != handle.id);
                if list.is_empty() {
                    wc.remove(&handle.channel);
                }
            }
            return;
        }

        let became_empty = {
            let mut exact = self.inner.exact_map.lock();
            if let Some(list) = exact.get_mut(&handle.channel) {
                list.retain(|h| h.id != handle.id);
                let empty = list.is_empty();
                if empty {
                    exact.remove(&handle.channel);
                }
                empty
            } else {
                false
            }
        };

        if became_empty {
            self.teardown_channel(&handle.channel).await;
        }
    }

    /// Remove every handler for `channel`. `UNLISTEN`s an exact channel;
    /// for a wildcard pattern there is nothing physical to undo.
    pub async fn remove_channel(&self, channel: &str) {
        if is_wildcard(channel) {
            self.inner.wildcard_map.lock().remove(channel);
            return;
        }
        let had_any = self.inner.exact_map.lock().remove(channel).is_some();
        if had_any {
            self.teardown_channel(channel).await;
        }
    }

    async fn teardown_channel(&self, channel: &str) {
        if let Some(rt) = self.inner.channel_runtime.lock().remove(channel) {
            rt.running.store(false, Ordering::Relaxed);
            rt.worker.abort();
        }
        if let Err(e) = self.unlisten(channel).await {
            warn!(channel, error = %e, "UNLISTEN failed");
        }
    }

    async fn listen(&self, channel: &str) -> PgResult<()> {
        let sql = format!("LISTEN {}", quote_identifier(channel));
        let mut guard = self.inner.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.exec_simple(&sql).await.map(|_| ()),
            None => Err(PgError::ConnectionClosed),
        }
    }

    async fn unlisten(&self, channel: &str) -> PgResult<()> {
        let sql = format!("UNLISTEN {}", quote_identifier(channel));
        let mut guard = self.inner.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.exec_simple(&sql).await.map(|_| ()),
            None => Ok(()),
        }
    }

    fn spawn_channel_worker(&self, channel: String) {
        let (tx, rx) = flume::bounded(self.inner.config.channel_queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let dropped_rate_limited = Arc::new(AtomicU64::new(0));
        let dropped_overflow = Arc::new(AtomicU64::new(0));
        let dropped_recursive = Arc::new(AtomicU64::new(0));

        let inner = Arc::clone(&self.inner);
        let running_for_worker = Arc::clone(&running);
        let dropped_recursive_for_worker = Arc::clone(&dropped_recursive);
        let idle_sleep = self.inner.config.worker_idle_sleep;
        let channel_for_worker = channel.clone();

        let worker = tokio::spawn(async move {
            let mut recursion: HashMap<(String, String), u32> = HashMap::new();
            while running_for_worker.load(Ordering::Relaxed) {
                match rx.try_recv() {
                    Ok(event) => {
                        let key = (event.channel.clone(), event.payload.clone());
                        let depth = *recursion.get(&key).unwrap_or(&0);
                        if depth >= inner.config.max_recursive_depth {
                            dropped_recursive_for_worker.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        recursion.insert(key.clone(), depth + 1);

                        dispatch_event(&inner, &event).await;

                        if let Some(d) = recursion.get_mut(&key) {
                            *d = d.saturating_sub(1);
                        }
                    }
                    Err(flume::TryRecvError::Empty) => {
                        tokio::time::sleep(idle_sleep).await;
                    }
                    Err(flume::TryRecvError::Disconnected) => break,
                }
            }
            debug!(channel = %channel_for_worker, "channel worker stopped");
        });

        self.inner.channel_runtime.lock().insert(
            channel,
            ChannelRuntime {
                tx,
                running,
                dropped_rate_limited,
                dropped_overflow,
                dropped_recursive,
                rate_window: Mutex::new(RateWindow::new()),
                worker,
            },
        );
    }

    /// Supervise the dedicated connection: reconnect with backoff on loss
    /// (replaying `LISTEN` for every exact channel and any buffered
    /// `pending_after_disconnect` events on success), otherwise await
    /// socket readability and drain every pending `NOTIFY`. Intended to be
    /// `tokio::spawn`ed once and run for the lifetime of the multiplexer —
    /// it only returns on an unrecoverable setup error, since transport
    /// loss is handled internally by reconnecting.
    pub async fn run(&self) -> PgResult<()> {
        loop {
            if self.inner.conn.lock().await.is_none() {
                self.reconnect_loop().await;
            }

            let wait_result = self.wait_readable().await;
            if wait_result.is_err() {
                *self.inner.conn.lock().await = None;
                continue;
            }

            self.drain_notifications().await;
        }
    }

    async fn wait_readable(&self) -> PgResult<()> {
        let guard = self.inner.conn.lock().await;
        match guard.as_ref() {
            Some(conn) => conn.wait_readable_for_listener().await,
            None => Err(PgError::ConnectionClosed),
        }
    }

    /// Drains every `NOTIFY` currently available without blocking once no
    /// more data is immediately readable, dispatching each to its channel
    /// queue subject to rate limiting.
    async fn drain_notifications(&self) {
        loop {
            let next = {
                let mut guard = self.inner.conn.lock().await;
                match guard.as_mut() {
                    Some(conn) => conn.recv_notification().await,
                    None => return,
                }
            };

            match next {
                Ok(Some((backend_pid, channel, payload))) => {
                    self.handle_incoming(channel, payload, backend_pid);
                }
                Ok(None) => {
                    if !self.more_immediately_readable().await {
                        return;
                    }
                }
                Err(_) => {
                    *self.inner.conn.lock().await = None;
                    return;
                }
            }
        }
    }

    /// Best-effort, zero-timeout re-check of socket readiness so a burst of
    /// queued notifications drains in one pass instead of one per read-loop
    /// tick.
    async fn more_immediately_readable(&self) -> bool {
        let guard = self.inner.conn.lock().await;
        let conn = match guard.as_ref() {
            Some(c) => c,
            None => return false,
        };
        tokio::time::timeout(Duration::from_millis(0), conn.wait_readable_for_listener())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn handle_incoming(&self, channel: String, payload: String, backend_pid: i32) {
        let has_runtime = self.inner.channel_runtime.lock().contains_key(&channel);
        if !has_runtime {
            // No exact subscriber currently listens on this channel, so
            // there is no per-channel queue to enqueue into — dropped per
            // `spec.md` S4 (a wildcard with no matching exact LISTEN never
            // sees the event, since the physical LISTEN doesn't exist).
            return;
        }

        self.enqueue_or_drop(Event {
            channel,
            payload,
            backend_pid,
        });
    }

    fn enqueue_or_drop(&self, event: Event) {
        let runtimes = self.inner.channel_runtime.lock();
        let rt = match runtimes.get(&event.channel) {
            Some(rt) => rt,
            None => return,
        };

        if !rt
            .rate_window
            .lock()
            .allow(self.inner.config.rate_limit_per_sec)
        {
            rt.dropped_rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if rt.tx.try_send(event).is_err() {
            rt.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn reconnect_loop(&self) {
        loop {
            match Connection::connect(&self.inner.config.url).await {
                Ok(conn) => {
                    *self.inner.conn.lock().await = Some(conn);
                    self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!("notification multiplexer reconnected");
                    self.replay_listens().await;
                    self.replay_pending();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "notification multiplexer reconnect failed, backing off");
                    tokio::time::sleep(self.inner.config.reconnect_backoff).await;
                }
            }
        }
    }

    async fn replay_listens(&self) {
        let channels: Vec<String> = self.inner.exact_map.lock().keys().cloned().collect();
        for channel in channels {
            if let Err(e) = self.listen(&channel).await {
                warn!(channel, error = %e, "failed to replay LISTEN after reconnect");
            }
        }
    }

    /// Events buffered in `pending_after_disconnect` while the connection
    /// was down are replayed into their channel queues, subject to the same
    /// rate limit and overflow rules as live delivery.
    fn replay_pending(&self) {
        let events: Vec<Event> = {
            let mut pending = self.inner.pending_after_disconnect.lock();
            pending.drain(..).collect()
        };
        for event in events {
            self.enqueue_or_drop(event);
        }
    }

    /// Sum of per-channel delivery/drop counters plus multiplexer-wide
    /// reconnect count.
    pub fn stats(&self) -> MultiplexerStats {
        let runtimes = self.inner.channel_runtime.lock();
        let mut stats = MultiplexerStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped_disconnect_overflow: self
                .inner
                .dropped_disconnect_overflow
                .load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            ..Default::default()
        };
        for rt in runtimes.values() {
            stats.dropped_rate_limited += rt.dropped_rate_limited.load(Ordering::Relaxed);
            stats.dropped_overflow += rt.dropped_overflow.load(Ordering::Relaxed);
            stats.dropped_recursive += rt.dropped_recursive.load(Ordering::Relaxed);
        }
        stats
    }

    /// Whether the dedicated connection currently believes itself live.
    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }
}

async fn dispatch_event(inner: &Arc<Inner>, event: &Event) {
    let mut tasks: Vec<(Arc<dyn NotifyHandler>, Event)> = Vec::new();

    {
        let exact = inner.exact_map.lock();
        if let Some(handlers) = exact.get(&event.channel) {
            for h in handlers {
                tasks.push((Arc::clone(&h.handler), event.clone()));
            }
        }
    }
    {
        let wildcard = inner.wildcard_map.lock();
        for (pattern, handlers) in wildcard.iter() {
            let prefix = &pattern[..pattern.len() - 1]; // strip trailing '*', keep '.'
            if event.channel.starts_with(prefix) {
                for h in handlers {
                    tasks.push((Arc::clone(&h.handler), event.clone()));
                }
            }
        }
    }

    for (handler, event) in tasks {
        let channel = event.channel;
        let payload = event.payload;
        let backend_pid = event.backend_pid;
        tokio::spawn(async move {
            handler.call(&channel, &payload, backend_pid).await;
        });
    }
}

/// A channel name ending in `.*` is a wildcard subscription: it never
/// issues a physical `LISTEN` and only matches events delivered on some
/// other, exactly-subscribed channel whose name begins with the prefix
/// before the `*` (`spec.md` §4.5/§6).
pub fn is_wildcard(channel: &str) -> bool {
    channel.ends_with(".*")
}

/// Quote a channel name for `LISTEN`/`UNLISTEN`: `[a-z_][a-z0-9_]*` passes
/// through unquoted, everything else is wrapped in `"..."` with embedded
/// `"` doubled (`spec.md` §6 identifier quoting rule).
pub fn quote_identifier(ident: &str) -> String {
    let mut chars = ident.chars();
    let passes_through = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };

    if passes_through {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("events.*"));
        assert!(!is_wildcard("events"));
        assert!(!is_wildcard("events.foo"));
    }

    #[test]
    fn test_quote_identifier_passthrough() {
        assert_eq!(quote_identifier("metrics"), "metrics");
        assert_eq!(quote_identifier("my_channel_1"), "my_channel_1");
    }

    #[test]
    fn test_quote_identifier_wraps_and_escapes() {
        assert_eq!(quote_identifier("MixedCase"), "\"MixedCase\"");
        assert_eq!(quote_identifier("has space"), "\"has space\"");
        assert_eq!(quote_identifier("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(quote_identifier("1leading"), "\"1leading\"");
    }

    #[test]
    fn test_rate_window_allows_up_to_budget() {
        let mut window = RateWindow::new();
        for _ in 0..5 {
            assert!(window.allow(5));
        }
        assert!(!window.allow(5));
    }

    #[test]
    fn test_wildcard_prefix_match() {
        let pattern = "events.*";
        let prefix = &pattern[..pattern.len() - 1];
        assert!("events.a".starts_with(prefix));
        assert!(!"other.a".starts_with(prefix));
    }
}
