//! Primary/replica cluster topology, health ticker with circuit breaker,
//! consistency-aware selection, and read-your-writes stickiness.
//!
//! Grounded in `ozontech-pg_doorman`'s `patroni_proxy` (`patroni.rs`,
//! `config.rs`): the `Role` enum (`Leader`/`Sync`/`Async`, here
//! `Primary`/`SyncReplica`/`AsyncReplica`/...), the per-host blacklist the
//! proxy keeps when an upstream fails its health probe, and the
//! "prefer the member with lowest lag, else fall back to the leader" shape
//! of its replica selection are all the same ideas `spec.md` §4.6 asks for,
//! generalized from an HTTP-polled Patroni cluster view to a
//! directly-probed `SELECT 1`/`pg_last_wal_replay_lsn()` health loop over
//! this crate's own `pool::Pool`s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::pool::{Pool, PoolConfig};

/// A node's role within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    SyncReplica,
    AsyncReplica,
    Analytics,
    Archive,
    Maintenance,
}

/// Circuit-breaker state machine for one node's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl From<CircuitState> for u8 {
    fn from(s: CircuitState) -> Self {
        match s {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Lock-free, continuously updated health record for one node.
///
/// Fields are atomics rather than a `Mutex<Struct>` so `route()` can read a
/// consistent-enough snapshot without blocking the health ticker, the same
/// trade-off `pool::PoolStats` makes for its counters.
pub struct Health {
    healthy: AtomicBool,
    rtt_us: AtomicU64,
    replay_lag_ms: AtomicU64,
    lsn_lag: AtomicU64,
    circuit: AtomicU32,
    consecutive_failures: AtomicU32,
    next_probe_allowed_at: Mutex<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            rtt_us: AtomicU64::new(u64::MAX),
            replay_lag_ms: AtomicU64::new(u64::MAX),
            lsn_lag: AtomicU64::new(u64::MAX),
            circuit: AtomicU32::new(CircuitState::Closed as u32),
            consecutive_failures: AtomicU32::new(0),
            next_probe_allowed_at: Mutex::new(Instant::now()),
        }
    }
}

impl Health {
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us.load(Ordering::Relaxed))
    }

    pub fn replay_lag(&self) -> Duration {
        Duration::from_millis(self.replay_lag_ms.load(Ordering::Relaxed))
    }

    pub fn lsn_lag(&self) -> u64 {
        self.lsn_lag.load(Ordering::Relaxed)
    }

    pub fn circuit_state(&self) -> CircuitState {
        CircuitState::from(self.circuit.load(Ordering::Relaxed) as u8)
    }

    fn set_circuit(&self, state: CircuitState) {
        self.circuit.store(u8::from(state) as u32, Ordering::Relaxed);
    }
}

/// Read/write kind plus consistency policy a call site asks the router to
/// satisfy.
#[derive(Debug, Clone)]
pub struct RouteHint {
    pub kind: RouteKind,
    pub consistency: Consistency,
    pub staleness_budget: StalenessBudget,
    /// If true and the caller's `identity` has a non-expired entry in the
    /// RMW memo, the router forces the primary regardless of `consistency`.
    pub read_my_writes: bool,
    /// Opaque key the RMW memo is keyed on (e.g. a session or request id).
    /// Required when `read_my_writes` is set; ignored otherwise. Keying
    /// policy (per-connection vs per-identity) is caller-supplied rather
    /// than assumed — `spec.md` §9 leaves this an open question.
    pub identity: Option<String>,
}

impl RouteHint {
    pub fn write() -> Self {
        Self {
            kind: RouteKind::Write,
            consistency: Consistency::Strong,
            staleness_budget: StalenessBudget::default(),
            read_my_writes: false,
            identity: None,
        }
    }

    pub fn read(consistency: Consistency) -> Self {
        Self {
            kind: RouteKind::Read,
            consistency,
            staleness_budget: StalenessBudget::default(),
            read_my_writes: false,
            identity: None,
        }
    }

    pub fn staleness_budget(mut self, budget: StalenessBudget) -> Self {
        self.staleness_budget = budget;
        self
    }

    pub fn read_my_writes(mut self, identity: &str) -> Self {
        self.read_my_writes = true;
        self.identity = Some(identity.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Strong,
    BoundedStaleness,
    Eventual,
}

/// Bounded-staleness budget: `route({BoundedStaleness})` only accepts
/// replicas whose `replay_lag` and `lsn_lag` are both within budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct StalenessBudget {
    pub lag_ms: u64,
    pub lag_lsn: u64,
}

/// One cluster member: its own dedicated pool, never shared with another
/// node (`spec.md` §4.6).
pub struct Node {
    pub name: String,
    pub endpoint: String,
    pub role: Role,
    pub weight: u32,
    pub pool: Pool,
    pub health: Health,
}

/// Static node description used to build a [`Router`].
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub endpoint: String,
    pub role: Role,
    pub weight: u32,
    pub max_pool: u32,
}

/// Router configuration: health probe, circuit breaker thresholds, RMW
/// stickiness window.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub health_check_query: String,
    pub health_check_interval: Duration,
    pub fail_threshold: u32,
    pub open_duration: Duration,
    pub read_my_writes_ttl: Duration,
    pub statement_cache_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            health_check_query: "SELECT 1".to_string(),
            health_check_interval: Duration::from_secs(5),
            fail_threshold: 3,
            open_duration: Duration::from_secs(30),
            read_my_writes_ttl: Duration::from_secs(5),
            statement_cache_capacity: 100,
        }
    }
}

/// Transaction configuration passed to `route_for_tx` — mirrors
/// `transaction::TransactionConfig`'s `read_only`/`deferrable` fields
/// without depending on `transaction` itself, so `router` has no
/// dependency on `transaction` (it's the other way around in practice).
#[derive(Debug, Clone, Copy, Default)]
pub struct TxRouteConfig {
    pub read_only: bool,
    pub deferrable: bool,
}

/// An immutable primary/replica cluster topology. Rebuilt and swapped as a
/// whole (`Arc<Router>`) for hot topology changes — `Router` itself never
/// mutates its node list after `build`.
pub struct Router {
    nodes: Vec<Arc<Node>>,
    primary_failover: Vec<String>,
    config: RouterConfig,
    rmw_memo: Mutex<HashMap<String, Instant>>,
}

impl Router {
    /// Connect a pool for every `NodeSpec` and assemble the immutable
    /// topology. `primary_failover` names candidate promotion targets tried
    /// in order when the current primary is unhealthy and circuit-open.
    pub async fn build(
        specs: Vec<NodeSpec>,
        primary_failover: Vec<String>,
        config: RouterConfig,
    ) -> crate::error::PgResult<Self> {
        let mut nodes = Vec::with_capacity(specs.len());
        for spec in specs {
            let pool_config = PoolConfig::new(&spec.endpoint)
                .max_connections(spec.max_pool)
                .statement_cache_capacity(config.statement_cache_capacity);
            let pool = Pool::connect(pool_config).await?;
            nodes.push(Arc::new(Node {
                name: spec.name,
                endpoint: spec.endpoint,
                role: spec.role,
                weight: spec.weight,
                pool,
                health: Health::default(),
            }));
        }

        Ok(Self {
            nodes,
            primary_failover,
            config,
            rmw_memo: Mutex::new(HashMap::new()),
        })
    }

    fn primary(&self) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.role == Role::Primary)
    }

    fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn replicas(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.role, Role::SyncReplica | Role::AsyncReplica))
    }

    fn is_usable(&self, node: &Node) -> bool {
        node.health.healthy() && node.health.circuit_state() != CircuitState::Open
    }

    /// Record that `identity` just wrote, pinning its subsequent
    /// `read_my_writes` reads to the primary until `read_my_writes_ttl`
    /// elapses.
    pub fn note_write(&self, identity: &str) {
        let expires = Instant::now() + self.config.read_my_writes_ttl;
        self.rmw_memo.lock().insert(identity.to_string(), expires);
    }

    fn rmw_pinned(&self, identity: &str) -> bool {
        let memo = self.rmw_memo.lock();
        match memo.get(identity) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    /// Select a pool for `hint`. Returns `None` if no usable node exists
    /// for the requested kind/consistency (e.g. every primary-failover
    /// candidate is also circuit-open).
    pub fn route(&self, hint: &RouteHint) -> Option<Pool> {
        if hint.read_my_writes {
            if let Some(identity) = &hint.identity {
                if self.rmw_pinned(identity) {
                    return self.route_primary_with_failover();
                }
            }
        }

        match (hint.kind, hint.consistency) {
            (RouteKind::Write, _) | (_, Consistency::Strong) => self.route_primary_with_failover(),
            (RouteKind::Read, Consistency::BoundedStaleness) => {
                self.route_bounded_staleness(&hint.staleness_budget)
            }
            (RouteKind::Read, Consistency::Eventual) => self.route_any_healthy_replica(),
        }
    }

    fn route_primary_with_failover(&self) -> Option<Pool> {
        if let Some(primary) = self.primary() {
            if self.is_usable(primary) {
                return Some(primary.pool.clone());
            }
        }

        for candidate_name in &self.primary_failover {
            if let Some(node) = self.node_by_name(candidate_name) {
                if self.is_usable(node) {
                    warn!(node = %node.name, "primary unusable, routing write to failover candidate");
                    return Some(node.pool.clone());
                }
            }
        }

        None
    }

    fn route_bounded_staleness(&self, budget: &StalenessBudget) -> Option<Pool> {
        let mut candidates: Vec<&Arc<Node>> = self
            .replicas()
            .filter(|n| self.is_usable(n))
            .filter(|n| {
                n.health.replay_lag() <= Duration::from_millis(budget.lag_ms)
                    && n.health.lsn_lag() <= budget.lag_lsn
            })
            .collect();

        if candidates.is_empty() {
            return self.route_primary_with_failover();
        }

        sort_candidates(&mut candidates);
        candidates.first().map(|n| n.pool.clone())
    }

    fn route_any_healthy_replica(&self) -> Option<Pool> {
        let mut candidates: Vec<&Arc<Node>> =
            self.replicas().filter(|n| self.is_usable(n)).collect();

        if candidates.is_empty() {
            return self.route_primary_with_failover();
        }

        sort_candidates(&mut candidates);
        candidates.first().map(|n| n.pool.clone())
    }

    /// Map a transaction's `read_only`/`deferrable` configuration onto a
    /// preferred role, per `spec.md` §4.6 "Transaction mapping":
    /// `read_only && deferrable` prefers a sync replica, `read_only &&
    /// !deferrable` prefers any replica under the default consistency,
    /// otherwise the primary.
    pub fn route_for_tx(&self, cfg: TxRouteConfig) -> Option<Pool> {
        if !cfg.read_only {
            return self.route_primary_with_failover();
        }

        if cfg.deferrable {
            if let Some(node) = self
                .nodes
                .iter()
                .find(|n| n.role == Role::SyncReplica && self.is_usable(n))
            {
                return Some(node.pool.clone());
            }
        }

        self.route_any_healthy_replica()
    }

    /// Return a specific named node's pool regardless of routing policy
    /// (e.g. to target an `Analytics` node directly).
    pub fn pin(&self, name: &str, _hint: &RouteHint) -> Option<Pool> {
        self.node_by_name(name).map(|n| n.pool.clone())
    }

    /// Spawn the health ticker: probes every node on `health_check_interval`,
    /// updating RTT/lag/circuit state. Returns the `JoinHandle` so the
    /// caller may detach or hold it.
    pub fn start_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(router.config.health_check_interval);
            loop {
                ticker.tick().await;
                for node in &router.nodes {
                    probe_node(&router.config, node).await;
                }
            }
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }
}

/// Sort eligible candidates by (healthy, lower RTT, higher weight)
/// lexicographically, per `spec.md` §4.6 "Selection". All candidates
/// passed in are already filtered to healthy/usable, so this only
/// discriminates on RTT and weight in practice, but the explicit healthy
/// comparison keeps the ordering total even if a caller widens the filter.
fn sort_candidates(candidates: &mut [&Arc<Node>]) {
    candidates.sort_by(|a, b| {
        rank_cmp(
            a.health.healthy(),
            a.health.rtt(),
            a.weight,
            b.health.healthy(),
            b.health.rtt(),
            b.weight,
        )
    });
}

/// Pure (healthy, rtt, weight) comparator `sort_candidates` ranks on,
/// split out as a free function so the ranking rule itself is
/// unit-testable without constructing a real `Node`/`Pool`.
fn rank_cmp(
    a_healthy: bool,
    a_rtt: Duration,
    a_weight: u32,
    b_healthy: bool,
    b_rtt: Duration,
    b_weight: u32,
) -> std::cmp::Ordering {
    b_healthy
        .cmp(&a_healthy)
        .then(a_rtt.cmp(&b_rtt))
        .then(b_weight.cmp(&a_weight))
}

async fn probe_node(config: &RouterConfig, node: &Arc<Node>) {
    if node.health.circuit_state() == CircuitState::Open {
        let ready = {
            let next = node.health.next_probe_allowed_at.lock();
            Instant::now() >= *next
        };
        if !ready {
            return;
        }
        node.health.set_circuit(CircuitState::HalfOpen);
    }

    let started = Instant::now();
    let probe = node.pool.simple_query(&config.health_check_query).await;
    let rtt = started.elapsed();

    match probe {
        Ok(_) => {
            node.health.rtt_us.store(rtt.as_micros() as u64, Ordering::Relaxed);
            node.health.healthy.store(true, Ordering::Relaxed);
            node.health.consecutive_failures.store(0, Ordering::Relaxed);
            if node.health.circuit_state() != CircuitState::Closed {
                info!(node = %node.name, "health probe succeeded, closing circuit");
            }
            node.health.set_circuit(CircuitState::Closed);
            update_replication_lag(node).await;
        }
        Err(e) => {
            node.health.healthy.store(false, Ordering::Relaxed);
            let failures = node.health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(node = %node.name, error = %e, failures, "health probe failed");

            if failures >= config.fail_threshold && node.health.circuit_state() != CircuitState::Open {
                node.health.set_circuit(CircuitState::Open);
                *node.health.next_probe_allowed_at.lock() = Instant::now() + config.open_duration;
                warn!(node = %node.name, "circuit breaker opened");
            } else if node.health.circuit_state() == CircuitState::HalfOpen {
                node.health.set_circuit(CircuitState::Open);
                *node.health.next_probe_allowed_at.lock() = Instant::now() + config.open_duration;
            }
        }
    }
}

/// Replicas report `pg_last_wal_replay_lsn()` lag; the primary doesn't
/// apply, so this is a no-op there.
async fn update_replication_lag(node: &Arc<Node>) {
    if node.role == Role::Primary {
        return;
    }

    let result = node
        .pool
        .simple_query(
            "SELECT \
                (extract(epoch from now() - pg_last_xact_replay_timestamp()) * 1000)::bigint, \
                (pg_wal_lsn_diff(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()))::bigint",
        )
        .await;

    if let Ok(results) = result {
        if let Some(row) = results.first().and_then(|r| r.rows.first()) {
            if let Some(Some(lag_ms)) = row.first() {
                if let Ok(ms) = lag_ms.parse::<u64>() {
                    node.health.replay_lag_ms.store(ms, Ordering::Relaxed);
                }
            }
            if let Some(Some(lag_lsn)) = row.get(1) {
                if let Ok(lsn) = lag_lsn.parse::<u64>() {
                    node.health.lsn_lag.store(lsn, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_cmp_prefers_lower_rtt() {
        let ordering = rank_cmp(
            true,
            Duration::from_millis(50),
            1,
            true,
            Duration::from_millis(10),
            1,
        );
        assert_eq!(ordering, std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_rank_cmp_prefers_higher_weight_on_tie() {
        let ordering = rank_cmp(
            true,
            Duration::from_millis(10),
            1,
            true,
            Duration::from_millis(10),
            5,
        );
        assert_eq!(ordering, std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_rank_cmp_prefers_healthy() {
        let ordering = rank_cmp(
            false,
            Duration::from_millis(1),
            10,
            true,
            Duration::from_millis(100),
            1,
        );
        assert_eq!(ordering, std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_circuit_state_roundtrip() {
        assert_eq!(CircuitState::from(u8::from(CircuitState::Open)), CircuitState::Open);
        assert_eq!(
            CircuitState::from(u8::from(CircuitState::HalfOpen)),
            CircuitState::HalfOpen
        );
    }

    #[test]
    fn test_rmw_memo_expiry() {
        let router = Router {
            nodes: Vec::new(),
            primary_failover: Vec::new(),
            config: RouterConfig {
                read_my_writes_ttl: Duration::from_millis(0),
                ..RouterConfig::default()
            },
            rmw_memo: Mutex::new(HashMap::new()),
        };
        router.note_write("session-1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!router.rmw_pinned("session-1"));
    }
}
