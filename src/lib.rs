//! Asynchronous PostgreSQL client core.
//!
//! Six subsystems, each usable independently:
//!
//! - [`connection`] — a single, non-blocking connection speaking the
//!   PostgreSQL v3 wire protocol (handshake, extended query protocol,
//!   `COPY`, server-side cursors).
//! - [`pool`] — a bounded pool of connections with health checking.
//! - [`transaction`] — `BEGIN`/`COMMIT`/`ROLLBACK` and `SAVEPOINT`
//!   subtransactions layered on a pooled connection.
//! - [`notify`] — a `LISTEN`/`NOTIFY` multiplexer on a dedicated connection.
//! - [`router`] — primary/replica topology-aware routing across pools.
//!
//! Nothing here blocks the `tokio` thread it runs on; every suspension
//! point is an explicit `.await` on socket readiness, a timer, or a
//! `tokio`/`flume` channel.

pub mod error;
pub mod notify;
pub mod pool;
pub mod reflect;
pub mod router;
pub mod statement;
pub mod transaction;
pub mod wire;

pub mod connection;

pub use connection::{Connection, ConnState, CopyResult, CursorChunk, PgConfig, QueryResult};
pub use error::{Diagnostics, ErrorCode, PgError, PgOpError, PgResult, SqlStateCategory};
pub use notify::{HandlerHandle, Multiplexer, MultiplexerConfig, MultiplexerStats, NotifyHandler};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use router::{
    CircuitState, Consistency, Health, Node, NodeSpec, Role, RouteHint, RouteKind, Router,
    RouterConfig, StalenessBudget, TxRouteConfig,
};
pub use statement::{PreparedStatement, StatementCache};
pub use transaction::{IsolationLevel, Transaction, TransactionConfig};
pub use wire::types::{Oid, PgValue};
