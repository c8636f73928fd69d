//! Low-level, non-blocking PostgreSQL wire protocol bindings.
//!
//! Everything in this module is pure encode/decode: no sockets, no async.
//! [`connection`](crate::connection) is the layer that drives these types
//! over a `TcpStream`.

pub mod protocol;
pub mod scram;
pub mod types;
