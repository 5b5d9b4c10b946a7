//! A client library for PostgreSQL speaking the v3 frontend/backend wire
//! protocol directly over TCP or Unix-domain sockets: parameterized queries
//! with injection-safe value interpolation, extended-query caching with
//! automatic pipelining, simple multi-statement queries, chunked streaming
//! result consumption, `COPY IN`/`COPY OUT`, nested transactions via
//! savepoints, `LISTEN`/`NOTIFY` surviving reconnect, a connection pool,
//! SCRAM-SHA-256 authentication, and automatic reconnect.
//!
//! Everything is text format; there is no TLS support and no MD5/Kerberos/
//! GSS/SSPI authentication.

pub mod auth;
pub mod channel;
pub mod config;
pub mod copy;
pub mod error;
pub mod locks;
pub mod message;
pub mod pool;
pub mod query;
pub mod row;
pub mod stream;
pub mod transaction;
pub mod wire;

pub use channel::Notification;
pub use config::{ConnectConfig, PoolConfig};
pub use copy::{CopyInSource, CopySink};
pub use error::{ErrorFields, PgError, PgResult};
pub use pool::{Pool, PoolHandle, PooledQuery, PoolTransaction};
pub use query::{Query, QueryResult};
pub use row::Row;
pub use transaction::Transaction;
pub use wire::{Wire, WireEvent};

pub use pglue_sql::{codec, sql, CodecRegistry, Fragment, TypeError, Value};
