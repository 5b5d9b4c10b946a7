//! SQL fragment composition and a type-OID codec registry.
//!
//! This crate is the query-building and value-conversion half of a
//! PostgreSQL driver: [`Fragment`] composes injection-safe SQL text with a
//! parameter list, and [`CodecRegistry`] converts between PostgreSQL's
//! text wire format and host [`Value`]s. The wire engine that actually
//! talks to the server lives in the sibling `pglue` crate.

pub mod codec;
pub mod fragment;

pub use codec::{oid, Codec, CodecRegistry, TypeError, Value};
pub use fragment::{sql, Fragment};
