//! mcpool is the connection core of a memcached client.
//!
//! It keeps live connections to many interchangeable cache servers, picks
//! the right server for a key, survives server failure without stalling
//! callers, and fetches many keys spread across many servers concurrently
//! within one time budget.
//!
//! It uses the following terminology:
//! * A backend is one cache server process, named by `"host:port"`.
//! * A ring maps key hashes to backends, either by weighted modulo
//!   ("flat") or by MD5 consistent hashing.
//! * A pool owns the connections to exactly one backend, and vends them out
//!   as [claim::Handle]s.
//! * The router combines the ring, one pool per backend, and a record of
//!   recently failed backends to turn a key into a usable connection.
//!
//! # Usage
//!
//! * The main interface for this crate is [router::Router].
//! * To construct a router, you must supply a [servers::ServerConfig] and a
//!   [backend::Connector]. The connector describes how to create (and
//!   probe) connections to a backend; [connectors::tcp::TcpConnector] is the
//!   default.
//! * Multi-key fetches go through [scatter::ScatterGather], which talks to
//!   every involved backend at once and decodes responses with a
//!   [codec::Codec].
//! * Applications owning several named routers can keep them in a
//!   [registry::PoolRegistry].
//!
//! # DTrace probes
//!
//! mcpool contains a number of DTrace USDT probes, which fire as connections
//! are acquired, created, and returned, and as the router fails over:
//!
//! - `acquire-start`: Fires before attempting to take a connection from a pool.
//! - `acquire-done`: Fires before returning a connection to the caller.
//! - `acquire-failed`: Fires on failure to take a connection from a pool.
//! - `connect-start`: Fires before attempting a connection to a backend.
//! - `connect-done`: Fires after successfully connecting to a backend.
//! - `connect-failed`: Fires after failing to connect to a backend.
//! - `handle-returned`: Fires when a connection is handed back to its pool.
//! - `host-marked-dead`: Fires when the router backs off from a backend.
//! - `failover`: Fires when the router moves a key to another backend.
//! - `fetch-start`: Fires when a scatter-gather fetch begins.
//! - `fetch-done`: Fires when a scatter-gather fetch returns.
//!
//! The existence of the probes is behind the `"probes"` feature, which is
//! enabled by default. Probes are zero-cost unless they are explicitly enabled,
//! by tracing the program with the `dtrace(1)` command-line tool.

// Public API
pub mod backend;
pub mod claim;
pub mod codec;
pub mod connection;
pub mod dead_hosts;
pub mod hash;
pub mod policy;
pub mod pool;
pub mod reassembly;
pub mod registry;
pub mod ring;
pub mod router;
pub mod scatter;
pub mod servers;

// Necessary for implementation
mod backoff;
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;

use std::sync::atomic::{AtomicU64, Ordering};

/// Uniquely identifies one acquire request
#[derive(Copy, Clone, Debug)]
pub(crate) struct ClaimId(pub u64);

impl ClaimId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

/// USDT probes for tracing how mcpool routes keys and hands out connections.
#[cfg(feature = "probes")]
#[usdt::provider(provider = "mcpool")]
mod probes {
    /// Fires right before attempting to acquire a connection from a pool.
    fn acquire__start(pool: &str, claim_id: u64) {}

    /// Fires when a connection is successfully acquired, and whether it
    /// counts against the pool (1) or is a temporary overflow (0).
    fn acquire__done(pool: &str, claim_id: u64, pooled: u8) {}

    /// Fires when we _fail_ to acquire a connection, with a string
    /// identifying the reason.
    fn acquire__failed(pool: &str, claim_id: u64, reason: &str) {}

    /// Fires right before attempting to make a connection.
    fn connect__start(pool: &str, claim_id: u64) {}

    /// Fires just after successfully making a connection.
    fn connect__done(pool: &str, claim_id: u64) {}

    /// Fires just after failing to make a connection, with a string
    /// identifying the reason.
    fn connect__failed(pool: &str, claim_id: u64, reason: &str) {}

    /// Fires when a handle is given back to its pool, and whether the
    /// connection was kept (1) or closed (0).
    fn handle__returned(pool: &str, kept: u8) {}

    /// Fires when a backend is marked as dead, with the backoff before it
    /// may be tried again.
    fn host__marked__dead(pool: &str, backoff_ms: u64) {}

    /// Fires when a key is moved from one backend to another.
    fn failover(key: &str, from: &str, to: &str) {}

    /// Fires when a scatter-gather fetch starts, with the number of backends
    /// and keys involved.
    fn fetch__start(hosts: u64, keys: u64) {}

    /// Fires when a scatter-gather fetch returns, with the number of
    /// backends which completed and the number of values found.
    fn fetch__done(hosts: u64, completed: u64, values: u64) {}
}
