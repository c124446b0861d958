//! Routes keys to backends, failing over when a backend is unreachable.

use crate::backend::{self, Backend, Connection, Name};
use crate::claim;
use crate::codec::{Codec, Value};
use crate::dead_hosts::DeadHosts;
use crate::policy::Policy;
use crate::pool::{self, HostPool};
#[cfg(feature = "probes")]
use crate::probes;
use crate::ring::Ring;
use crate::scatter::ScatterGather;
use crate::servers::{self, ServerConfig, ServerList};

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{event, instrument, Level};

// Rehashes attempted per failover before falling back to registry order.
const MAX_REHASH: u32 = 100;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid server configuration")]
    Config(#[from] servers::Error),

    #[error("No backend could serve key {key:?}")]
    NoConnection { key: String },

    #[error("Router terminated")]
    Terminated,
}

/// Turns keys into connections.
///
/// A router owns one [HostPool] per selectable backend, the [Ring] which
/// maps keys onto them, and the [DeadHosts] record used to back off from
/// backends which fail to connect.
pub struct Router<Conn: Connection> {
    servers: ServerList,
    ring: Ring,
    pools: BTreeMap<Name, HostPool<Conn>>,
    dead_hosts: DeadHosts,
    policy: Policy,
}

impl<Conn: Connection> Router<Conn> {
    /// Creates a router, and a pool for every backend it may select.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(connector, policy), name = "Router::new")]
    pub fn new(
        config: &ServerConfig,
        connector: backend::SharedConnector<Conn>,
        policy: Policy,
    ) -> Result<Self, Error> {
        let servers = ServerList::new(config)?;
        let ring = Ring::new(&servers, policy.hashing);
        let pools = ring
            .members()
            .iter()
            .filter_map(|name| servers.get(name.as_str()))
            .map(|backend| {
                let pool = HostPool::new(backend.clone(), connector.clone(), policy.pool.clone());
                (backend.name.clone(), pool)
            })
            .collect();

        #[cfg(feature = "probes")]
        if let Err(err) = usdt::register_probes() {
            event!(Level::WARN, err = ?err, "Failed to register USDT probes");
        }

        event!(
            Level::INFO,
            servers = servers.len(),
            hashing = ?policy.hashing,
            "Router created"
        );
        Ok(Self {
            servers,
            ring,
            pools,
            dead_hosts: DeadHosts::new(),
            policy,
        })
    }

    pub fn servers(&self) -> &ServerList {
        &self.servers
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn dead_hosts(&self) -> &DeadHosts {
        &self.dead_hosts
    }

    /// Returns the pool for a backend, if the router may select it.
    pub fn pool(&self, name: &Name) -> Option<&HostPool<Conn>> {
        self.pools.get(name)
    }

    /// Samples the state of every pool.
    pub fn stats(&self) -> BTreeMap<Name, pool::Stats> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Returns the backend a key maps to, without connecting or considering
    /// failures.
    pub fn server_for(&self, key: &str, hash_override: Option<i32>) -> Option<&Backend> {
        self.ring
            .resolve(key, hash_override)
            .and_then(|name| self.servers.get(name.as_str()))
    }

    /// Returns a connection to the backend responsible for `key`.
    ///
    /// If that backend cannot be reached and failover is enabled, the key is
    /// rehashed onto the remaining backends, each of which is tried at most
    /// once. Backends which recently failed to connect are skipped while
    /// failback is enabled and their backoff lasts.
    #[instrument(level = "debug", skip(self), err, name = "Router::resolve")]
    pub async fn resolve(
        &self,
        key: &str,
        hash_override: Option<i32>,
    ) -> Result<claim::Handle<Conn>, Error> {
        let no_connection = || Error::NoConnection {
            key: key.to_string(),
        };
        let mut candidate = self
            .ring
            .resolve(key, hash_override)
            .cloned()
            .ok_or_else(no_connection)?;
        let mut untried: Vec<&Name> = self.ring.members().iter().collect();

        loop {
            untried.retain(|name| **name != candidate);
            match self.try_acquire(&candidate).await {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(err) => return Err(err),
            }

            if !self.policy.failover || untried.is_empty() {
                event!(Level::WARN, key, "No backend available");
                return Err(no_connection());
            }
            let next = self.next_candidate(key, &untried);
            #[cfg(feature = "probes")]
            probes::failover!(|| (key, candidate.as_str(), next.as_str()));
            event!(Level::DEBUG, key, from = %candidate, to = %next, "Failing over");
            candidate = next.clone();
        }
    }

    /// Returns the backend `key` would be served by, without connecting.
    ///
    /// Follows the same failover order as [Self::resolve], but only skips
    /// backends which are backing off after a failed connect.
    pub fn route(&self, key: &str) -> Option<&Name> {
        let mut candidate = self.ring.resolve(key, None)?;
        let mut untried: Vec<&Name> = self.ring.members().iter().collect();
        loop {
            untried.retain(|name| *name != candidate);
            if self.pools.contains_key(candidate)
                && !self.dead_hosts.is_suppressed(candidate, self.policy.failback)
            {
                return Some(candidate);
            }
            if !self.policy.failover || untried.is_empty() {
                return None;
            }
            candidate = self.next_candidate(key, &untried);
        }
    }

    // Returns a connection to one backend, or `None` if the caller should
    // fail over.
    pub(crate) async fn try_acquire(
        &self,
        name: &Name,
    ) -> Result<Option<claim::Handle<Conn>>, Error> {
        if self.dead_hosts.is_suppressed(name, self.policy.failback) {
            event!(Level::TRACE, backend = %name, "Skipping backend during backoff");
            return Ok(None);
        }
        let Some(pool) = self.pools.get(name) else {
            return Ok(None);
        };
        match pool.acquire().await {
            Ok(handle) => {
                self.dead_hosts.mark_recovered(name);
                Ok(Some(handle))
            }
            Err(pool::Error::Connect { .. }) => {
                let backoff = self.dead_hosts.mark_failed(name);
                #[cfg(feature = "probes")]
                probes::host__marked__dead!(|| (name.as_str(), backoff.as_millis() as u64));
                event!(Level::WARN, backend = %name, ?backoff, "Backend unreachable");
                Ok(None)
            }
            // The backend is alive, only busy.
            Err(pool::Error::Timeout(_)) => Ok(None),
            Err(pool::Error::Terminated) => Err(Error::Terminated),
        }
    }

    // Rehashes the key as "0key", "1key", ... until it lands on an untried
    // backend. The counter restarts at zero for every failover.
    fn next_candidate<'a>(&'a self, key: &str, untried: &[&'a Name]) -> &'a Name {
        for attempt in 0..MAX_REHASH {
            let rehashed = format!("{attempt}{key}");
            if let Some(name) = self.ring.resolve(&rehashed, None) {
                if untried.contains(&name) {
                    return name;
                }
            }
        }
        untried[0]
    }

    /// Groups keys by the backend serving them.
    ///
    /// Each key is resolved (with failover) in turn, and the connection used
    /// to resolve it is given back immediately. Keys which no backend can
    /// serve are left out.
    pub async fn partition<K: AsRef<str>>(&self, keys: &[K]) -> BTreeMap<Name, Vec<String>> {
        let mut by_host: BTreeMap<Name, Vec<String>> = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            match self.resolve(key, None).await {
                Ok(handle) => {
                    by_host
                        .entry(handle.backend().name.clone())
                        .or_default()
                        .push(key.to_string());
                    handle.release(true);
                }
                Err(err) => {
                    event!(Level::DEBUG, key, err = %err, "Dropping key from partition");
                }
            }
        }
        by_host
    }

    /// Stops every pool. Further calls to [Self::resolve] fail with
    /// [Error::Terminated].
    #[instrument(skip(self), name = "Router::terminate")]
    pub async fn terminate(&self) {
        for pool in self.pools.values() {
            pool.terminate().await;
        }
    }
}

impl<Conn> Router<Conn>
where
    Conn: Connection + AsyncRead + AsyncWrite + Unpin,
{
    /// Fetches many keys at once, from every backend involved concurrently.
    ///
    /// Keys are grouped with [Self::route], so no connection is made before
    /// the fetch starts, and `deadline` bounds the whole call. Keys which are
    /// missing, or whose backend did not answer in time, are absent from the
    /// result.
    pub async fn get_multi<C, K>(
        &self,
        codec: &C,
        keys: &[K],
        deadline: Duration,
    ) -> HashMap<String, Value>
    where
        C: Codec + ?Sized,
        K: AsRef<str>,
    {
        let mut by_host: BTreeMap<Name, Vec<String>> = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            match self.route(key) {
                Some(name) => by_host.entry(name.clone()).or_default().push(key.to_string()),
                None => event!(Level::DEBUG, key, "No backend for key"),
            }
        }
        ScatterGather::new(self, codec).fetch(by_host, deadline).await
    }
}
