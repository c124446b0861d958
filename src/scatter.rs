//! Fetches keys from many backends concurrently, under one deadline.

use crate::backend::{Connection, Name};
use crate::codec::{Codec, DecodeError, Value};
use crate::pool::deadline_after;
#[cfg(feature = "probes")]
use crate::probes;
use crate::router::{self, Router};

use bytes::BytesMut;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;
use tracing::{event, instrument, Level};

const READ_CHUNK: usize = 8 * 1024;

/// Why one backend contributed nothing to a fetch.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Backend unavailable")]
    Unavailable,

    #[error(transparent)]
    Router(#[from] router::Error),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode response")]
    Decode(#[from] DecodeError),
}

/// Drives one batched request per backend, all from the calling task.
pub struct ScatterGather<'a, Conn: Connection, C: ?Sized> {
    router: &'a Router<Conn>,
    codec: &'a C,
}

impl<'a, Conn, C> ScatterGather<'a, Conn, C>
where
    Conn: Connection + AsyncRead + AsyncWrite + Unpin,
    C: Codec + ?Sized,
{
    pub fn new(router: &'a Router<Conn>, codec: &'a C) -> Self {
        Self { router, codec }
    }

    /// Fetches each backend's keys from that backend.
    ///
    /// Returns whatever was found by backends which answered completely
    /// before `deadline` elapsed. Backends which fail, or are still
    /// answering at the deadline, contribute nothing, and their connections
    /// are closed.
    #[instrument(level = "debug", skip_all, fields(hosts = keys_by_host.len()), name = "ScatterGather::fetch")]
    pub async fn fetch(
        &self,
        keys_by_host: BTreeMap<Name, Vec<String>>,
        deadline: Duration,
    ) -> HashMap<String, Value> {
        let deadline = deadline_after(deadline);
        let mut requested = 0;
        let mut pending = FuturesUnordered::new();
        for (name, keys) in keys_by_host {
            if keys.is_empty() {
                continue;
            }
            if self.router.pool(&name).is_none() {
                event!(Level::WARN, backend = %name, "No pool for backend; skipping its keys");
                continue;
            }
            requested += keys.len();
            pending.push(async move {
                let result = fetch_host(self.router, &name, self.codec, &keys).await;
                (name, result)
            });
        }
        let hosts = pending.len();
        #[cfg(feature = "probes")]
        probes::fetch__start!(|| (hosts as u64, requested as u64));

        let mut results = HashMap::new();
        let mut completed = 0;
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((_, Ok(values))) => {
                        completed += 1;
                        results.extend(values);
                    }
                    Some((name, Err(err))) => {
                        event!(Level::WARN, backend = %name, err = ?err, "Backend dropped from fetch");
                    }
                    None => break,
                },
                _ = &mut timeout => {
                    event!(Level::DEBUG, outstanding = pending.len(), "Fetch deadline elapsed");
                    break;
                }
            }
        }
        // Outstanding requests hold their connections mid-response; dropping
        // them closes those connections.
        drop(pending);

        #[cfg(feature = "probes")]
        probes::fetch__done!(|| (hosts as u64, completed as u64, results.len() as u64));
        event!(
            Level::DEBUG,
            hosts,
            completed,
            requested,
            found = results.len(),
            "Fetch finished"
        );
        results
    }
}

// Acquires through the router, so that a failed connect backs the backend
// off for later calls.
async fn fetch_host<Conn, C>(
    router: &Router<Conn>,
    name: &Name,
    codec: &C,
    keys: &[String],
) -> Result<Vec<(String, Value)>, Error>
where
    Conn: Connection + AsyncRead + AsyncWrite + Unpin,
    C: Codec + ?Sized,
{
    let mut handle = router.try_acquire(name).await?.ok_or(Error::Unavailable)?;
    let mut request = BytesMut::new();
    codec.encode_get_multi(keys, &mut request);

    let conn: &mut Conn = &mut handle;
    conn.write_all(&request).await?;
    conn.flush().await?;

    let mut response = BytesMut::with_capacity(READ_CHUNK);
    let values = loop {
        response.reserve(READ_CHUNK);
        if conn.read_buf(&mut response).await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        if !codec.response_complete(&response) {
            continue;
        }
        if let Some(values) = codec.decode_get_multi(&response)? {
            break values;
        }
    };
    handle.release(true);

    let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
    Ok(values
        .into_iter()
        .filter(|(key, _)| wanted.contains(key.as_str()))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::TextCodec;
    use crate::connection::Connection as TcpConnection;
    use crate::connectors::tcp::TcpConnector;
    use crate::policy::{Policy, PoolConfig};
    use crate::servers::ServerConfig;
    use crate::test_utils::{refused_address, setup_tracing_subscriber, Behavior, FakeServer};
    use std::sync::Arc;

    fn router(servers: &[&FakeServer]) -> Router<TcpConnection> {
        router_for(servers.iter().map(|s| s.name()))
    }

    fn router_for(names: impl IntoIterator<Item = String>) -> Router<TcpConnection> {
        let policy = Policy {
            pool: PoolConfig {
                min_idle: 0,
                maintenance_interval: Duration::from_secs(3600),
                maintenance_spread: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let config = ServerConfig::new(names);
        Router::new(&config, Arc::new(TcpConnector::default()), policy).unwrap()
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_silent_backend_yields_partial_result() {
        setup_tracing_subscriber();
        let one = FakeServer::start(Behavior::Respond, &[("a", "1"), ("b", "2")]).await;
        let two = FakeServer::start(Behavior::Respond, &[("c", "3")]).await;
        let silent = FakeServer::start(Behavior::Silent, &[("d", "4")]).await;
        let router = router(&[&one, &two, &silent]);

        let by_host = BTreeMap::from([
            (Name::new(one.name()), keys(&["a", "b", "x"])),
            (Name::new(two.name()), keys(&["c"])),
            (Name::new(silent.name()), keys(&["d"])),
        ]);
        let start = std::time::Instant::now();
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::from_millis(200))
            .await;
        let elapsed = start.elapsed();

        let mut found: Vec<_> = values.keys().cloned().collect();
        found.sort();
        assert_eq!(found, vec!["a", "b", "c"]);
        assert_eq!(&values["b"].data[..], b"2");
        assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

        // Answered connections are pooled again; the silent one is closed.
        let stats = router.stats();
        assert_eq!(stats[&Name::new(one.name())].idle, 1);
        assert_eq!(stats[&Name::new(two.name())].idle, 1);
        let silent_stats = &stats[&Name::new(silent.name())];
        assert_eq!(silent_stats.idle, 0);
        assert_eq!(silent_stats.lent_out, 0);
        assert_eq!(silent_stats.destroyed, 1);
    }

    #[tokio::test]
    async fn test_returns_before_deadline_when_all_answer() {
        let one = FakeServer::start(Behavior::Respond, &[("a", "1")]).await;
        let router = router(&[&one]);

        let by_host = BTreeMap::from([(Name::new(one.name()), keys(&["a"]))]);
        let start = std::time::Instant::now();
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::from_secs(30))
            .await;
        assert_eq!(values.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unknown_and_empty_hosts_are_skipped() {
        let one = FakeServer::start(Behavior::Respond, &[("a", "1")]).await;
        let router = router(&[&one]);

        let by_host = BTreeMap::from([
            (Name::new("10.9.9.9:11211"), keys(&["a"])),
            (Name::new(one.name()), vec![]),
        ]);
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::from_millis(100))
            .await;
        assert!(values.is_empty());
        assert_eq!(one.accepted.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_error_only_drops_its_backend() {
        let one = FakeServer::start(Behavior::Respond, &[("a", "1")]).await;
        let failing = FakeServer::start(Behavior::Failing, &[("b", "2")]).await;
        let router = router(&[&one, &failing]);

        let by_host = BTreeMap::from([
            (Name::new(one.name()), keys(&["a"])),
            (Name::new(failing.name()), keys(&["b"])),
        ]);
        let start = std::time::Instant::now();
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::from_secs(30))
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["a"]);

        let stats = router.stats();
        assert_eq!(stats[&Name::new(one.name())].idle, 1);
        let failing_stats = &stats[&Name::new(failing.name())];
        assert_eq!(failing_stats.idle, 0);
        assert_eq!(failing_stats.lent_out, 0);
        assert_eq!(failing_stats.destroyed, 1);
        // The backend answered, so it is not dead.
        assert!(router.dead_hosts().is_empty());
    }

    #[tokio::test]
    async fn test_refused_backend_is_backed_off() {
        let one = FakeServer::start(Behavior::Respond, &[("a", "1")]).await;
        let refused = refused_address().await.to_string();
        let router = router_for([one.name(), refused.clone()]);

        let by_host = BTreeMap::from([
            (Name::new(one.name()), keys(&["a"])),
            (Name::new(refused.clone()), keys(&["b"])),
        ]);
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host.clone(), Duration::from_secs(5))
            .await;
        assert_eq!(values.len(), 1);
        let refused = Name::new(refused);
        assert!(router.dead_hosts().backoff(&refused).is_some());
        assert_eq!(router.stats()[&refused].created, 0);

        // While backing off, the backend is not even tried.
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::from_secs(5))
            .await;
        assert_eq!(values.len(), 1);
        assert_eq!(
            router.dead_hosts().backoff(&refused),
            Some(crate::dead_hosts::BASE_RETRY_DELAY)
        );
    }

    #[tokio::test]
    async fn test_unbounded_deadline() {
        let one = FakeServer::start(Behavior::Respond, &[("a", "1")]).await;
        let router = router(&[&one]);

        let by_host = BTreeMap::from([(Name::new(one.name()), keys(&["a"]))]);
        let values = ScatterGather::new(&router, &TextCodec)
            .fetch(by_host, Duration::MAX)
            .await;
        assert_eq!(values.len(), 1);
    }
}
