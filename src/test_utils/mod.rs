//! Utilities to help with testing mcpool

use crate::backend::{self, Backend, Connector, Name};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// An in-memory connection, identified by the order it was created in.
#[derive(Debug)]
pub struct TestConnection {
    pub id: usize,
    pub backend: Backend,
}

/// A test-only connector which never touches the network.
///
/// Connections to specific backends can be made to fail, and every attempt
/// is recorded.
pub struct TestConnector {
    next_id: AtomicUsize,
    delay: Duration,
    valid: AtomicBool,
    probes: AtomicUsize,
    failing: Mutex<HashSet<Name>>,
    attempts: Mutex<Vec<Name>>,
}

impl TestConnector {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Creates a connector which takes `delay` to make each connection.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            delay,
            valid: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            attempts: Mutex::new(vec![]),
        }
    }

    pub fn fail(&self, name: &Name) {
        self.failing.lock().unwrap().insert(name.clone());
    }

    pub fn heal(&self, name: &Name) {
        self.failing.lock().unwrap().remove(name);
    }

    /// Controls the outcome of liveness probes.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Returns the number of connections successfully made.
    pub fn connects(&self) -> usize {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Returns every backend a connection was attempted to, in order.
    pub fn attempts(&self) -> Vec<Name> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn clear_attempts(&self) {
        self.attempts.lock().unwrap().clear();
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, backend: &Backend) -> Result<Self::Connection, backend::Error> {
        self.attempts.lock().unwrap().push(backend.name.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(&backend.name) {
            return Err(backend::Error::Other(anyhow::anyhow!(
                "{} is unreachable",
                backend.name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(TestConnection {
            id,
            backend: backend.clone(),
        })
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), backend::Error> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(backend::Error::Other(anyhow::anyhow!("probe failed")))
        }
    }
}

/// How a fake memcached server treats requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Answers text protocol "get" and "version" requests.
    Respond,
    /// Reads requests, but never answers them.
    Silent,
    /// Answers "version", but fails every "get" with a server error.
    Failing,
}

/// A fake memcached server, speaking enough of the text protocol for
/// multi-gets and liveness probes.
pub struct FakeServer {
    pub address: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(behavior: Behavior, items: &[(&str, &str)]) -> Self {
        let items: Arc<HashMap<String, Vec<u8>>> = Arc::new(
            items
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bound localhost");
        let address = listener.local_addr().expect("got local_addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn({
            let accepted = accepted.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let items = items.clone();
                    tokio::spawn(async move {
                        let (read, mut write) = stream.into_split();
                        let mut read = BufReader::new(read);
                        if behavior == Behavior::Silent {
                            let mut sink = vec![0; 1024];
                            while let Ok(n) = read.read(&mut sink).await {
                                if n == 0 {
                                    return;
                                }
                            }
                            return;
                        }
                        let mut line = String::new();
                        loop {
                            line.clear();
                            match read.read_line(&mut line).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) => {}
                            }
                            let response = respond(behavior, &items, line.trim_end());
                            if write.write_all(&response).await.is_err() {
                                return;
                            }
                        }
                    });
                }
            }
        });
        Self {
            address,
            accepted,
            handle,
        }
    }

    pub fn name(&self) -> String {
        self.address.to_string()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn respond(behavior: Behavior, items: &HashMap<String, Vec<u8>>, line: &str) -> Vec<u8> {
    let mut words = line.split_whitespace();
    let mut out = vec![];
    match words.next() {
        Some("get") | Some("gets") if behavior == Behavior::Failing => {
            out.extend_from_slice(b"SERVER_ERROR out of memory storing object\r\n");
        }
        Some("get") | Some("gets") => {
            for key in words {
                if let Some(value) = items.get(key) {
                    out.extend_from_slice(format!("VALUE {key} 0 {}\r\n", value.len()).as_bytes());
                    out.extend_from_slice(value);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
        }
        Some("version") => out.extend_from_slice(b"VERSION 1.6.21\r\n"),
        _ => out.extend_from_slice(b"ERROR\r\n"),
    }
    out
}

/// Returns an address on localhost which refuses connections.
pub async fn refused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bound localhost");
    listener.local_addr().expect("got local_addr")
}
