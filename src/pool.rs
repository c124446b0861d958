//! A pool of connections to one backend, which vends out [claim::Handle]s

use crate::backend::{self, Backend, Connection};
use crate::backoff::ExponentialBackoff;
use crate::claim;
use crate::join::abort_and_join;
use crate::policy::{PoolConfig, WhenExhausted};
#[cfg(feature = "probes")]
use crate::probes;
use crate::ClaimId;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to connect to {name}")]
    Connect {
        name: backend::Name,
        #[source]
        err: backend::Error,
    },

    #[error("Timed out waiting for a connection to {0}")]
    Timeout(backend::Name),

    #[error("Pool terminated")]
    Terminated,
}

impl Error {
    #[cfg(feature = "probes")]
    // Convert to a static string for USDT probes.
    const fn as_str(&self) -> &'static str {
        match self {
            Error::Connect { .. } => "Connect",
            Error::Timeout(_) => "Timeout",
            Error::Terminated => "Terminated",
        }
    }
}

// Deadlines further out than this are as good as never.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Returns the instant `timeout` from now, saturating rather than
/// overflowing for huge timeouts such as [Duration::MAX].
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// A point-in-time view of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Stats {
    /// Connections waiting to be borrowed.
    pub idle: usize,

    /// Pooled connections currently borrowed, including those being
    /// created or probed on behalf of a caller.
    pub lent_out: usize,

    /// Overflow connections currently borrowed.
    pub overflow: usize,

    /// Connections created over the lifetime of the pool.
    pub created: usize,

    /// Connections closed over the lifetime of the pool.
    pub destroyed: usize,

    /// Borrowed connections reclaimed by maintenance after `max_busy`.
    pub reclaimed: usize,
}

type LeaseId = u64;

/// Tracks one borrowed, pooled connection.
#[derive(Debug)]
pub(crate) struct Lease {
    id: LeaseId,
    revoked: Arc<AtomicBool>,
}

impl Lease {
    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

#[derive_where(Debug)]
struct Idle<Conn: Connection> {
    conn: DebugIgnore<Conn>,
    since: Instant,
}

#[derive(Debug)]
struct Busy {
    since: Instant,
    revoked: Arc<AtomicBool>,
}

#[derive_where(Debug)]
struct State<Conn: Connection> {
    // Most recently returned at the back.
    idle: VecDeque<Idle<Conn>>,
    busy: BTreeMap<LeaseId, Busy>,

    // Capacity reserved for connections being created or probed.
    pending: usize,

    overflow: usize,
    next_lease: LeaseId,
    terminated: bool,

    created: usize,
    destroyed: usize,
    reclaimed: usize,
}

impl<Conn: Connection> State<Conn> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            busy: BTreeMap::new(),
            pending: 0,
            overflow: 0,
            next_lease: 0,
            terminated: false,
            created: 0,
            destroyed: 0,
            reclaimed: 0,
        }
    }

    // Connections which count against "max_total".
    fn counted(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }
}

// The next thing an acquire request should do, decided under the lock.
enum Step<Conn: Connection> {
    Borrow(Conn, Reservation<Conn>),
    Create(Reservation<Conn>),
    Exhausted,
}

/// State shared between a [HostPool], its maintenance task, and its handles.
pub(crate) struct Shared<Conn: Connection> {
    backend: Backend,
    config: PoolConfig,
    connector: backend::SharedConnector<Conn>,
    state: Mutex<State<Conn>>,
    released: Notify,
}

impl<Conn: Connection> Shared<Conn> {
    fn name(&self) -> &str {
        self.backend.name.as_str()
    }

    fn next_step(self: &Arc<Self>) -> Result<Step<Conn>, Error> {
        let mut state = self.state.lock().unwrap();
        if state.terminated {
            return Err(Error::Terminated);
        }
        if let Some(idle) = state.idle.pop_back() {
            state.pending += 1;
            return Ok(Step::Borrow(idle.conn.0, Reservation::new(self.clone())));
        }
        if state.counted() < self.config.max_total {
            state.pending += 1;
            return Ok(Step::Create(Reservation::new(self.clone())));
        }
        Ok(Step::Exhausted)
    }

    #[cfg_attr(not(feature = "probes"), allow(unused_variables))]
    async fn connect(&self, id: ClaimId) -> Result<Conn, Error> {
        #[cfg(feature = "probes")]
        probes::connect__start!(|| (self.name(), id.0));
        match self.connector.connect(&self.backend).await {
            Ok(conn) => {
                #[cfg(feature = "probes")]
                probes::connect__done!(|| (self.name(), id.0));
                self.state.lock().unwrap().created += 1;
                Ok(conn)
            }
            Err(err) => {
                #[cfg(feature = "probes")]
                probes::connect__failed!(|| (self.name(), id.0, err.to_string()));
                event!(Level::WARN, backend = self.name(), err = ?err, "Failed to connect");
                Err(Error::Connect {
                    name: self.backend.name.clone(),
                    err,
                })
            }
        }
    }

    // Returns a borrowed connection to the pool, or closes it.
    pub(crate) fn check_in(&self, conn: Conn, lease: Option<Lease>, reusable: bool) {
        let mut state = self.state.lock().unwrap();
        let kept = match lease {
            Some(lease) => {
                // Reclaimed leases were already removed by maintenance, and no
                // longer count against the pool.
                let counted = state.busy.remove(&lease.id).is_some();
                if counted {
                    self.released.notify_one();
                }
                if counted && reusable && !state.terminated {
                    state.idle.push_back(Idle {
                        conn: DebugIgnore(conn),
                        since: Instant::now(),
                    });
                    true
                } else {
                    state.destroyed += 1;
                    drop(conn);
                    false
                }
            }
            None => {
                state.overflow = state.overflow.saturating_sub(1);
                state.destroyed += 1;
                drop(conn);
                false
            }
        };
        drop(state);

        #[cfg(feature = "probes")]
        probes::handle__returned!(|| (self.name(), u8::from(kept)));
        event!(Level::TRACE, backend = self.name(), kept, "Connection returned");
    }

    // One pass of pool maintenance:
    // - Closes idle connections older than "max_idle", down to "min_idle"
    // - Reclaims leases held longer than "max_busy"
    // - Opens connections until "min_idle" are available
    #[instrument(level = "trace", skip(self), fields(backend = self.name()))]
    async fn maintain(self: &Arc<Self>) {
        let now = Instant::now();
        let (evicted, reclaimed) = {
            let mut state = self.state.lock().unwrap();
            let mut evicted = vec![];
            while state.idle.len() > self.config.min_idle {
                match state.idle.front() {
                    Some(idle) if now.duration_since(idle.since) >= self.config.max_idle => {
                        evicted.extend(state.idle.pop_front());
                    }
                    _ => break,
                }
            }
            state.destroyed += evicted.len();

            let max_busy = self.config.max_busy;
            let mut reclaimed = 0;
            state.busy.retain(|_, busy| {
                if now.duration_since(busy.since) >= max_busy {
                    busy.revoked.store(true, Ordering::Release);
                    reclaimed += 1;
                    false
                } else {
                    true
                }
            });
            state.reclaimed += reclaimed;
            (evicted, reclaimed)
        };

        if !evicted.is_empty() {
            event!(Level::DEBUG, count = evicted.len(), "Closed expired idle connections");
        }
        drop(evicted);
        if reclaimed > 0 {
            event!(Level::WARN, count = reclaimed, "Reclaimed leaked connections");
            for _ in 0..reclaimed {
                self.released.notify_one();
            }
        }

        loop {
            let reservation = {
                let mut state = self.state.lock().unwrap();
                if state.terminated
                    || state.idle.len() + state.pending >= self.config.min_idle
                    || state.counted() >= self.config.max_total
                {
                    break;
                }
                state.pending += 1;
                Reservation::new(self.clone())
            };
            match self.connect(ClaimId::new()).await {
                Ok(conn) => reservation.into_idle(conn),
                // Don't retry until the next pass.
                Err(_) => break,
            }
        }
    }
}

/// Capacity reserved within a pool on behalf of one connection.
///
/// Dropping a reservation returns the capacity, so an acquire which is
/// cancelled mid-connect does not shrink the pool.
struct Reservation<Conn: Connection> {
    pool: Option<Arc<Shared<Conn>>>,
}

impl<Conn: Connection> Reservation<Conn> {
    fn new(pool: Arc<Shared<Conn>>) -> Self {
        Self { pool: Some(pool) }
    }

    // Converts the reservation into a lease on a borrowed connection.
    fn into_handle(mut self, conn: Conn) -> claim::Handle<Conn> {
        let pool = self.pool.take().unwrap();
        let lease = {
            let mut state = pool.state.lock().unwrap();
            state.pending -= 1;
            let id = state.next_lease;
            state.next_lease += 1;
            let revoked = Arc::new(AtomicBool::new(false));
            state.busy.insert(
                id,
                Busy {
                    since: Instant::now(),
                    revoked: revoked.clone(),
                },
            );
            Lease { id, revoked }
        };
        let backend = pool.backend.clone();
        claim::Handle::new(conn, Some(lease), backend, pool)
    }

    fn into_idle(mut self, conn: Conn) {
        let pool = self.pool.take().unwrap();
        {
            let mut state = pool.state.lock().unwrap();
            state.pending -= 1;
            state.idle.push_back(Idle {
                conn: DebugIgnore(conn),
                since: Instant::now(),
            });
        }
        pool.released.notify_one();
    }

    // Gives up the reservation, closing the connection it was made for.
    fn discard(mut self, conn: Conn) {
        let pool = self.pool.take().unwrap();
        pool.state.lock().unwrap().destroyed += 1;
        drop(conn);
        pool.cancel_reservation();
    }
}

impl<Conn: Connection> Shared<Conn> {
    fn cancel_reservation(&self) {
        self.state.lock().unwrap().pending -= 1;
        self.released.notify_one();
    }
}

impl<Conn: Connection> Drop for Reservation<Conn> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.cancel_reservation();
        }
    }
}

/// Manages the connections to a single backend.
pub struct HostPool<Conn: Connection> {
    shared: Arc<Shared<Conn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<Conn: Connection> HostPool<Conn> {
    /// Creates a new pool, and starts its maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(connector, config), fields(backend = %backend.name), name = "HostPool::new")]
    pub fn new(
        backend: Backend,
        connector: backend::SharedConnector<Conn>,
        config: PoolConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            backend,
            config,
            connector,
            state: Mutex::new(State::new()),
            released: Notify::new(),
        });

        let handle = tokio::task::spawn({
            let shared = shared.clone();
            async move {
                loop {
                    shared.maintain().await;
                    let period = shared
                        .config
                        .maintenance_interval
                        .add_spread(shared.config.maintenance_spread);
                    sleep(period).await;
                }
            }
        });

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The backend this pool connects to.
    pub fn backend(&self) -> &Backend {
        &self.shared.backend
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Samples the state of the pool.
    pub fn stats(&self) -> Stats {
        let state = self.shared.state.lock().unwrap();
        Stats {
            idle: state.idle.len(),
            lent_out: state.busy.len() + state.pending,
            overflow: state.overflow,
            created: state.created,
            destroyed: state.destroyed,
            reclaimed: state.reclaimed,
        }
    }

    /// Acquires a connection to the backend.
    ///
    /// Idle connections are preferred, most recently used first. If none are
    /// idle and the pool has room, a new connection is made. Otherwise, the
    /// pool's [WhenExhausted] policy decides between waiting and creating an
    /// overflow connection.
    #[instrument(level = "debug", skip(self), err, fields(backend = %self.shared.backend.name), name = "HostPool::acquire")]
    pub async fn acquire(&self) -> Result<claim::Handle<Conn>, Error> {
        let id = ClaimId::new();
        #[cfg(feature = "probes")]
        probes::acquire__start!(|| (self.shared.name(), id.0));
        let res = self.do_acquire(id).await;
        #[cfg(feature = "probes")]
        match &res {
            Ok(handle) => {
                probes::acquire__done!(|| (self.shared.name(), id.0, u8::from(handle.is_pooled())))
            }
            Err(e) => probes::acquire__failed!(|| (self.shared.name(), id.0, e.as_str())),
        }
        res
    }

    async fn do_acquire(&self, id: ClaimId) -> Result<claim::Handle<Conn>, Error> {
        let deadline = deadline_after(self.shared.config.acquire_timeout);
        loop {
            // Register for release notifications before inspecting the pool,
            // so that a release racing with this check still wakes us.
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.shared.next_step()? {
                Step::Borrow(conn, reservation) => {
                    if let Some(handle) = self.validate(conn, reservation).await {
                        return Ok(handle);
                    }
                }
                Step::Create(reservation) => {
                    let conn = self.shared.connect(id).await?;
                    return Ok(reservation.into_handle(conn));
                }
                Step::Exhausted => match self.shared.config.when_exhausted {
                    WhenExhausted::Grow => return self.create_overflow(id).await,
                    WhenExhausted::Wait => {
                        event!(Level::TRACE, "Pool exhausted, waiting for a release");
                        if tokio::time::timeout_at(deadline, released).await.is_err() {
                            return Err(Error::Timeout(self.shared.backend.name.clone()));
                        }
                    }
                },
            }
        }
    }

    // Probes an idle connection, if the pool is configured to do so.
    async fn validate(
        &self,
        mut conn: Conn,
        reservation: Reservation<Conn>,
    ) -> Option<claim::Handle<Conn>> {
        if !self.shared.config.test_on_borrow {
            return Some(reservation.into_handle(conn));
        }
        let result = tokio::time::timeout(
            self.shared.config.health_check_timeout,
            self.shared.connector.is_valid(&mut conn),
        )
        .await;
        match result {
            Ok(Ok(())) => Some(reservation.into_handle(conn)),
            Ok(Err(err)) => {
                event!(Level::WARN, err = ?err, "Idle connection failed liveness probe");
                reservation.discard(conn);
                None
            }
            Err(_) => {
                event!(Level::WARN, "Idle connection timed out during liveness probe");
                reservation.discard(conn);
                None
            }
        }
    }

    async fn create_overflow(&self, id: ClaimId) -> Result<claim::Handle<Conn>, Error> {
        let conn = self.shared.connect(id).await?;
        self.shared.state.lock().unwrap().overflow += 1;
        event!(Level::DEBUG, "Created overflow connection");
        Ok(claim::Handle::new(
            conn,
            None,
            self.shared.backend.clone(),
            self.shared.clone(),
        ))
    }

    /// Stops maintenance and closes all idle connections.
    ///
    /// Borrowed connections are closed as they are released. Further calls
    /// to [Self::acquire] fail with [Error::Terminated].
    #[instrument(skip(self), fields(backend = %self.shared.backend.name), name = "HostPool::terminate")]
    pub async fn terminate(&self) {
        let idle = {
            let mut state = self.shared.state.lock().unwrap();
            state.terminated = true;
            let idle = std::mem::take(&mut state.idle);
            state.destroyed += idle.len();
            idle
        };
        drop(idle);
        self.shared.released.notify_waiters();

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            abort_and_join(handle).await;
        }
    }
}

impl<Conn: Connection> Drop for HostPool<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
