//! Connections which are borrowed from a connection pool.

use crate::backend::{Backend, Connection};
use crate::pool::{Lease, Shared};

use std::sync::Arc;

/// A [Connection] borrowed from a [crate::pool::HostPool].
///
/// Note that this type implements [std::ops::Deref] for the generic `Conn`
/// type, and generally, clients should transparently use a handle as a
/// connection.
///
/// A handle is given back with [Handle::release]. Dropping a handle without
/// releasing it closes the connection: the pool cannot know whether the
/// stream was left in the middle of a response.
pub struct Handle<Conn: Connection> {
    inner: Option<Conn>,
    lease: Option<Lease>,
    backend: Backend,
    pool: Arc<Shared<Conn>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        conn: Conn,
        lease: Option<Lease>,
        backend: Backend,
        pool: Arc<Shared<Conn>>,
    ) -> Self {
        Self {
            inner: Some(conn),
            lease,
            backend,
            pool,
        }
    }

    /// The backend this connection is bound to.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Returns true if this connection will return to the idle pool when
    /// released as reusable.
    ///
    /// Overflow connections, and connections held long enough to be
    /// reclaimed by pool maintenance, are closed instead.
    pub fn is_pooled(&self) -> bool {
        self.lease.as_ref().is_some_and(|lease| !lease.is_revoked())
    }

    /// Gives the connection back to its pool.
    ///
    /// With `reusable`, a pooled connection becomes idle and may be handed
    /// to the next caller; the caller is asserting that the stream is at a
    /// command boundary. Otherwise, the connection is closed.
    pub fn release(mut self, reusable: bool) {
        if let Some(conn) = self.inner.take() {
            self.pool.check_in(conn, self.lease.take(), reusable);
        }
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut().unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.take() {
            self.pool.check_in(conn, self.lease.take(), false);
        }
    }
}
