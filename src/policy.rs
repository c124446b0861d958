//! Configuration options which can alter the behavior of the router and its pools.

use crate::hash::HashAlgorithm;

use tokio::time::Duration;

/// What a pool does when every connection it may create is in use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WhenExhausted {
    /// Wait up to [PoolConfig::acquire_timeout] for a connection to be released.
    #[default]
    Wait,

    /// Create a temporary connection, which is closed when released.
    Grow,
}

/// Configuration for the connections to a single backend.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Idle connections the maintenance task keeps open.
    pub min_idle: usize,

    /// Connections (idle plus lent out) the pool may hold.
    pub max_total: usize,

    /// How long [crate::pool::HostPool::acquire] waits for a connection to
    /// be released, with [WhenExhausted::Wait].
    pub acquire_timeout: Duration,

    pub when_exhausted: WhenExhausted,

    /// Whether idle connections are probed before being handed out.
    pub test_on_borrow: bool,

    /// How long a liveness probe may take.
    pub health_check_timeout: Duration,

    /// How often the maintenance task runs.
    pub maintenance_interval: Duration,

    /// Random delay added to each maintenance interval, so that pools
    /// created together do not sweep in lockstep.
    pub maintenance_spread: Duration,

    /// Idle connections older than this are closed by maintenance.
    pub max_idle: Duration,

    /// Connections lent out for longer than this are considered leaked, and
    /// are reclaimed by maintenance.
    pub max_busy: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_total: 16,
            acquire_timeout: Duration::from_secs(1),
            when_exhausted: WhenExhausted::Wait,
            test_on_borrow: false,
            health_check_timeout: Duration::from_secs(3),
            maintenance_interval: Duration::from_secs(30),
            maintenance_spread: Duration::from_secs(1),
            max_idle: Duration::from_secs(3 * 60),
            max_busy: Duration::from_secs(30),
        }
    }
}

/// Policy which is applicable to a router.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
    /// How keys are mapped to backends.
    pub hashing: HashAlgorithm,

    /// Whether a key whose backend is unreachable moves to another backend.
    pub failover: bool,

    /// Whether backends which recently failed are skipped until their
    /// backoff elapses.
    pub failback: bool,

    /// Configuration for each backend's pool.
    pub pool: PoolConfig,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            hashing: HashAlgorithm::default(),
            failover: true,
            failback: true,
            pool: PoolConfig::default(),
        }
    }
}
