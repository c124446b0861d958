//! Maps key hashes onto backends.
//!
//! Two layouts are supported:
//!
//! * A flat bucket list, where each backend appears once per unit of weight,
//!   and a key lands on bucket `|hash mod buckets|`.
//! * A consistent-hash continuum, where each backend owns a number of points
//!   on a 32-bit circle proportional to its weight, and a key lands on the
//!   first point at or after its hash (wrapping around). Removing one of N
//!   backends only moves the keys that backend owned, roughly 1/N of them.
//!
//! A ring is derived purely from the server list and algorithm, and never
//! changes afterwards.

use crate::backend::Name;
use crate::hash::{md5_point, HashAlgorithm};
use crate::servers::ServerList;

use md5::{Digest, Md5};
use std::collections::BTreeMap;

// Digests per server are scaled so that the average server takes this many.
const DIGESTS_PER_SERVER: u64 = 40;

// Each MD5 digest provides four points on the continuum.
const POINTS_PER_DIGEST: usize = 4;

#[derive(Clone, Debug)]
enum Buckets {
    Flat(Vec<Name>),
    Consistent(BTreeMap<u32, Name>),
}

#[derive(Clone, Debug)]
pub struct Ring {
    algorithm: HashAlgorithm,
    buckets: Buckets,
    // Backends with weight > 0, in configuration order.
    members: Vec<Name>,
    // Set when only one server is configured; the ring is bypassed.
    single: Option<Name>,
}

impl Ring {
    pub fn new(servers: &ServerList, algorithm: HashAlgorithm) -> Self {
        let members: Vec<Name> = servers
            .iter()
            .filter(|s| s.weight > 0)
            .map(|s| s.name.clone())
            .collect();
        let single = match servers.len() {
            1 => servers.iter().next().map(|s| s.name.clone()),
            _ => None,
        };

        let buckets = if algorithm.is_consistent() {
            Buckets::Consistent(build_continuum(servers))
        } else {
            Buckets::Flat(build_flat(servers))
        };

        Self {
            algorithm,
            buckets,
            members,
            single,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Backends which can be selected, in configuration order.
    pub fn members(&self) -> &[Name] {
        match &self.single {
            Some(single) => std::slice::from_ref(single),
            None => &self.members,
        }
    }

    /// Number of buckets (flat) or points (consistent) on the ring.
    pub fn len(&self) -> usize {
        match &self.buckets {
            Buckets::Flat(buckets) => buckets.len(),
            Buckets::Consistent(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hashes a key, or interprets a caller-supplied hash.
    ///
    /// Overrides are read as unsigned 32-bit values on a consistent ring,
    /// and as signed values otherwise.
    pub fn hash(&self, key: &str, hash_override: Option<i32>) -> i64 {
        match (hash_override, &self.buckets) {
            (Some(hash), Buckets::Consistent(_)) => i64::from(hash as u32),
            (Some(hash), Buckets::Flat(_)) => i64::from(hash),
            (None, _) => self.algorithm.hash(key),
        }
    }

    /// Returns the backend responsible for a key.
    ///
    /// Returns `None` only if no backend has a non-zero weight.
    pub fn resolve(&self, key: &str, hash_override: Option<i32>) -> Option<&Name> {
        if let Some(single) = &self.single {
            return Some(single);
        }
        let hash = self.hash(key, hash_override);
        match &self.buckets {
            Buckets::Flat(buckets) => {
                if buckets.is_empty() {
                    return None;
                }
                let index = (hash % buckets.len() as i64).unsigned_abs() as usize;
                buckets.get(index)
            }
            Buckets::Consistent(points) => {
                // Consistent hashes are always within u32.
                let point = hash as u32;
                points
                    .range(point..)
                    .next()
                    .or_else(|| points.iter().next())
                    .map(|(_, name)| name)
            }
        }
    }
}

fn build_flat(servers: &ServerList) -> Vec<Name> {
    let mut buckets = Vec::with_capacity(servers.total_weight() as usize);
    for server in servers {
        for _ in 0..server.weight {
            buckets.push(server.name.clone());
        }
    }
    buckets
}

fn build_continuum(servers: &ServerList) -> BTreeMap<u32, Name> {
    let total_weight = servers.total_weight();
    let server_count = servers.len() as u64;
    let mut points = BTreeMap::new();
    if total_weight == 0 {
        return points;
    }

    for server in servers {
        if server.weight == 0 {
            continue;
        }
        let digests = std::cmp::max(
            1,
            DIGESTS_PER_SERVER * server_count * u64::from(server.weight) / total_weight,
        );
        for j in 0..digests {
            let digest = Md5::digest(format!("{}-{}", server.name, j).as_bytes());
            for h in 0..POINTS_PER_DIGEST {
                points.insert(md5_point(&digest, h), server.name.clone());
            }
        }
    }
    points
}
