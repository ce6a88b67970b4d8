use super::LoadBalancer;

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use twox_hash::XxHash64;

const SEED: u64 = 0;

/// One ring of address points for a service.
#[derive(Debug)]
struct Ring {
    /// Identifies the candidate set the ring was built from.
    fingerprint: u64,
    points: BTreeMap<u64, SocketAddr>,
}

impl Ring {
    fn build(candidates: &[SocketAddr], fingerprint: u64) -> Self {
        let mut points = BTreeMap::new();
        for addr in candidates {
            // Colliding points: the later address wins.
            points.insert(hash_addr(addr), *addr);
        }
        Self {
            fingerprint,
            points,
        }
    }

    /// First point at or after `key`, wrapping to the smallest point.
    fn route(&self, key: u64) -> Option<SocketAddr> {
        self.points
            .range(key..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, addr)| *addr)
    }
}

fn hash_addr(addr: &SocketAddr) -> u64 {
    XxHash64::oneshot(SEED, addr.to_string().as_bytes())
}

/// Order-independent identity of a candidate set.
fn fingerprint(candidates: &[SocketAddr]) -> u64 {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = XxHash64::with_seed(SEED);
    for addr in sorted {
        hasher.write(addr.to_string().as_bytes());
        hasher.write_u8(0);
    }
    hasher.finish()
}

/// Routes a key to the first address clockwise from it on a hash ring.
///
/// Each service gets its own ring, built on first use. The ring is rebuilt
/// whenever the candidate set differs from the one it was built from, so
/// added addresses start receiving traffic and removed ones stop immediately.
#[derive(Debug, Default)]
pub struct ConsistentHashLoadBalancer {
    rings: RwLock<HashMap<String, Arc<Ring>>>,
}

impl ConsistentHashLoadBalancer {
    /// Registered name.
    pub const NAME: &'static str = "consistent-hash";

    /// Create a balancer with no rings yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ring(&self, service: &str, candidates: &[SocketAddr]) -> Arc<Ring> {
        let fingerprint = fingerprint(candidates);

        let current = |ring: &&Arc<Ring>| ring.fingerprint == fingerprint;

        if let Some(ring) = self.rings.read().get(service).filter(current) {
            return Arc::clone(ring);
        }

        let mut rings = self.rings.write();
        if let Some(ring) = rings.get(service).filter(current) {
            return Arc::clone(ring);
        }

        let ring = Arc::new(Ring::build(candidates, fingerprint));
        debug!(service, points = ring.points.len(), "built hash ring");
        rings.insert(service.to_string(), Arc::clone(&ring));
        ring
    }
}

impl LoadBalancer for ConsistentHashLoadBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pick(&self, service: &str, candidates: &[SocketAddr], routing_key: &[u8]) -> Option<SocketAddr> {
        if candidates.is_empty() {
            return None;
        }
        let key = XxHash64::oneshot(SEED, routing_key);
        self.ring(service, candidates).route(key)
    }
}
