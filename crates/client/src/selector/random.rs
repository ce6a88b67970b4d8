use super::LoadBalancer;

use rand::Rng;
use std::net::SocketAddr;

/// Uniformly random selection, drawn fresh for every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomLoadBalancer;

impl RandomLoadBalancer {
    /// Registered name.
    pub const NAME: &'static str = "random";
}

impl LoadBalancer for RandomLoadBalancer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pick(&self, _service: &str, candidates: &[SocketAddr], _routing_key: &[u8]) -> Option<SocketAddr> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index).copied()
    }
}
