use super::{Call, Decision, Filter, FilterFault};

use srpc_rate_limiter::RateLimiter;
use tracing::info;

/// Admits requests at a fixed rate and denies the excess.
///
/// Backed by a token bucket, so short bursts up to one second's worth of
/// permits pass at once.
#[derive(Debug)]
pub struct TrafficControlFilter {
    limiter: RateLimiter,
}

impl TrafficControlFilter {
    /// Name the filter reports.
    pub const NAME: &'static str = "traffic-control";

    /// Admit `permits_per_second` requests per second.
    ///
    /// # Errors
    ///
    /// Returns an error if the rate is not a positive finite number.
    pub fn new(permits_per_second: f64) -> srpc_rate_limiter::Result<Self> {
        Ok(Self {
            limiter: RateLimiter::new(permits_per_second)?,
        })
    }

    /// Current admission rate.
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    /// Change the admission rate. Permits banked under the old rate are
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the rate is not a positive finite number.
    pub fn set_rate(&self, permits_per_second: f64) -> srpc_rate_limiter::Result<()> {
        self.limiter.set_rate(permits_per_second)?;
        info!(permits_per_second, "traffic control rate changed");
        Ok(())
    }
}

impl Filter for TrafficControlFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn decide(&self, _call: &Call<'_>) -> Result<Decision, FilterFault> {
        if self.limiter.try_acquire() {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::Deny)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srpc_protocol::Request;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn decide(filter: &TrafficControlFilter) -> Decision {
        let request = Request::new("Echo", "say");
        let call = Call {
            peer: SocketAddr::from(([127, 0, 0, 1], 4000)),
            request_id: 0,
            request: &request,
        };
        filter.decide(&call).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_denies_beyond_rate() {
        let filter = TrafficControlFilter::new(2.0).unwrap();
        assert_eq!(decide(&filter), Decision::Allow);
        assert_eq!(decide(&filter), Decision::Allow);
        assert_eq!(decide(&filter), Decision::Deny);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(decide(&filter), Decision::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate() {
        let filter = TrafficControlFilter::new(1.0).unwrap();
        filter.set_rate(5.0).unwrap();
        assert!((filter.rate() - 5.0).abs() < f64::EPSILON);
        assert!(filter.set_rate(0.0).is_err());
        assert!(TrafficControlFilter::new(-1.0).is_err());
    }
}
