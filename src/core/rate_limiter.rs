//! Per-service request pacing shared by all workers.
//!
//! Each limited service has a gate that admits one caller per `1/rate`
//! seconds. Callers are never rejected, only delayed. Waiters queue on a
//! fair async mutex, so admission is FIFO.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Spacing between calls for `rate` requests per second, if it has one
pub fn rate_interval(rate: f64) -> Option<Duration> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / rate).ok()
}

struct Gate {
    interval: Duration,
    /// Earliest instant the next caller may proceed
    next_slot: Mutex<Option<Instant>>,
}

/// Rate limiter keyed by service name
pub struct RateLimiter {
    gates: HashMap<String, Gate>,
}

impl RateLimiter {
    /// Build from `service -> requests per second`. Rates with no
    /// representable interval (non-positive, or too small) are ignored.
    pub fn new(limits: &HashMap<String, f64>) -> Self {
        let gates = limits
            .iter()
            .filter_map(|(service, rate)| {
                let gate = Gate {
                    interval: rate_interval(*rate)?,
                    next_slot: Mutex::new(None),
                };
                Some((service.clone(), gate))
            })
            .collect();

        Self { gates }
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self {
            gates: HashMap::new(),
        }
    }

    /// Minimum spacing between calls to `service`, if limited
    pub fn interval(&self, service: &str) -> Option<Duration> {
        self.gates.get(service).map(|gate| gate.interval)
    }

    /// Wait until `service` may be called. Unlimited services return immediately.
    pub async fn acquire(&self, service: &str) {
        let Some(gate) = self.gates.get(service) else {
            return;
        };

        // Holding the lock while sleeping keeps later callers queued behind us
        let mut next_slot = gate.next_slot.lock().await;
        let now = Instant::now();

        let slot = match *next_slot {
            Some(at) if at > now => {
                debug!(
                    service,
                    wait_ms = (at - now).as_millis() as u64,
                    "Rate limit: waiting for slot"
                );
                sleep_until(at).await;
                at
            }
            _ => now,
        };

        *next_slot = Some(slot + gate.interval);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let intervals: HashMap<&str, Duration> = self
            .gates
            .iter()
            .map(|(service, gate)| (service.as_str(), gate.interval))
            .collect();
        f.debug_struct("RateLimiter").field("intervals", &intervals).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(service, rate)| (service.to_string(), *rate))
            .collect()
    }

    #[test]
    fn test_interval_from_rate() {
        let limiter = RateLimiter::new(&limits(&[("pubmed", 4.0), ("broken", 0.0)]));

        assert_eq!(limiter.interval("pubmed"), Some(Duration::from_millis(250)));
        assert_eq!(limiter.interval("broken"), None);
        assert_eq!(limiter.interval("unknown"), None);
    }

    #[test]
    fn test_unrepresentable_rate_is_ignored() {
        let limiter = RateLimiter::new(&limits(&[("archive", 1e-300), ("nan", f64::NAN)]));

        assert_eq!(limiter.interval("archive"), None);
        assert_eq!(limiter.interval("nan"), None);
        assert_eq!(rate_interval(1e-300), None);
        assert_eq!(rate_interval(0.5), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_unlimited_service_does_not_wait() {
        let limiter = RateLimiter::new(&limits(&[("pubmed", 1.0)]));
        let start = std::time::Instant::now();

        for _ in 0..5 {
            limiter.acquire("summarizer").await;
        }

        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sequential_calls_are_spaced() {
        let limiter = RateLimiter::new(&limits(&[("pubmed", 20.0)]));
        let start = std::time::Instant::now();

        // First call is free, the next two wait 50ms each
        for _ in 0..3 {
            limiter.acquire("pubmed").await;
        }

        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
