//! Rate Limiter Integration Tests
//!
//! Concurrent callers sharing one per-service budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use medibrief::config::Config;
use medibrief::core::RateLimiter;

fn limiter(service: &str, rate: f64) -> Arc<RateLimiter> {
    let mut limits = HashMap::new();
    limits.insert(service.to_string(), rate);
    Arc::new(RateLimiter::new(&limits))
}

#[tokio::test]
async fn test_concurrent_callers_are_spaced() {
    // 20/s: one admission every 50ms
    let limiter = limiter("pubmed", 20.0);
    let start = Instant::now();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire("pubmed").await;
                Instant::now()
            })
        })
        .collect();

    let mut admitted = Vec::new();
    for handle in handles {
        admitted.push(handle.await.unwrap());
    }
    admitted.sort();

    // First call is immediate, the other three wait one interval each
    assert!(admitted[3].duration_since(start) >= Duration::from_millis(145));
    for pair in admitted.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(45));
    }
}

#[tokio::test]
async fn test_waiters_are_admitted_in_arrival_order() {
    let limiter = limiter("renderer", 20.0);
    let order = Arc::new(Mutex::new(Vec::new()));

    limiter.acquire("renderer").await;

    let mut handles = Vec::new();
    for i in 0..3 {
        let limiter = limiter.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire("renderer").await;
            order.lock().unwrap().push(i);
        }));
        // Let each waiter queue before the next arrives
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_services_do_not_share_budgets() {
    let limiter = limiter("pubmed", 1.0);

    limiter.acquire("pubmed").await;
    let start = Instant::now();
    limiter.acquire("summarizer").await;
    limiter.acquire("summarizer").await;

    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_limits_from_config() {
    let config = Config::from_yaml_str(
        r#"
rate_limits:
  pubmed: 3.0
  publisher: 0.5
"#,
    )
    .unwrap();
    let limiter = RateLimiter::new(&config.rate_limits.0);

    assert_eq!(limiter.interval("publisher"), Some(Duration::from_secs(2)));
    assert!(limiter.interval("pubmed").unwrap() < Duration::from_millis(334));
    assert_eq!(limiter.interval("narrator"), None);
}
