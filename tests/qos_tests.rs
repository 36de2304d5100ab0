use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bifrost::qos::{
    AdaptiveTimeout, BreakerConfig, CircuitBreaker, CircuitState, QueueConfig, QueuedRequest,
    RequestQueue, TimeoutConfig,
};
use bifrost::DnsError;

#[test]
fn test_srtt_estimation_with_defaults() {
    let timeout = AdaptiveTimeout::new(TimeoutConfig::default());

    timeout.record_success(Duration::from_millis(100));
    timeout.record_success(Duration::from_millis(120));

    let computed = timeout.timeout();
    assert!(computed >= Duration::from_millis(500));
    assert!(computed <= Duration::from_secs(30));

    // srtt = 100 * 0.875 + 120 * 0.125 = 102.5ms
    let (srtt, ..) = timeout.stats();
    let srtt_ms = srtt.as_secs_f64() * 1000.0;
    assert!((srtt_ms - 102.5).abs() < 0.5, "srtt was {}ms", srtt_ms);
}

#[test]
fn test_timeout_always_within_bounds() {
    let config = TimeoutConfig {
        base_timeout: Duration::from_secs(2),
        min_timeout: Duration::from_millis(500),
        max_timeout: Duration::from_secs(30),
        congestion_mult: 4.0,
    };
    let timeout = AdaptiveTimeout::new(config);

    for i in 0..200 {
        if i % 3 == 0 {
            timeout.record_timeout();
        } else {
            timeout.record_success(Duration::from_millis(i as u64 % 50));
        }
        let t = timeout.timeout();
        assert!(t >= config.min_timeout && t <= config.max_timeout);
    }
}

#[test]
fn test_breaker_opens_and_probes_after_cooldown() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        max_failures: 3,
        reset_timeout: Duration::from_millis(100),
        half_open_attempts: 3,
    });

    for _ in 0..3 {
        breaker.after_execute(true);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Still rejecting before the cooldown has elapsed.
    assert!(breaker.before_execute());

    std::thread::sleep(Duration::from_millis(110));
    assert!(!breaker.before_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[test]
fn test_breaker_half_open_recovery() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        max_failures: 1,
        reset_timeout: Duration::from_millis(20),
        half_open_attempts: 2,
    });

    breaker.after_execute(true);
    std::thread::sleep(Duration::from_millis(30));
    assert!(!breaker.before_execute());

    breaker.after_execute(false);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.after_execute(false);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
}

#[test]
fn test_breaker_callback_edges_only() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        max_failures: 2,
        reset_timeout: Duration::from_secs(60),
        half_open_attempts: 1,
    });

    let edges = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&edges);
    breaker.set_state_change_callback(move |old, new| {
        sink.lock().unwrap().push((old, new));
    });

    breaker.after_execute(false); // no edge
    breaker.after_execute(true); // no edge
    breaker.after_execute(true); // closed -> open
    breaker.after_execute(true); // already open, no edge

    let recorded = edges.lock().unwrap().clone();
    assert_eq!(recorded, vec![(CircuitState::Closed, CircuitState::Open)]);
}

#[test]
fn test_queue_all_items_expire() {
    let queue = RequestQueue::new(QueueConfig {
        max_size: 4,
        max_wait_time: Duration::from_millis(10),
    });

    for priority in [5, 1, 9, 3] {
        queue
            .enqueue(QueuedRequest::new(priority, || async { Ok(()) }))
            .unwrap();
    }
    assert_eq!(queue.len(), 4);

    std::thread::sleep(Duration::from_millis(15));
    assert!(queue.dequeue().is_none());
    assert_eq!(queue.len(), 0);
}

#[test]
fn test_queue_dequeues_in_priority_order() {
    let queue = RequestQueue::new(QueueConfig {
        max_size: 4,
        max_wait_time: Duration::from_secs(10),
    });

    for priority in [5, 1, 9, 3] {
        queue
            .enqueue(QueuedRequest::new(priority, || async { Ok(()) }))
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(1));
    let order: Vec<i32> = std::iter::from_fn(|| queue.dequeue().map(|r| r.priority)).collect();
    assert_eq!(order, vec![1, 3, 5, 9]);
}

#[test]
fn test_queue_never_exceeds_capacity() {
    let queue = RequestQueue::new(QueueConfig {
        max_size: 8,
        max_wait_time: Duration::from_secs(10),
    });

    let mut rejected = 0;
    for priority in 0..32 {
        if queue
            .enqueue(QueuedRequest::new(priority, || async { Ok(()) }))
            .is_err()
        {
            rejected += 1;
        }
        assert!(queue.len() <= queue.capacity());
    }
    assert_eq!(rejected, 24);
    assert_eq!(queue.dropped_count(), 24);
}

#[tokio::test]
async fn test_queue_process_counters() {
    let queue = RequestQueue::new(QueueConfig {
        max_size: 8,
        max_wait_time: Duration::from_secs(10),
    });
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = Arc::clone(&executed);
        queue
            .enqueue(QueuedRequest::new(0, move || async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))
            .unwrap();
    }
    let counter = Arc::clone(&executed);
    queue
        .enqueue(QueuedRequest::new(0, move || async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Err(DnsError::ExchangeFailed("scripted".into()))
        }))
        .unwrap();

    let mut errors = 0;
    for _ in 0..4 {
        if queue.process().await.is_err() {
            errors += 1;
        }
    }

    assert_eq!(executed.load(Ordering::Relaxed), 4);
    assert_eq!(errors, 1);
    assert_eq!(queue.processed_count(), 3);
    assert_eq!(queue.dropped_count(), 1);
}

#[test]
fn test_reset_restores_initial_equivalent_state() {
    let timeout = AdaptiveTimeout::new(TimeoutConfig::default());
    timeout.record_success(Duration::from_millis(10));
    timeout.record_timeout();
    timeout.reset();
    let fresh = AdaptiveTimeout::new(TimeoutConfig::default());
    assert_eq!(timeout.timeout(), fresh.timeout());
    assert_eq!(timeout.stats().2, 0);

    let breaker = CircuitBreaker::new(BreakerConfig::default());
    for _ in 0..20 {
        breaker.after_execute(true);
    }
    breaker.reset();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
    assert!(!breaker.before_execute());
}
