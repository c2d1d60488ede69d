//! Health checks driving a pooled backend

use std::time::Duration;

use assert_matches::assert_matches;
use vitalstack::metrics::labels;
use vitalstack::{
    HealthCheckHandle, HealthCheckOptions, HealthError, HealthEvent, MetricDefinition,
    MetricsCollector, Pool, ProbePolicy,
};

use crate::helpers::*;

fn options() -> HealthCheckOptions {
    HealthCheckOptions {
        interval: Duration::from_secs(3600),
        policy: ProbePolicy {
            timeout: Duration::from_millis(500),
            retry_count: 0,
            retry_delay: Duration::from_millis(1),
        },
    }
}

#[tokio::test]
async fn test_pool_probe_reports_exhaustion() {
    let pool = Pool::initialize(MockManager::new(), pool_options(1, 1))
        .await
        .unwrap();

    let probe_pool = pool.clone();
    let health = HealthCheckHandle::start("pool", options(), move || {
        let pool = probe_pool.clone();
        async move {
            let conn = pool.acquire().await?;
            pool.release(conn);
            anyhow::Ok(())
        }
    });
    let mut events = health.subscribe();

    assert!(health.check_now().await.is_ok());

    let held = pool.acquire().await.unwrap();
    assert_matches!(health.check_now().await, Err(HealthError::Probe(msg)) if msg.contains("timed out"));

    let status = health.status().await.unwrap();
    assert!(!status.is_healthy);
    assert!(status.failure_count >= 1);
    assert!(status.success_rate < 100.0);

    // events arrive in cycle order; skip until the unhealthy one
    loop {
        match events.recv().await.unwrap() {
            HealthEvent::Unhealthy { name, .. } => {
                assert_eq!(name, "pool");
                break;
            }
            HealthEvent::Healthy { .. } => continue,
        }
    }

    drop(held);
    assert!(health.check_now().await.is_ok());
    assert!(health.status().await.unwrap().is_healthy);

    health.shutdown().await;
}

#[tokio::test]
async fn test_response_times_feed_a_histogram() {
    let metrics = MetricsCollector::default();
    metrics
        .register_metric(MetricDefinition::histogram("probe.seconds").with_labels(["check"]))
        .unwrap();

    let health = HealthCheckHandle::start("noop", options(), || async { anyhow::Ok(()) });
    let check = labels([("check", "noop")]);

    for _ in 0..3 {
        let elapsed = health.check_now().await.unwrap();
        metrics
            .observe("probe.seconds", elapsed.as_secs_f64(), &check)
            .unwrap();
    }

    let buckets = metrics.get_histogram_data("probe.seconds", &check).unwrap();
    let inf = buckets.last().unwrap();
    assert!(inf.le.is_infinite());
    assert_eq!(inf.count, 3);
    assert!(buckets.windows(2).all(|w| w[0].count <= w[1].count));
}
