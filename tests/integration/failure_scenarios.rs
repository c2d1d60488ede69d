//! Failure handling across the components
//!
//! - Warm-up failures are fatal
//! - Reconnect failures shrink the pool and publish a system error
//! - Broken notification channels never block the others
//! - Invalid metric usage fails synchronously

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use vitalstack::alerts::{ChannelKind, NotificationChannel, Operator};
use vitalstack::metrics::labels;
use vitalstack::{
    AlertHandle, AlertOptions, EventBus, EventFilter, EventPayload, Labels, MetricDefinition,
    MetricKind, MetricsCollector, MetricsError, MetricsOptions, NotifierRegistry, Pool, PoolError,
    Topic,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_warm_up_failure_is_fatal() {
    let manager = MockManager::new();
    manager.backend.refuse(true);

    let result = Pool::initialize(manager.clone(), pool_options(3, 5)).await;
    assert_matches!(result, Err(PoolError::Connect(_)));
    assert_eq!(manager.backend.opened(), 0);
}

#[tokio::test]
async fn test_failed_reconnect_shrinks_pool_until_next_pass() {
    let manager = MockManager::new();
    let bus = EventBus::default();
    let mut errors = bus.subscribe(EventFilter::topic(Topic::SystemError));
    let pool = Pool::builder(manager.clone(), pool_options(2, 2))
        .events(bus.clone())
        .build()
        .await
        .unwrap();

    manager.backend.break_connection(1);
    manager.backend.refuse(true);
    pool.maintain_now().await;

    let EventPayload::SystemError { service, details, .. } = next_payload(&mut errors).await
    else {
        panic!("expected a system error");
    };
    assert_eq!(service, "connection-pool");
    assert!(details.contains("liveness probe"));
    assert_eq!(pool.size().await, 1);

    // the backend is back; the next pass tops the pool up again
    manager.backend.refuse(false);
    pool.maintain_now().await;
    for _ in 0..100 {
        if pool.size().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.size().await, 2);
}

#[tokio::test]
async fn test_connect_failure_rejects_only_that_waiter() {
    let manager = MockManager::new();
    let pool = Pool::initialize(manager.clone(), pool_options(1, 2))
        .await
        .unwrap();
    let _held = pool.acquire().await.unwrap();

    manager.backend.refuse(true);
    assert_matches!(pool.acquire().await, Err(PoolError::Connect(_)));
    assert_eq!(pool.waiting_requests().await, 0);

    manager.backend.refuse(false);
    assert!(pool.acquire().await.is_ok());
}

#[tokio::test]
async fn test_broken_channel_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let metrics = MetricsCollector::new(MetricsOptions::default());
    metrics
        .register_metric(MetricDefinition::gauge("errors.rate"))
        .unwrap();

    let recorder = RecordingNotifier::default();
    let registry = NotifierRegistry::with_defaults().register(ChannelKind::Email, recorder.clone());
    let alerts = AlertHandle::spawn(
        metrics.clone(),
        EventBus::default(),
        registry,
        AlertOptions::default(),
    );

    alerts
        .add_channel(NotificationChannel::new(
            "hook",
            ChannelKind::Webhook,
            serde_json::json!({ "url": format!("{}/alerts", server.uri()) }),
        ))
        .await
        .unwrap();
    alerts
        .add_channel(NotificationChannel::new(
            "mail",
            ChannelKind::Email,
            serde_json::json!({ "to": "ops@example.com" }),
        ))
        .await
        .unwrap();
    alerts
        .add_rule(
            threshold_rule("errors", "errors.rate", Operator::Ge, 1.0)
                .with_channels(["hook", "missing", "mail"]),
        )
        .await
        .unwrap();

    metrics.gauge("errors.rate", 3.0, &Labels::new()).unwrap();
    alerts.sweep_now().await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert_eq!(alerts.active_alerts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rule_on_unknown_metric_is_ignored() {
    let alerts = AlertHandle::spawn(
        MetricsCollector::default(),
        EventBus::default(),
        NotifierRegistry::new(),
        AlertOptions::default(),
    );
    alerts
        .add_rule(threshold_rule("ghost", "does.not.exist", Operator::Gt, 0.0))
        .await
        .unwrap();

    alerts.sweep_now().await.unwrap();
    assert!(alerts.active_alerts().await.unwrap().is_empty());
    assert!(alerts.is_running());
}

#[test]
fn test_invalid_metric_usage_fails_fast() {
    let metrics = MetricsCollector::default();
    metrics
        .register_metric(MetricDefinition::counter("requests").with_labels(["route"]))
        .unwrap();

    assert_eq!(
        metrics.register_metric(MetricDefinition::gauge("requests")),
        Err(MetricsError::AlreadyRegistered("requests".into()))
    );
    assert_matches!(
        metrics.gauge("requests", 1.0, &Labels::new()),
        Err(MetricsError::KindMismatch {
            expected: MetricKind::Gauge,
            actual: MetricKind::Counter,
            ..
        })
    );
    assert_matches!(
        metrics.increment("requests", 1.0, &labels([("method", "GET")])),
        Err(MetricsError::UnknownLabel { .. })
    );
    assert_matches!(
        metrics.increment("requests", -1.0, &Labels::new()),
        Err(MetricsError::InvalidValue { .. })
    );
    assert_matches!(
        metrics.observe("nope", 1.0, &Labels::new()),
        Err(MetricsError::UnknownMetric(_))
    );
}
