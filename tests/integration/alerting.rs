//! End-to-end alerting: metrics → event bus → alert manager → notifiers

use std::time::Duration;

use pretty_assertions::assert_eq;
use vitalstack::alerts::{AlertStatus, ChannelKind, Condition, HistoryFilter, Operator, Severity};
use vitalstack::metrics::labels;
use vitalstack::{
    AlertHandle, AlertOptions, EventBus, EventFilter, EventPayload, Labels, MetricDefinition,
    MetricsCollector, MetricsOptions, NotifierRegistry, Topic,
};

use crate::helpers::*;

struct Pipeline {
    metrics: MetricsCollector,
    bus: EventBus,
    alerts: AlertHandle,
    notifier: RecordingNotifier,
}

async fn pipeline() -> Pipeline {
    let bus = EventBus::default();
    let metrics = MetricsCollector::new(MetricsOptions::default()).with_events(bus.clone());
    let notifier = RecordingNotifier::default();
    let alerts = AlertHandle::spawn(
        metrics.clone(),
        bus.clone(),
        NotifierRegistry::new().register(ChannelKind::Webhook, notifier.clone()),
        AlertOptions::default(),
    );
    alerts.add_channel(webhook_channel("ops")).await.unwrap();

    Pipeline {
        metrics,
        bus,
        alerts,
        notifier,
    }
}

#[tokio::test]
async fn test_cpu_alert_lifecycle_with_cooldown() {
    let p = pipeline().await;
    p.metrics
        .register_metric(MetricDefinition::gauge("cpu.usage"))
        .unwrap();
    p.alerts
        .add_rule(
            threshold_rule("cpu-high", "cpu.usage", Operator::Gt, 80.0)
                .with_cooldown(Duration::from_secs(300))
                .with_channels(["ops"]),
        )
        .await
        .unwrap();

    let mut triggered = p.bus.subscribe(EventFilter::topic(Topic::AlertTriggered));
    let mut resolved = p.bus.subscribe(EventFilter::topic(Topic::AlertResolved));
    let none = Labels::new();

    // 85: one active alert, one notification
    p.metrics.gauge("cpu.usage", 85.0, &none).unwrap();
    let EventPayload::AlertTriggered { alert, rule_name } = next_payload(&mut triggered).await
    else {
        panic!("expected a triggered alert");
    };
    assert_eq!(rule_name, "cpu-high");
    assert_eq!(alert.value, Some(85.0));
    assert_eq!(alert.threshold, Some(80.0));
    assert_eq!(p.alerts.active_alerts().await.unwrap().len(), 1);
    assert_eq!(p.notifier.count(), 1);

    // 50: resolved, nothing sent
    p.metrics.gauge("cpu.usage", 50.0, &none).unwrap();
    next_payload(&mut resolved).await;
    assert!(p.alerts.active_alerts().await.unwrap().is_empty());
    assert_eq!(p.notifier.count(), 1);

    // 90 within the cooldown: active again, still one notification
    p.metrics.gauge("cpu.usage", 90.0, &none).unwrap();
    next_payload(&mut triggered).await;
    assert_eq!(p.alerts.active_alerts().await.unwrap().len(), 1);
    assert_eq!(p.notifier.count(), 1);

    let history = p.alerts.alert_history(HistoryFilter::rule("cpu-high")).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, AlertStatus::Active);
    assert_eq!(history[1].status, AlertStatus::Resolved);
}

#[tokio::test]
async fn test_change_rule_reacts_to_events() {
    let p = pipeline().await;
    p.metrics
        .register_metric(MetricDefinition::gauge("queue.depth").with_labels(["queue"]))
        .unwrap();
    p.alerts
        .add_rule(
            vitalstack::alerts::AlertRule::new(
                "queue-jump",
                "queue.depth",
                Condition::Change {
                    change_percent: 100.0,
                },
            )
            .with_channels(["ops"]),
        )
        .await
        .unwrap();

    let mut triggered = p.bus.subscribe(EventFilter::topic(Topic::AlertTriggered));
    let queue = labels([("queue", "ingest")]);

    p.metrics.gauge("queue.depth", 10.0, &queue).unwrap();
    p.metrics.gauge("queue.depth", 25.0, &queue).unwrap();

    let EventPayload::AlertTriggered { alert, .. } = next_payload(&mut triggered).await else {
        panic!("expected a triggered alert");
    };
    assert_eq!(alert.labels, queue);
    assert_eq!(alert.value, Some(25.0));
}

#[tokio::test]
async fn test_history_filters_and_order() {
    let p = pipeline().await;
    p.metrics
        .register_metric(MetricDefinition::gauge("disk.free").with_labels(["host"]))
        .unwrap();
    p.alerts
        .add_rule(
            threshold_rule("disk-low", "disk.free", Operator::Lt, 10.0)
                .with_severity(Severity::Critical),
        )
        .await
        .unwrap();

    for host in ["a", "b"] {
        p.metrics
            .gauge("disk.free", 5.0, &labels([("host", host)]))
            .unwrap();
        p.alerts.sweep_now().await.unwrap();
    }

    let all = p.alerts.alert_history(HistoryFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].created_at >= all[1].created_at);

    let critical = p
        .alerts
        .alert_history(HistoryFilter::default().with_severity(Severity::Critical))
        .await
        .unwrap();
    assert_eq!(critical.len(), 2);

    let warnings = p
        .alerts
        .alert_history(HistoryFilter::default().with_severity(Severity::Warning))
        .await
        .unwrap();
    assert!(warnings.is_empty());
}

#[tokio::test]
async fn test_absence_rule_fires_and_resolves_on_sweep() {
    let p = pipeline().await;
    p.alerts
        .add_rule(vitalstack::alerts::AlertRule::new(
            "heartbeat",
            "app.heartbeat",
            Condition::Absence { duration_ms: 60_000 },
        ))
        .await
        .unwrap();

    p.alerts.sweep_now().await.unwrap();
    assert_eq!(p.alerts.active_alerts().await.unwrap().len(), 1);

    p.metrics
        .register_metric(MetricDefinition::counter("app.heartbeat"))
        .unwrap();
    p.metrics
        .increment("app.heartbeat", 1.0, &Labels::new())
        .unwrap();
    p.alerts.sweep_now().await.unwrap();

    assert!(p.alerts.active_alerts().await.unwrap().is_empty());
    let status = p.alerts.rule_status("heartbeat").await.unwrap();
    assert_eq!(status.active_alert_count, 0);
    assert!(status.last_triggered.is_some());
}
