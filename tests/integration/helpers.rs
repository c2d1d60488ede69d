//! Test helpers shared by the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use vitalstack::alerts::{
    Alert, AlertRule, ChannelKind, Condition, NotificationChannel, Operator,
};
use vitalstack::events::Subscription;
use vitalstack::{ConnectionManager, EventPayload, Notifier, PoolOptions};

/// Observable state behind a [`MockManager`]
#[derive(Default)]
pub struct MockBackend {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub probes: AtomicUsize,
    pub refuse_connections: AtomicBool,
    /// Connections whose liveness probe fails
    pub broken: Mutex<HashSet<usize>>,
}

impl MockBackend {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn break_connection(&self, id: usize) {
        self.broken.lock().insert(id);
    }
}

/// In-memory connection manager; connections are sequential ids
#[derive(Clone, Default)]
pub struct MockManager {
    pub backend: Arc<MockBackend>,
}

impl MockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionManager for MockManager {
    type Connection = usize;

    async fn connect(&self) -> anyhow::Result<usize> {
        if self.backend.refuse_connections.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(self.backend.opened.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_valid(&self, conn: &usize) -> anyhow::Result<()> {
        self.backend.probes.fetch_add(1, Ordering::SeqCst);
        if self.backend.broken.lock().contains(conn) {
            anyhow::bail!("connection {conn} is broken");
        }
        Ok(())
    }

    async fn close(&self, _conn: usize) {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn database(&self) -> &str {
        "test"
    }
}

pub fn pool_options(min_size: usize, max_size: usize) -> PoolOptions {
    let mut options = PoolOptions {
        min_size,
        max_size,
        acquire_timeout: Duration::from_millis(100),
        ..PoolOptions::default()
    };
    options.probe.retry_count = 0;
    options.probe.retry_delay = Duration::from_millis(1);
    options
}

/// Notifier that remembers every delivery
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<(String, Alert)>>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        channel: &NotificationChannel,
        _rule: &AlertRule,
        alert: &Alert,
    ) -> anyhow::Result<()> {
        self.sent.lock().push((channel.id.clone(), alert.clone()));
        Ok(())
    }
}

pub fn webhook_channel(id: &str) -> NotificationChannel {
    NotificationChannel::new(id, ChannelKind::Webhook, serde_json::json!({}))
}

pub fn threshold_rule(id: &str, metric: &str, operator: Operator, threshold: f64) -> AlertRule {
    AlertRule::new(
        id,
        metric,
        Condition::Threshold {
            operator,
            threshold,
        },
    )
}

/// Next payload on `subscription`, failing the test after two seconds
pub async fn next_payload(subscription: &mut Subscription) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
        .payload
}
