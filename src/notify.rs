//! Notification delivery
//!
//! Every channel type is served by one [`Notifier`]. The registry ships with
//! the webhook and chat notifiers; email and SMS are registered by the
//! embedding application. A channel whose type has no notifier counts as a
//! failed delivery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::{Alert, AlertRule, ChannelKind, NotificationChannel};
use crate::discord::ChatNotifier;

/// Delivers one alert through one channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        channel: &NotificationChannel,
        rule: &AlertRule,
        alert: &Alert,
    ) -> anyhow::Result<()>;
}

/// Read the mandatory `url` entry of a channel config
pub(crate) fn channel_url(channel: &NotificationChannel) -> anyhow::Result<&str> {
    channel
        .config
        .get("url")
        .and_then(|url| url.as_str())
        .ok_or_else(|| anyhow!("channel `{}` has no `url` configured", channel.id))
}

/// Posts the alert as JSON
#[derive(Debug, Clone, Default)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(channel = %channel.id))]
    async fn send(
        &self,
        channel: &NotificationChannel,
        rule: &AlertRule,
        alert: &Alert,
    ) -> anyhow::Result<()> {
        let url = channel_url(channel)?;
        let payload = json!({
            "message": alert.message,
            "rule": { "id": rule.id, "name": rule.name },
            "alert": alert,
            "timestamp": Utc::now().to_rfc3339()
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to send webhook alert")?;

        if !response.status().is_success() {
            bail!("webhook alert failed with status: {}", response.status());
        }

        debug!("successfully sent webhook alert");
        Ok(())
    }
}

/// Notifiers keyed by channel type
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<ChannelKind, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    /// Empty registry; every delivery fails until notifiers are registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Webhook and chat notifiers sharing one HTTP client
    pub fn with_defaults() -> Self {
        let client = Client::new();
        Self::new()
            .register(ChannelKind::Webhook, WebhookNotifier::new(client.clone()))
            .register(ChannelKind::Chat, ChatNotifier::new(client))
    }

    pub fn register(mut self, kind: ChannelKind, notifier: impl Notifier + 'static) -> Self {
        self.notifiers.insert(kind, Arc::new(notifier));
        self
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(&kind).cloned()
    }
}

/// Outcome of notifying all channels of one rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Unknown or disabled channels
    pub skipped: usize,
}

/// Notify every channel `rule` references
///
/// Failures are logged per channel and never abort the remaining channels.
pub async fn dispatch(
    registry: &NotifierRegistry,
    channels: &BTreeMap<String, NotificationChannel>,
    rule: &AlertRule,
    alert: &Alert,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for channel_id in &rule.channels {
        let Some(channel) = channels.get(channel_id) else {
            warn!("rule `{}` references unknown channel `{channel_id}`", rule.id);
            report.skipped += 1;
            continue;
        };

        if !channel.enabled {
            debug!("channel `{channel_id}` is disabled, skipping");
            report.skipped += 1;
            continue;
        }

        let Some(notifier) = registry.get(channel.kind) else {
            error!(
                "no notifier registered for {} channel `{channel_id}`",
                channel.kind
            );
            report.failed += 1;
            continue;
        };

        match notifier.send(channel, rule, alert).await {
            Ok(()) => {
                info!("sent alert for rule `{}` to `{}`", rule.id, channel.name);
                report.delivered += 1;
            }
            Err(err) => {
                error!("failed to notify `{}`: {err:#}", channel.name);
                report.failed += 1;
            }
        }
    }

    report
}
