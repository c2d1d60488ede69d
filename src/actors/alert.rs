//! AlertActor - Evaluates alert rules and dispatches notifications
//!
//! The actor owns every rule, channel and alert. It evaluates rules whenever
//! the metrics collector publishes a sample, and optionally on a periodic
//! sweep that also catches absence rules (a metric that stopped reporting
//! never publishes anything).
//!
//! ## Alert lifecycle
//!
//! Alerts are tracked per `(rule, label set)`:
//!
//! ```text
//! not active + triggered      → fire new alert, notify unless in cooldown
//! active     + triggered      → nothing (no duplicates)
//! active     + not triggered  → resolve, no notification
//! not active + not triggered  → nothing
//! ```
//!
//! Silenced rules are skipped entirely.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::alerts::{
    Alert, AlertRule, AlertStatus, Condition, Evaluation, HistoryFilter, NotificationChannel,
    RuleStatus, evaluate,
};
use crate::error::{AlertError, MetricsError};
use crate::events::{
    EventBus, EventFilter, EventMeta, EventPayload, EventSource, Priority, Subscription, Topic,
};
use crate::metrics::{
    Labels, MetricSample, MetricValue, MetricsCollector, label_key, labels_match,
};
use crate::notify::{self, NotifierRegistry};

use super::messages::AlertCommand;

/// Values a sweep needs to evaluate any condition (change compares the last two)
const EVALUATION_WINDOW: usize = 2;

#[derive(Debug, Clone)]
pub struct AlertOptions {
    /// Period of the rule sweep once started
    pub sweep_interval: Duration,
    /// Alerts kept for history queries
    pub max_history: usize,
}

impl Default for AlertOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            max_history: 1000,
        }
    }
}

type AlertKey = (String, String);

fn alert_key(rule_id: &str, labels: &Labels) -> AlertKey {
    (rule_id.to_string(), label_key(labels))
}

/// Actor that evaluates rules and owns alert state
pub struct AlertActor {
    options: AlertOptions,

    rules: BTreeMap<String, AlertRule>,
    channels: BTreeMap<String, NotificationChannel>,

    /// Active alert per (rule id, label key)
    active: HashMap<AlertKey, Uuid>,

    /// Every tracked alert, oldest first
    history: VecDeque<Alert>,

    metrics: MetricsCollector,
    events: EventBus,
    notifiers: NotifierRegistry,

    command_rx: mpsc::Receiver<AlertCommand>,

    /// Metric samples published by the collector
    metric_rx: Subscription,

    sweep_ticker: Interval,
    sweeping: bool,
}

impl AlertActor {
    fn new(
        options: AlertOptions,
        metrics: MetricsCollector,
        events: EventBus,
        notifiers: NotifierRegistry,
        command_rx: mpsc::Receiver<AlertCommand>,
    ) -> Self {
        let metric_rx = events.subscribe(
            EventFilter::topic(Topic::MetricCollected).from_source(EventSource::Monitor),
        );

        let period = options.sweep_interval;
        let mut sweep_ticker = interval_at(Instant::now() + period, period);
        sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            options,
            rules: BTreeMap::new(),
            channels: BTreeMap::new(),
            active: HashMap::new(),
            history: VecDeque::new(),
            metrics,
            events,
            notifiers,
            command_rx,
            metric_rx,
            sweep_ticker,
            sweeping: false,
        }
    }

    #[instrument(skip(self))]
    async fn run(mut self) {
        debug!("starting alert actor");

        loop {
            tokio::select! {
                result = self.metric_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let EventPayload::MetricCollected(sample) = event.payload {
                                self.handle_sample(sample).await;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("alert actor lagged, skipped {skipped} metrics");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("event bus closed, shutting down");
                            break;
                        }
                    }
                }

                _ = self.sweep_ticker.tick(), if self.sweeping => {
                    self.sweep().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("alert actor stopped");
    }

    /// Returns `false` once the actor should stop
    async fn handle_command(&mut self, cmd: AlertCommand) -> bool {
        match cmd {
            AlertCommand::AddRule { rule, respond_to } => {
                let _ = respond_to.send(self.add_rule(rule));
            }

            AlertCommand::UpdateRule { rule, respond_to } => {
                let _ = respond_to.send(self.update_rule(rule));
            }

            AlertCommand::DeleteRule {
                rule_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.delete_rule(&rule_id));
            }

            AlertCommand::SetSilenced {
                rule_id,
                silenced,
                respond_to,
            } => {
                let result = match self.rules.get_mut(&rule_id) {
                    Some(rule) => {
                        debug!("rule `{rule_id}` silenced: {silenced}");
                        rule.silenced = silenced;
                        Ok(())
                    }
                    None => Err(AlertError::UnknownRule(rule_id)),
                };
                let _ = respond_to.send(result);
            }

            AlertCommand::AddChannel {
                channel,
                respond_to,
            } => {
                let result = if self.channels.contains_key(&channel.id) {
                    Err(AlertError::DuplicateChannel(channel.id))
                } else {
                    debug!("adding {} channel `{}`", channel.kind, channel.id);
                    self.channels.insert(channel.id.clone(), channel);
                    Ok(())
                };
                let _ = respond_to.send(result);
            }

            AlertCommand::RemoveChannel {
                channel_id,
                respond_to,
            } => {
                let result = match self.channels.remove(&channel_id) {
                    Some(_) => Ok(()),
                    None => Err(AlertError::UnknownChannel(channel_id)),
                };
                let _ = respond_to.send(result);
            }

            AlertCommand::SetChannelEnabled {
                channel_id,
                enabled,
                respond_to,
            } => {
                let result = match self.channels.get_mut(&channel_id) {
                    Some(channel) => {
                        channel.enabled = enabled;
                        Ok(())
                    }
                    None => Err(AlertError::UnknownChannel(channel_id)),
                };
                let _ = respond_to.send(result);
            }

            AlertCommand::GetRules { respond_to } => {
                let _ = respond_to.send(self.rules.values().cloned().collect());
            }

            AlertCommand::GetChannels { respond_to } => {
                let _ = respond_to.send(self.channels.values().cloned().collect());
            }

            AlertCommand::GetActiveAlerts { respond_to } => {
                let filter = HistoryFilter::default().with_status(AlertStatus::Active);
                let _ = respond_to.send(self.history(&filter));
            }

            AlertCommand::GetHistory { filter, respond_to } => {
                let _ = respond_to.send(self.history(&filter));
            }

            AlertCommand::GetRuleStatus {
                rule_id,
                respond_to,
            } => {
                let result = match self.rules.get(&rule_id) {
                    Some(rule) => Ok(RuleStatus {
                        rule: rule.clone(),
                        active_alert_count: self
                            .active
                            .keys()
                            .filter(|(id, _)| *id == rule_id)
                            .count(),
                        last_triggered: rule.last_triggered,
                        last_notified: rule.last_notified,
                    }),
                    None => Err(AlertError::UnknownRule(rule_id)),
                };
                let _ = respond_to.send(result);
            }

            AlertCommand::StartSweep => {
                debug!("starting rule sweep every {:?}", self.options.sweep_interval);
                self.sweeping = true;
                self.sweep_ticker.reset();
            }

            AlertCommand::StopSweep => {
                debug!("stopping rule sweep");
                self.sweeping = false;
            }

            AlertCommand::SweepNow { respond_to } => {
                self.sweep().await;
                let _ = respond_to.send(());
            }

            AlertCommand::Shutdown => {
                debug!("received shutdown command");
                return false;
            }
        }

        true
    }

    fn add_rule(&mut self, rule: AlertRule) -> Result<(), AlertError> {
        if self.rules.contains_key(&rule.id) {
            return Err(AlertError::DuplicateRule(rule.id));
        }
        debug!("adding rule `{}` on `{}`", rule.id, rule.metric);
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    fn update_rule(&mut self, mut rule: AlertRule) -> Result<(), AlertError> {
        let Some(existing) = self.rules.get_mut(&rule.id) else {
            return Err(AlertError::UnknownRule(rule.id));
        };
        rule.last_triggered = existing.last_triggered;
        rule.last_notified = existing.last_notified;
        debug!("updating rule `{}`", rule.id);
        *existing = rule;
        Ok(())
    }

    fn delete_rule(&mut self, rule_id: &str) -> Result<(), AlertError> {
        if self.rules.remove(rule_id).is_none() {
            return Err(AlertError::UnknownRule(rule_id.to_string()));
        }

        let keys: Vec<AlertKey> = self
            .active
            .keys()
            .filter(|(id, _)| id == rule_id)
            .cloned()
            .collect();
        let now = Utc::now();
        for key in keys {
            self.resolve(&key, now);
        }

        debug!("deleted rule `{rule_id}`");
        Ok(())
    }

    /// Matching history entries, newest first
    fn history(&self, filter: &HistoryFilter) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .history
            .iter()
            .rev()
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    /// Evaluate every rule watching the sample's series against the sample itself
    ///
    /// Later samples of the same series may already be stored, so the stored
    /// tail is never consulted. A change rule compares with the value recorded
    /// right before this sample.
    #[instrument(skip(self, sample), fields(metric = %sample.name))]
    async fn handle_sample(&mut self, sample: MetricSample) {
        let rules: Vec<AlertRule> = self
            .rules
            .values()
            .filter(|rule| {
                !rule.silenced && rule.metric == sample.name && labels_match(&sample.labels, &rule.labels)
            })
            .cloned()
            .collect();

        if rules.is_empty() {
            return;
        }

        let current = MetricValue {
            value: sample.value,
            timestamp: sample.timestamp,
            labels: sample.labels.clone(),
        };

        let previous = if rules
            .iter()
            .any(|rule| matches!(rule.condition, Condition::Change { .. }))
        {
            self.metrics
                .value_before(&sample.name, &sample.labels, sample.timestamp)
                .unwrap_or_else(|err| {
                    trace!("no previous value: {err}");
                    None
                })
        } else {
            None
        };

        let now = Utc::now();
        for rule in rules {
            let values: Vec<MetricValue> = match rule.condition {
                Condition::Change { .. } => {
                    previous.iter().cloned().chain([current.clone()]).collect()
                }
                _ => vec![current.clone()],
            };
            let evaluation = evaluate(&rule.condition, &values, sample.timestamp);

            if matches!(rule.condition, Condition::Absence { .. }) && rule.labels != sample.labels {
                // raised under the rule's filter while nothing reported
                self.resolve(&alert_key(&rule.id, &rule.labels), now);
            }

            self.apply(&rule.id, sample.labels.clone(), evaluation, now)
                .await;
        }
    }

    /// Evaluate every rule against every matching series
    #[instrument(skip(self))]
    async fn sweep(&mut self) {
        trace!("sweeping {} rules", self.rules.len());
        let now = Utc::now();

        let rules: Vec<AlertRule> = self
            .rules
            .values()
            .filter(|rule| !rule.silenced)
            .cloned()
            .collect();

        for rule in rules {
            let series = match self
                .metrics
                .matching_series(&rule.metric, &rule.labels, EVALUATION_WINDOW)
            {
                Ok(series) => series,
                Err(MetricsError::UnknownMetric(_)) => Vec::new(),
                Err(err) => {
                    warn!("cannot evaluate rule `{}`: {err}", rule.id);
                    continue;
                }
            };

            let mut evaluated = HashSet::new();

            if series.is_empty() && matches!(rule.condition, Condition::Absence { .. }) {
                // nothing reported: the alert is keyed by the rule's own filter
                let evaluation = evaluate(&rule.condition, &[], now);
                evaluated.insert(label_key(&rule.labels));
                self.apply(&rule.id, rule.labels.clone(), evaluation, now)
                    .await;
            }

            for (labels, values) in series {
                evaluated.insert(label_key(&labels));
                let evaluation = evaluate(&rule.condition, &values, now);
                self.apply(&rule.id, labels, evaluation, now).await;
            }

            // keys no longer backed by an evaluated series
            let stale: Vec<AlertKey> = self
                .active
                .keys()
                .filter(|(id, key)| *id == rule.id && !evaluated.contains(key))
                .cloned()
                .collect();
            for key in stale {
                self.resolve(&key, now);
            }
        }
    }

    /// Drive the alert of one (rule, labels) pair from an evaluation
    async fn apply(
        &mut self,
        rule_id: &str,
        labels: Labels,
        evaluation: Evaluation,
        now: DateTime<Utc>,
    ) {
        let key = alert_key(rule_id, &labels);

        if !evaluation.triggered {
            self.resolve(&key, now);
            return;
        }

        if self.active.contains_key(&key) {
            trace!("alert for `{rule_id}` {{{}}} already active", key.1);
            return;
        }

        let Some(rule) = self.rules.get_mut(rule_id) else {
            return;
        };

        let alert = Alert::fire(rule, labels, evaluation.value, now);
        rule.last_triggered = Some(now);
        let notify = rule.cooldown_elapsed(now);
        if notify {
            rule.last_notified = Some(now);
        }
        let rule = rule.clone();

        info!(
            "alert `{}` triggered ({}) with value {:?}",
            rule.name, rule.severity, evaluation.value
        );
        self.active.insert(key, alert.id);
        self.record(alert.clone());

        if notify {
            let report = notify::dispatch(&self.notifiers, &self.channels, &rule, &alert).await;
            debug!(
                "notified {} channels ({} failed, {} skipped)",
                report.delivered, report.failed, report.skipped
            );
        } else {
            debug!("rule `{}` is cooling down, notification suppressed", rule.id);
        }

        self.events.publish(
            EventPayload::AlertTriggered {
                alert,
                rule_name: rule.name,
            },
            EventMeta::new(EventSource::Monitor, Priority::High),
        );
    }

    fn resolve(&mut self, key: &AlertKey, now: DateTime<Utc>) {
        let Some(id) = self.active.remove(key) else {
            return;
        };
        let Some(alert) = self.history.iter_mut().find(|alert| alert.id == id) else {
            return;
        };

        alert.resolve(now);
        info!("alert for rule `{}` resolved", alert.rule_id);

        self.events.publish(
            EventPayload::AlertResolved {
                alert: alert.clone(),
            },
            EventMeta::new(EventSource::Monitor, Priority::Normal),
        );
    }

    fn record(&mut self, alert: Alert) {
        self.history.push_back(alert);

        while self.history.len() > self.options.max_history {
            let index = self
                .history
                .iter()
                .position(|alert| !alert.is_active())
                .unwrap_or(0);
            let Some(evicted) = self.history.remove(index) else {
                break;
            };
            if evicted.is_active() {
                self.active.retain(|_, id| *id != evicted.id);
            }
            trace!("evicted alert {} from history", evicted.id);
        }
    }
}

/// Handle for controlling the AlertActor
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    /// Spawn a new alert actor
    ///
    /// The actor subscribes to metric samples on `events` before this
    /// returns, so no sample recorded afterwards is missed.
    pub fn spawn(
        metrics: MetricsCollector,
        events: EventBus,
        notifiers: NotifierRegistry,
        options: AlertOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = AlertActor::new(options, metrics, events, notifiers, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AlertCommand,
    ) -> Result<T, AlertError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| AlertError::Unavailable)?;
        rx.await.map_err(|_| AlertError::Unavailable)
    }

    pub async fn add_rule(&self, rule: AlertRule) -> Result<(), AlertError> {
        self.request(|respond_to| AlertCommand::AddRule { rule, respond_to })
            .await?
    }

    /// Replace a rule, keeping its trigger/notification timestamps
    pub async fn update_rule(&self, rule: AlertRule) -> Result<(), AlertError> {
        self.request(|respond_to| AlertCommand::UpdateRule { rule, respond_to })
            .await?
    }

    /// Remove a rule and resolve its active alerts
    pub async fn delete_rule(&self, rule_id: impl Into<String>) -> Result<(), AlertError> {
        let rule_id = rule_id.into();
        self.request(|respond_to| AlertCommand::DeleteRule {
            rule_id,
            respond_to,
        })
        .await?
    }

    pub async fn set_silenced(
        &self,
        rule_id: impl Into<String>,
        silenced: bool,
    ) -> Result<(), AlertError> {
        let rule_id = rule_id.into();
        self.request(|respond_to| AlertCommand::SetSilenced {
            rule_id,
            silenced,
            respond_to,
        })
        .await?
    }

    pub async fn add_channel(&self, channel: NotificationChannel) -> Result<(), AlertError> {
        self.request(|respond_to| AlertCommand::AddChannel {
            channel,
            respond_to,
        })
        .await?
    }

    pub async fn remove_channel(&self, channel_id: impl Into<String>) -> Result<(), AlertError> {
        let channel_id = channel_id.into();
        self.request(|respond_to| AlertCommand::RemoveChannel {
            channel_id,
            respond_to,
        })
        .await?
    }

    pub async fn set_channel_enabled(
        &self,
        channel_id: impl Into<String>,
        enabled: bool,
    ) -> Result<(), AlertError> {
        let channel_id = channel_id.into();
        self.request(|respond_to| AlertCommand::SetChannelEnabled {
            channel_id,
            enabled,
            respond_to,
        })
        .await?
    }

    pub async fn rules(&self) -> Result<Vec<AlertRule>, AlertError> {
        self.request(|respond_to| AlertCommand::GetRules { respond_to })
            .await
    }

    pub async fn channels(&self) -> Result<Vec<NotificationChannel>, AlertError> {
        self.request(|respond_to| AlertCommand::GetChannels { respond_to })
            .await
    }

    /// Active alerts, newest first
    pub async fn active_alerts(&self) -> Result<Vec<Alert>, AlertError> {
        self.request(|respond_to| AlertCommand::GetActiveAlerts { respond_to })
            .await
    }

    /// Alerts matching `filter`, newest first
    pub async fn alert_history(&self, filter: HistoryFilter) -> Result<Vec<Alert>, AlertError> {
        self.request(|respond_to| AlertCommand::GetHistory { filter, respond_to })
            .await
    }

    pub async fn rule_status(&self, rule_id: impl Into<String>) -> Result<RuleStatus, AlertError> {
        let rule_id = rule_id.into();
        self.request(|respond_to| AlertCommand::GetRuleStatus {
            rule_id,
            respond_to,
        })
        .await?
    }

    /// Start the periodic sweep
    pub async fn start_sweep(&self) {
        let _ = self.sender.send(AlertCommand::StartSweep).await;
    }

    pub async fn stop_sweep(&self) {
        let _ = self.sender.send(AlertCommand::StopSweep).await;
    }

    /// Evaluate every rule now and wait for the resulting notifications
    pub async fn sweep_now(&self) -> Result<(), AlertError> {
        self.request(|respond_to| AlertCommand::SweepNow { respond_to })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlertCommand::Shutdown).await;
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
