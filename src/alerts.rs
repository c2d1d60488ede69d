//! Alert rules, alert instances and their evaluation
//!
//! Everything in here is pure: the [`crate::actors::alert::AlertActor`] owns
//! the rule and alert maps and calls into this module to decide whether a
//! series triggers and what the notification says.
//!
//! ```text
//! threshold: latest  <op>  threshold
//! change:    |latest - previous| / |previous| * 100  >=  change_percent
//! absence:   series empty  ||  now - latest.timestamp >= duration
//! ```

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::{Labels, MetricValue};

/// Default time between two notifications of the same rule
pub const DEFAULT_COOLDOWN_MS: u64 = 5 * 60 * 1000;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Ge => value >= threshold,
            Operator::Le => value <= threshold,
            Operator::Eq => value == threshold,
            Operator::Ne => value != threshold,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Threshold { operator: Operator, threshold: f64 },
    Change { change_percent: f64 },
    Absence { duration_ms: u64 },
}

impl Condition {
    /// The number an alert reports as its threshold
    pub fn threshold(&self) -> Option<f64> {
        match self {
            Condition::Threshold { threshold, .. } => Some(*threshold),
            Condition::Change { change_percent } => Some(*change_percent),
            Condition::Absence { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub metric: String,
    pub condition: Condition,
    /// Series must carry every one of these labels
    #[serde(default)]
    pub labels: Labels,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Message template with `${field}` placeholders
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub silenced: bool,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_notified: Option<DateTime<Utc>>,
}

impl AlertRule {
    pub fn new(id: impl Into<String>, metric: impl Into<String>, condition: Condition) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            metric: metric.into(),
            condition,
            labels: Labels::new(),
            severity: default_severity(),
            channels: Vec::new(),
            template: None,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            silenced: false,
            last_triggered: None,
            last_notified: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_cooldown(mut self, cooldown: std::time::Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::milliseconds(self.cooldown_ms as i64)
    }

    /// True when no notification was sent within the cooldown window
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_notified
            .is_none_or(|notified| now - notified >= self.cooldown())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::Active => f.write_str("active"),
            AlertStatus::Resolved => f.write_str("resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    pub metric: String,
    pub labels: Labels,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Build an active alert for `rule` and render its message
    pub fn fire(rule: &AlertRule, labels: Labels, value: Option<f64>, now: DateTime<Utc>) -> Self {
        let mut alert = Self {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            metric: rule.metric.clone(),
            labels,
            value,
            threshold: rule.condition.threshold(),
            severity: rule.severity,
            message: String::new(),
            created_at: now,
            status: AlertStatus::Active,
            resolved_at: None,
        };
        alert.message = render_message(rule, &alert);
        alert
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    #[serde(alias = "slack", alias = "discord")]
    Chat,
    Webhook,
    Sms,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Email => "email",
            ChannelKind::Chat => "chat",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Sms => "sms",
        };
        f.write_str(name)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    /// Notifier specific settings (e.g. `{"url": "..."}`)
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NotificationChannel {
    pub fn new(id: impl Into<String>, kind: ChannelKind, config: serde_json::Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            config,
            enabled: true,
        }
    }
}

/// Result of evaluating one rule against one series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub triggered: bool,
    /// Latest observed value, if any
    pub value: Option<f64>,
}

/// Evaluate `condition` against a series (oldest first)
pub fn evaluate(condition: &Condition, values: &[MetricValue], now: DateTime<Utc>) -> Evaluation {
    let latest = values.last();
    let value = latest.map(|v| v.value);

    let triggered = match condition {
        Condition::Threshold {
            operator,
            threshold,
        } => latest.is_some_and(|v| operator.compare(v.value, *threshold)),

        Condition::Change { change_percent } => match values {
            [.., previous, current] => {
                exceeds_change(previous.value, current.value, *change_percent)
            }
            _ => false,
        },

        Condition::Absence { duration_ms } => match latest {
            None => true,
            Some(v) => now - v.timestamp >= Duration::milliseconds(*duration_ms as i64),
        },
    };

    Evaluation { triggered, value }
}

fn exceeds_change(previous: f64, current: f64, change_percent: f64) -> bool {
    if previous == 0.0 {
        // any move away from zero is an unbounded change
        return current != 0.0;
    }
    ((current - previous) / previous).abs() * 100.0 >= change_percent
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

/// Render the notification text of `alert`
///
/// Uses the rule's template when set, the default layout otherwise.
pub fn render_message(rule: &AlertRule, alert: &Alert) -> String {
    match &rule.template {
        Some(template) => render_template(template, rule, alert),
        None => format!(
            "[{}] {}\nmetric: {}\nvalue: {}\nthreshold: {}\ndescription: {}",
            rule.severity.to_string().to_uppercase(),
            rule.name,
            rule.metric,
            format_optional(alert.value),
            format_optional(alert.threshold),
            rule.description.as_deref().unwrap_or_default(),
        ),
    }
}

/// Replace `${field}` placeholders. Unknown fields are left untouched.
pub fn render_template(template: &str, rule: &AlertRule, alert: &Alert) -> String {
    let Some(placeholder) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };

    placeholder
        .replace_all(template, |caps: &Captures| {
            let field = &caps[1];
            let replacement = match field {
                "id" => Some(alert.id.to_string()),
                "rule_id" | "ruleId" => Some(alert.rule_id.clone()),
                "name" => Some(rule.name.clone()),
                "description" => rule.description.clone(),
                "metric" => Some(alert.metric.clone()),
                "value" => alert.value.map(|v| v.to_string()),
                "threshold" => alert.threshold.map(|v| v.to_string()),
                "severity" => Some(alert.severity.to_string()),
                "status" => Some(alert.status.to_string()),
                "created_at" | "timestamp" => Some(alert.created_at.to_rfc3339()),
                "labels" => Some(crate::metrics::label_key(&alert.labels)),
                label => alert.labels.get(label).cloned(),
            };
            replacement.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Filters for alert history queries. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub rule_id: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn rule(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: Some(rule_id.into()),
            ..Self::default()
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_status(mut self, status: AlertStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.rule_id.as_ref().is_none_or(|id| *id == alert.rule_id)
            && self.severity.is_none_or(|s| s == alert.severity)
            && self.status.is_none_or(|s| s == alert.status)
            && self.since.is_none_or(|since| alert.created_at >= since)
            && self.until.is_none_or(|until| alert.created_at <= until)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub rule: AlertRule,
    pub active_alert_count: usize,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_notified: Option<DateTime<Utc>>,
}
