use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::alerts::{Alert, AlertRule, NotificationChannel, Severity};
use crate::metrics::label_key;
use crate::notify::{Notifier, channel_url};

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn inline(name: &str, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            inline: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

fn severity_style(severity: Severity) -> (&'static str, u32) {
    match severity {
        Severity::Info => ("ℹ️", 5793266),      // Light blue
        Severity::Warning => ("⚠️", 15105570),  // Orange
        Severity::Error => ("🔥", 15158332),    // Red
        Severity::Critical => ("🚨", 10038562), // Dark red
    }
}

/// Render an alert as a chat embed
pub fn build_alert_embed(rule: &AlertRule, alert: &Alert) -> Embed {
    let (emoji, color) = severity_style(alert.severity);

    let mut fields = vec![
        EmbedField::inline("📈 Metric", format!("`{}`", alert.metric)),
        EmbedField::inline(
            "📊 Value",
            alert.value.map_or_else(|| "no data".to_string(), |v| format!("{v:.2}")),
        ),
    ];
    if let Some(threshold) = alert.threshold {
        fields.push(EmbedField::inline("⚠️ Threshold", format!("{threshold:.2}")));
    }
    if !alert.labels.is_empty() {
        fields.push(EmbedField {
            name: "🏷️ Labels".to_string(),
            value: format!("`{}`", label_key(&alert.labels)),
            inline: false,
        });
    }

    Embed {
        title: Some(format!("{emoji} {}", rule.name)),
        description: Some(alert.message.clone()),
        color: Some(color),
        fields,
        footer: Some(EmbedFooter {
            text: format!("Rule: {} | Severity: {}", rule.id, alert.severity),
        }),
        timestamp: Some(alert.created_at.to_rfc3339()),
    }
}

/// Chat webhook notifier (Discord-style embeds)
///
/// Channel config: `{"url": "...", "user_id": "..."}`; `user_id` is optional
/// and gets mentioned in the message content.
#[derive(Debug, Clone, Default)]
pub struct ChatNotifier {
    client: Client,
}

impl ChatNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    #[instrument(skip(self, url, message))]
    async fn send_message(&self, url: &str, message: &Message) -> anyhow::Result<()> {
        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .context("failed to send chat message")?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(error_text) = response.text().await {
                error!("chat API error response: {}", error_text);
            }
            bail!("chat message failed with status: {status}");
        }

        debug!("successfully sent chat message at {}", Utc::now().to_rfc3339());
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn send(
        &self,
        channel: &NotificationChannel,
        rule: &AlertRule,
        alert: &Alert,
    ) -> anyhow::Result<()> {
        let url = channel_url(channel)?;
        let (emoji, _) = severity_style(alert.severity);

        let mut builder = MessageBuilder::new().add_embed(build_alert_embed(rule, alert));
        if let Some(user_id) = channel.config.get("user_id").and_then(|id| id.as_str()) {
            builder = builder.content(format!("{emoji} `{}` <@{user_id}>", rule.name));
        }

        self.send_message(url, &builder.build()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Condition, Operator};
    use crate::metrics::labels;

    #[test]
    fn test_embed_contains_threshold_and_labels() {
        let rule = AlertRule::new(
            "cpu-high",
            "cpu.usage",
            Condition::Threshold {
                operator: Operator::Gt,
                threshold: 80.0,
            },
        )
        .with_name("CPU high")
        .with_severity(Severity::Critical);
        let alert = Alert::fire(&rule, labels([("host", "a")]), Some(91.5), Utc::now());

        let embed = build_alert_embed(&rule, &alert);
        assert_eq!(embed.title.as_deref(), Some("🚨 CPU high"));
        assert_eq!(embed.fields.len(), 4);
        assert_eq!(embed.fields[1].value, "91.50");
        assert_eq!(embed.fields[3].value, "`host=\"a\"`");
    }

    #[test]
    fn test_message_skips_empty_parts() {
        let message = MessageBuilder::new().content("hi").build();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json, serde_json::json!({ "content": "hi" }));
    }
}
