//! Webhook and chat notifiers against a mock HTTP server

use chrono::Utc;
use serde_json::json;
use vitalstack::alerts::{Alert, ChannelKind, NotificationChannel, Operator, Severity};
use vitalstack::discord::ChatNotifier;
use vitalstack::metrics::labels;
use vitalstack::notify::WebhookNotifier;
use vitalstack::Notifier;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn channel(kind: ChannelKind, url: String) -> NotificationChannel {
    NotificationChannel::new("target", kind, json!({ "url": url, "user_id": "42" }))
}

#[tokio::test]
async fn test_webhook_posts_alert_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({
            "rule": { "id": "cpu-high", "name": "CPU high" },
            "alert": { "rule_id": "cpu-high", "value": 91.0, "status": "active" }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let rule = threshold_rule("cpu-high", "cpu.usage", Operator::Gt, 80.0).with_name("CPU high");
    let alert = Alert::fire(&rule, labels([("host", "a")]), Some(91.0), Utc::now());

    WebhookNotifier::new(reqwest::Client::new())
        .send(
            &channel(ChannelKind::Webhook, format!("{}/hook", server.uri())),
            &rule,
            &alert,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_webhook_error_status_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let rule = threshold_rule("cpu-high", "cpu.usage", Operator::Gt, 80.0);
    let alert = Alert::fire(&rule, labels([("host", "a")]), Some(91.0), Utc::now());

    let result = WebhookNotifier::new(reqwest::Client::new())
        .send(&channel(ChannelKind::Webhook, server.uri()), &rule, &alert)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_chat_posts_embed_with_mention() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_partial_json(json!({ "content": "🚨 `Disk full` <@42>" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let rule = threshold_rule("disk", "disk.free", Operator::Lt, 5.0)
        .with_name("Disk full")
        .with_severity(Severity::Critical);
    let alert = Alert::fire(&rule, labels([("host", "db-1")]), Some(1.5), Utc::now());

    ChatNotifier::new(reqwest::Client::new())
        .send(
            &channel(ChannelKind::Chat, format!("{}/chat", server.uri())),
            &rule,
            &alert,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_channel_without_url_fails() {
    let rule = threshold_rule("disk", "disk.free", Operator::Lt, 5.0);
    let alert = Alert::fire(&rule, labels([("host", "db-1")]), Some(1.5), Utc::now());
    let channel = NotificationChannel::new("target", ChannelKind::Chat, json!({}));

    let result = ChatNotifier::new(reqwest::Client::new())
        .send(&channel, &rule, &alert)
        .await;
    assert!(result.is_err());
}
