//! Notification sinks. Delivery is best effort: a sink never reports failure
//! to its caller, it logs and moves on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::plant::Plant;
use crate::schedule::WateringTime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Notification {
    pub fn watering(plant: &Plant, time: WateringTime) -> Self {
        Self {
            title: format!("Time to water {}", plant.name),
            body: format!("{} is scheduled for watering at {time}.", plant.name),
            icon: plant.image_url.clone(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Whether the user allowed notifications. When false the scheduler
    /// still flags plants but never calls [`notify`](Self::notify).
    fn is_permitted(&self) -> bool;
    async fn notify(&self, notification: &Notification);
}

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Writes notifications to the log.
pub struct LogSink {
    permitted: bool,
}

impl LogSink {
    pub fn new(permitted: bool) -> Self {
        Self { permitted }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    fn is_permitted(&self) -> bool {
        self.permitted
    }

    async fn notify(&self, n: &Notification) {
        info!(title = %n.title, body = %n.body, "notification");
    }
}

// ---------------------------------------------------------------------------
// Webhook sink
// ---------------------------------------------------------------------------

/// POSTs each notification as JSON to a push relay.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    permitted: bool,
}

impl WebhookSink {
    pub fn new(url: &str, permitted: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            permitted,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn is_permitted(&self) -> bool {
        self.permitted
    }

    async fn notify(&self, n: &Notification) {
        let res = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = res {
            warn!(url = %self.url, "notification webhook failed: {e}");
        }
    }
}

/// Pick the delivery sink for the configured notification settings.
pub fn build_sink(webhook_url: Option<&str>, enabled: bool) -> Result<Arc<dyn NotificationSink>> {
    Ok(match webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url, enabled)?),
        None => Arc::new(LogSink::new(enabled)),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) use recording::RecordingSink;


#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::sample;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn watering_notification_text() {
        let mut p = sample(1, "Monstera", &["07:00"]);
        p.image_url = Some("https://img.example/monstera.jpg".into());
        let n = Notification::watering(&p, "07:00".parse().unwrap());
        assert_eq!(n.title, "Time to water Monstera");
        assert_eq!(n.body, "Monstera is scheduled for watering at 07:00.");
        assert_eq!(n.icon.as_deref(), Some("https://img.example/monstera.jpg"));
    }

    #[test]
    fn icon_omitted_from_json_when_absent() {
        let n = Notification::watering(&sample(1, "Fern", &[]), "07:00".parse().unwrap());
        let v = serde_json::to_value(&n).unwrap();
        assert!(v.get("icon").is_none());
    }

    #[test]
    fn build_sink_respects_permission() {
        assert!(build_sink(None, true).unwrap().is_permitted());
        assert!(!build_sink(None, false).unwrap().is_permitted());
        assert!(!build_sink(Some("http://127.0.0.1:9/hook"), false)
            .unwrap()
            .is_permitted());
    }

    #[tokio::test]
    async fn webhook_posts_json_body() {
        let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(tx): State<mpsc::UnboundedSender<serde_json::Value>>,
                     Json(body): Json<serde_json::Value>| async move {
                        let _ = tx.send(body);
                    },
                ),
            )
            .with_state(tx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let sink = WebhookSink::new(&format!("http://{addr}/hook"), true).unwrap();
        let n = Notification::watering(&sample(1, "Fern", &[]), "18:30".parse().unwrap());
        sink.notify(&n).await;

        let body = rx.recv().await.unwrap();
        assert_eq!(body["title"], "Time to water Fern");
        assert_eq!(body["body"], "Fern is scheduled for watering at 18:30.");
    }

    #[tokio::test]
    async fn webhook_failure_is_swallowed() {
        // Nothing listens on port 9 (discard); notify must still return.
        let sink = WebhookSink::new("http://127.0.0.1:9/hook", true).unwrap();
        let n = Notification::watering(&sample(1, "Fern", &[]), "07:00".parse().unwrap());
        sink.notify(&n).await;
    }
}
