//! Structured gateway events and their webhook delivery.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::infragate::telemetry;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Error {
        kind: String,
        message: String,
        routing_key: Option<String>,
    },
    RoutingConflict {
        routing_key: String,
        previous_backend: String,
        backend: String,
    },
    PlayerJoin {
        client: String,
        username: Option<String>,
        routing_key: String,
        backend: String,
    },
    PlayerLeave {
        client: String,
        username: Option<String>,
        routing_key: String,
        backend: String,
    },
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::RoutingConflict { .. } => "routing_conflict",
            Self::PlayerJoin { .. } => "player_join",
            Self::PlayerLeave { .. } => "player_leave",
        }
    }
}

/// Receives events from the gateway. `emit` runs on hot paths and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub type SharedEventSink = Arc<dyn EventSink>;

#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: Event) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub id: String,
    pub url: String,
    /// Event type names; `"*"` matches everything.
    pub events: Vec<String>,
    pub timeout: Duration,
}

impl WebhookTarget {
    pub fn accepts(&self, event: &Event) -> bool {
        let name = event.type_name();
        self.events.iter().any(|e| e == "*" || e == name)
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    occurred_at_unix_ms: u64,
    #[serde(flatten)]
    event: &'a Event,
}

/// Queues events and POSTs them as JSON to every matching target.
#[derive(Debug)]
pub struct WebhookDispatcher {
    tx: mpsc::Sender<Event>,
    targets: Arc<ArcSwap<Vec<WebhookTarget>>>,
}

impl WebhookDispatcher {
    pub fn spawn(
        targets: Vec<WebhookTarget>,
        capacity: usize,
    ) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let client = reqwest::Client::builder()
            .build()
            .context("webhook: build http client")?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let targets = Arc::new(ArcSwap::from_pointee(targets));
        let task = tokio::spawn(deliver_loop(client, rx, targets.clone()));
        Ok((Self { tx, targets }, task))
    }

    /// Swap the target list; events already queued use the new list.
    pub fn set_targets(&self, targets: Vec<WebhookTarget>) {
        self.targets.store(Arc::new(targets));
    }
}

impl EventSink for WebhookDispatcher {
    fn emit(&self, event: Event) {
        if self.targets.load().iter().all(|t| !t.accepts(&event)) {
            return;
        }
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(err = %err, "webhook: queue full, event dropped");
        }
    }
}

async fn deliver_loop(
    client: reqwest::Client,
    mut rx: mpsc::Receiver<Event>,
    targets: Arc<ArcSwap<Vec<WebhookTarget>>>,
) {
    while let Some(event) = rx.recv().await {
        let event = Arc::new(event);
        for target in targets.load().iter().filter(|t| t.accepts(&event)) {
            let client = client.clone();
            let target = target.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = post(&client, &target, &event).await {
                    tracing::warn!(
                        webhook = %target.id,
                        url = %target.url,
                        event = event.type_name(),
                        err = %err,
                        "webhook: delivery failed"
                    );
                }
            });
        }
    }
}

async fn post(client: &reqwest::Client, target: &WebhookTarget, event: &Event) -> anyhow::Result<()> {
    let payload = WebhookPayload {
        occurred_at_unix_ms: telemetry::now_unix_ms(),
        event,
    };
    let resp = client
        .post(&target.url)
        .timeout(target.timeout)
        .json(&payload)
        .send()
        .await
        .context("send")?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("unexpected status {status}");
    }
    tracing::debug!(webhook = %target.id, event = event.type_name(), "webhook: delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, routing::post};
    use tokio::sync::mpsc as tmpsc;

    use super::*;

    fn target(url: String, events: &[&str]) -> WebhookTarget {
        WebhookTarget {
            id: "test".into(),
            url,
            events: events.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = Event::RoutingConflict {
            routing_key: "a.test@:25565".into(),
            previous_backend: "a".into(),
            backend: "b".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "routing_conflict");
        assert_eq!(v["previous_backend"], "a");
    }

    #[test]
    fn target_filters_by_type() {
        let ev = Event::Error {
            kind: "decode".into(),
            message: "bad".into(),
            routing_key: None,
        };
        assert!(target(String::new(), &["*"]).accepts(&ev));
        assert!(target(String::new(), &["error"]).accepts(&ev));
        assert!(!target(String::new(), &["player_join"]).accepts(&ev));
    }

    #[tokio::test]
    async fn dispatcher_posts_matching_events() {
        let (seen_tx, mut seen_rx) = tmpsc::unbounded_channel::<serde_json::Value>();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(tx): State<tmpsc::UnboundedSender<serde_json::Value>>,
                     Json(v): Json<serde_json::Value>| async move {
                        let _ = tx.send(v);
                    },
                ),
            )
            .with_state(seen_tx);
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(ln, app).await.unwrap();
        });

        let (d, _task) =
            WebhookDispatcher::spawn(vec![target(format!("http://{addr}/hook"), &["player_join"])], 8)
                .unwrap();
        d.emit(Event::PlayerLeave {
            client: "127.0.0.1:1".into(),
            username: None,
            routing_key: "a.test@:25565".into(),
            backend: "a".into(),
        });
        d.emit(Event::PlayerJoin {
            client: "127.0.0.1:1".into(),
            username: Some("Steve".into()),
            routing_key: "a.test@:25565".into(),
            backend: "a".into(),
        });

        let got = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got["type"], "player_join");
        assert_eq!(got["username"], "Steve");
        assert!(got["occurred_at_unix_ms"].as_u64().unwrap() > 0);
    }
}
