//! Activity change feed.
//!
//! Every routing mutation emits one JSON [`ActivityEntry`] on the
//! `activity` notification channel. Routing mutations may happen on any
//! control-plane replica; tailing the feed is how the other replicas
//! converge and push the change to their connected hubs.

use crate::error::RegistryResult;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Notification channel name.
pub const ACTIVITY_CHANNEL: &str = "activity";

/// One entry on the change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub route_added: RouteAdded,
}

/// A newly materialized route set for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAdded {
    pub account_id: Uuid,
    pub namespace: String,
    pub services: Vec<RouteService>,
}

/// One routed service within an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteService {
    pub hub_id: Uuid,
    pub service_id: Uuid,
    #[serde(rename = "type")]
    pub service_type: String,
    pub labels: Vec<String>,
}

/// Decode feed payloads, skipping (and logging) malformed entries.
pub fn decode_entries<S: AsRef<str>>(payloads: &[S]) -> Vec<RouteAdded> {
    payloads
        .iter()
        .filter_map(|payload| {
            match serde_json::from_str::<ActivityEntry>(payload.as_ref()) {
                Ok(entry) => Some(entry.route_added),
                Err(err) => {
                    tracing::error!(error = %err, "skipping malformed activity entry");
                    None
                }
            }
        })
        .collect()
}

/// Tails the activity channel and yields decoded entries in batches.
pub struct ActivityReader {
    rx: mpsc::Receiver<RouteAdded>,
}

impl ActivityReader {
    /// Connect a listener and start tailing the channel.
    pub async fn connect(url: &str) -> RegistryResult<Self> {
        let mut listener = PgListener::connect(url).await?;
        listener.listen(ACTIVITY_CHANNEL).await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let decoded = decode_entries(&[notification.payload()]);
                        for entry in decoded {
                            if tx.send(entry).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        // Connection dropped; the listener reconnects on
                        // the next call. Entries sent in the gap are lost,
                        // which routing tolerates (idempotent deltas).
                        tracing::warn!("activity channel connection lost, reconnecting");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "activity channel closed");
                        return;
                    }
                }
            }
        });

        Ok(Self { rx })
    }

    /// Build a reader over an in-process feed. Used by tests and by the
    /// in-memory store.
    pub fn from_channel(rx: mpsc::Receiver<RouteAdded>) -> Self {
        Self { rx }
    }

    /// The next batch of entries: blocks for one entry, then drains
    /// whatever else is available without blocking. Returns `None` once
    /// the feed closes.
    pub async fn next_batch(&mut self) -> Option<Vec<RouteAdded>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while let Ok(more) = self.rx.try_recv() {
            batch.push(more);
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ns: &str) -> String {
        serde_json::to_string(&ActivityEntry {
            route_added: RouteAdded {
                account_id: Uuid::new_v4(),
                namespace: ns.to_string(),
                services: vec![RouteService {
                    hub_id: Uuid::new_v4(),
                    service_id: Uuid::new_v4(),
                    service_type: "http".to_string(),
                    labels: vec!["env=prod".to_string()],
                }],
            },
        })
        .unwrap()
    }

    #[test]
    fn decode_skips_malformed() {
        let payloads = vec![entry("/a"), "{not json".to_string(), entry("/b")];
        let decoded = decode_entries(&payloads);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].namespace, "/a");
        assert_eq!(decoded[1].namespace, "/b");
    }

    #[test]
    fn entry_json_shape() {
        let json = entry("/org");
        assert!(json.contains("\"route_added\""));
        assert!(json.contains("\"type\":\"http\""));
    }

    #[tokio::test]
    async fn batches_drain_without_blocking() {
        let (tx, rx) = mpsc::channel(16);
        let mut reader = ActivityReader::from_channel(rx);

        for ns in ["/a", "/b", "/c"] {
            let decoded = decode_entries(&[entry(ns)]);
            tx.send(decoded.into_iter().next().unwrap()).await.unwrap();
        }

        let batch = reader.next_batch().await.unwrap();
        assert_eq!(batch.len(), 3);

        drop(tx);
        assert!(reader.next_batch().await.is_none());
    }
}
