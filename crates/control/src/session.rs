//! Hub session registry and broadcast fabric.
//!
//! Each streaming hub installs a session record keyed by its
//! fingerprint before its sender starts. The registry hands
//! broadcasters a snapshot taken under the read lock; each send then
//! races the subscriber's cancellation so a session that is tearing
//! down can never wedge the fabric. Sessions hold only their own
//! fingerprint, never a reference back into the registry.

use crate::metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use trellis_proto::CentralActivity;
use uuid::Uuid;

/// Items on a session's outbound queue.
pub type Outbound = Result<CentralActivity, Status>;

struct ConnectedHub {
    session_id: Uuid,
    xmit: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    messages: Arc<AtomicI64>,
    bytes: Arc<AtomicI64>,
}

/// Per-session state handed to the stream tasks.
#[derive(Clone)]
pub struct SessionHandle {
    pub key: String,
    session_id: Uuid,
    pub cancel: CancellationToken,
    pub messages: Arc<AtomicI64>,
    pub bytes: Arc<AtomicI64>,
}

/// Registry of connected hub sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectedHub>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session record, returning its handle and the receiving
    /// end of its outbound queue. A session already registered under the
    /// same fingerprint is displaced.
    pub fn register(&self, key: String) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (xmit, rx) = mpsc::channel(1);
        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let messages = Arc::new(AtomicI64::new(0));
        let bytes = Arc::new(AtomicI64::new(0));

        let hub = ConnectedHub {
            session_id,
            xmit,
            cancel: cancel.clone(),
            messages: messages.clone(),
            bytes: bytes.clone(),
        };

        let displaced = self.inner.write().insert(key.clone(), hub);
        if let Some(old) = displaced {
            old.cancel.cancel();
            tracing::debug!(hub = %key, "displaced previous session");
        } else {
            metrics::CONNECTED_HUBS.inc();
        }

        (
            SessionHandle {
                key,
                session_id,
                cancel,
                messages,
                bytes,
            },
            rx,
        )
    }

    /// Remove a session record. A session displaced by a newer one with
    /// the same fingerprint leaves the newer record alone.
    pub fn deregister(&self, handle: &SessionHandle) {
        let mut map = self.inner.write();
        if map
            .get(&handle.key)
            .is_some_and(|hub| hub.session_id == handle.session_id)
        {
            map.remove(&handle.key);
            metrics::CONNECTED_HUBS.dec();
        }
    }

    /// Fan one delta out to every registered session.
    ///
    /// Per subscriber the send blocks until the delta is accepted or the
    /// session terminates; a slow subscriber stalls the broadcaster
    /// rather than dropping the delta.
    pub async fn broadcast(&self, activity: &CentralActivity) {
        let snapshot: Vec<(String, mpsc::Sender<Outbound>, CancellationToken)> = {
            let map = self.inner.read();
            map.iter()
                .map(|(key, hub)| (key.clone(), hub.xmit.clone(), hub.cancel.clone()))
                .collect()
        };

        for (key, xmit, cancel) in snapshot {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(hub = %key, "session exiting, delta skipped");
                }
                sent = xmit.send(Ok(activity.clone())) => {
                    if sent.is_err() {
                        tracing::debug!(hub = %key, "session gone, delta skipped");
                    }
                }
            }
        }
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The (messages, bytes) counters of a session, if registered.
    pub fn counters(&self, key: &str) -> Option<(i64, i64)> {
        use std::sync::atomic::Ordering;
        let map = self.inner.read();
        map.get(key).map(|hub| {
            (
                hub.messages.load(Ordering::Relaxed),
                hub.bytes.load(Ordering::Relaxed),
            )
        })
    }
}
