//! End-to-end flow telemetry accounting over a streaming session.

mod common;

use common::{StreamingHub, TestServer, wait_for};
use trellis_control::metrics;
use trellis_proto::{Account, FlowRecord, HubFrame, StreamRecord, id_bytes};
use uuid::Uuid;

fn stream_record(flow: Uuid, hub: Uuid, messages: i64, bytes: i64) -> FlowRecord {
    FlowRecord {
        stream: Some(StreamRecord {
            flow_id: id_bytes(flow),
            hub_id: id_bytes(hub),
            agent_id: id_bytes(Uuid::new_v4()),
            service_id: id_bytes(Uuid::new_v4()),
            account: Some(Account::new(Uuid::new_v4(), "/org/team")),
            num_messages: messages,
            num_bytes: bytes,
            duration_ms: 12,
        }),
        agent: None,
        hub_stats: None,
    }
}

#[tokio::test]
async fn flow_batches_advance_counters_and_flow_top() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;
    let session = StreamingHub::open(&server, &hub_token).await;

    let before_messages = metrics::TOTAL_MESSAGES.get();
    let before_bytes = metrics::TOTAL_BYTES.get();

    let flow_a = Uuid::new_v4();
    let flow_b = Uuid::new_v4();
    session
        .frames
        .send(HubFrame {
            hub_reg: None,
            flow: vec![
                stream_record(flow_a, session.hub_id, 3, 100),
                stream_record(flow_b, session.hub_id, 5, 200),
            ],
        })
        .await
        .unwrap();

    // Per-session counters advance by the batch totals.
    wait_for(|| server.sessions.counters(&session.key) == Some((8, 300))).await;

    // Process-wide totals advance identically.
    assert!(metrics::TOTAL_MESSAGES.get() - before_messages >= 8);
    assert!(metrics::TOTAL_BYTES.get() - before_bytes >= 300);

    // Both flows are tracked in the top-N.
    let spec = |u: Uuid| u.hyphenated().to_string();
    assert!(server.telemetry.flow_top().contains(&spec(flow_a)));
    assert!(server.telemetry.flow_top().contains(&spec(flow_b)));
}

#[tokio::test]
async fn session_teardown_deregisters() {
    let server = TestServer::spawn().await;
    let hub_token = server.hub_token().await;

    let session = StreamingHub::open(&server, &hub_token).await;
    let key = session.key.clone();
    assert_eq!(server.sessions.len(), 1);

    // Closing the client's sending side ends the session.
    drop(session);
    wait_for(|| server.sessions.counters(&key).is_none()).await;
    assert!(server.sessions.is_empty());
}
