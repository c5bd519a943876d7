//! Flow telemetry aggregation.
//!
//! Hubs push batches of flow records over their streaming session.
//! Stream records feed per-flow counters and the bounded flow top;
//! agent and hub-stats records set gauges. Malformed records are
//! logged and skipped.

use crate::flowtop::FlowTop;
use crate::metrics;
use crate::session::SessionHandle;
use std::sync::atomic::Ordering;
use trellis_proto::{FlowRecord, spec_string};

/// Aggregates telemetry pushed by hub sessions.
pub struct Telemetry {
    flow_top: FlowTop,
}

impl Telemetry {
    pub fn new(flow_top_size: usize) -> Self {
        Self {
            flow_top: FlowTop::new(flow_top_size),
        }
    }

    pub fn flow_top(&self) -> &FlowTop {
        &self.flow_top
    }

    /// Fold one inbound batch into the counters.
    pub fn process_flows(&self, session: &SessionHandle, records: &[FlowRecord]) {
        let mut message_diff = 0i64;
        let mut byte_diff = 0i64;

        for record in records {
            if let Some(stream) = &record.stream {
                let ids = (
                    spec_string(&stream.flow_id),
                    spec_string(&stream.hub_id),
                    spec_string(&stream.agent_id),
                    spec_string(&stream.service_id),
                    stream.account.as_ref().map(|a| a.key()),
                );
                let (Ok(flow), Ok(hub), Ok(agent), Ok(service), Some(Ok(account))) = ids else {
                    tracing::error!("skipping malformed stream record");
                    continue;
                };

                message_diff += stream.num_messages;
                byte_diff += stream.num_bytes;

                let account = account.hyphenated().to_string();
                let labels = [
                    flow.as_str(),
                    hub.as_str(),
                    agent.as_str(),
                    service.as_str(),
                    account.as_str(),
                ];
                metrics::STREAM_MESSAGES
                    .with_label_values(&labels)
                    .inc_by(stream.num_messages.max(0) as u64);
                metrics::STREAM_BYTES
                    .with_label_values(&labels)
                    .inc_by(stream.num_bytes.max(0) as u64);

                self.flow_top.add(&flow, stream.num_messages, stream.num_bytes);
            }

            if let Some(agent) = &record.agent {
                let ids = (
                    spec_string(&agent.hub_id),
                    spec_string(&agent.agent_id),
                    agent.account.as_ref().map(|a| a.key()),
                );
                let (Ok(hub), Ok(agent_id), Some(Ok(account))) = ids else {
                    tracing::error!("skipping malformed agent record");
                    continue;
                };

                metrics::HUB_STREAMS
                    .with_label_values(&[
                        hub.as_str(),
                        agent_id.as_str(),
                        account.hyphenated().to_string().as_str(),
                    ])
                    .set(agent.active_streams);
            }

            if let Some(stats) = &record.hub_stats {
                let Ok(hub) = spec_string(&stats.hub_id) else {
                    tracing::error!("skipping malformed hub stats record");
                    continue;
                };
                metrics::AGENTS_ACTIVE
                    .with_label_values(&[hub.as_str()])
                    .set(stats.active_agents);
            }
        }

        metrics::TOTAL_MESSAGES.inc_by(message_diff.max(0) as u64);
        metrics::TOTAL_BYTES.inc_by(byte_diff.max(0) as u64);

        session.messages.fetch_add(message_diff, Ordering::Relaxed);
        session.bytes.fetch_add(byte_diff, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use trellis_proto::{Account, AgentRecord, HubStatsRecord, StreamRecord, id_bytes};
    use uuid::Uuid;

    fn stream_record(flow: Uuid, messages: i64, bytes: i64) -> FlowRecord {
        FlowRecord {
            stream: Some(StreamRecord {
                flow_id: id_bytes(flow),
                hub_id: id_bytes(Uuid::new_v4()),
                agent_id: id_bytes(Uuid::new_v4()),
                service_id: id_bytes(Uuid::new_v4()),
                account: Some(Account::new(Uuid::new_v4(), "/org")),
                num_messages: messages,
                num_bytes: bytes,
                duration_ms: 0,
            }),
            agent: None,
            hub_stats: None,
        }
    }

    #[tokio::test]
    async fn stream_records_advance_counters() {
        let telemetry = Telemetry::new(16);
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.register("hub".to_string());

        let before_messages = metrics::TOTAL_MESSAGES.get();
        let before_bytes = metrics::TOTAL_BYTES.get();

        let flow_a = Uuid::new_v4();
        let flow_b = Uuid::new_v4();
        telemetry.process_flows(
            &session,
            &[stream_record(flow_a, 3, 100), stream_record(flow_b, 5, 200)],
        );

        assert_eq!(registry.counters("hub"), Some((8, 300)));
        assert_eq!(metrics::TOTAL_MESSAGES.get() - before_messages, 8);
        assert_eq!(metrics::TOTAL_BYTES.get() - before_bytes, 300);

        let spec = |u: Uuid| u.hyphenated().to_string();
        assert!(telemetry.flow_top().contains(&spec(flow_a)));
        assert!(telemetry.flow_top().contains(&spec(flow_b)));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let telemetry = Telemetry::new(16);
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.register("hub".to_string());

        let mut bad = stream_record(Uuid::new_v4(), 3, 100);
        if let Some(stream) = &mut bad.stream {
            stream.flow_id = vec![1, 2, 3];
        }
        telemetry.process_flows(&session, &[bad]);

        assert_eq!(registry.counters("hub"), Some((0, 0)));
        assert!(telemetry.flow_top().is_empty());
    }

    #[tokio::test]
    async fn gauges_follow_agent_and_hub_stats() {
        let telemetry = Telemetry::new(16);
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.register("hub".to_string());

        let hub = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let account = Uuid::new_v4();

        telemetry.process_flows(
            &session,
            &[FlowRecord {
                stream: None,
                agent: Some(AgentRecord {
                    hub_id: id_bytes(hub),
                    agent_id: id_bytes(agent),
                    account: Some(Account::new(account, "/org")),
                    active_streams: 7,
                }),
                hub_stats: Some(HubStatsRecord {
                    hub_id: id_bytes(hub),
                    active_agents: 2,
                }),
            }],
        );

        let spec = |u: Uuid| u.hyphenated().to_string();
        assert_eq!(
            metrics::HUB_STREAMS
                .with_label_values(&[&spec(hub), &spec(agent), &spec(account)])
                .get(),
            7
        );
        assert_eq!(
            metrics::AGENTS_ACTIVE.with_label_values(&[&spec(hub)]).get(),
            2
        );
    }
}
