//! In-process order event log with per-order fan-out.
//!
//! Every order owns an append-only log and a broadcast channel. A subscriber snapshots the backlog
//! and subscribes under the same lock as `publish`, so replayed and live events never overlap or
//! leave a gap.

use crate::domain::OrderEvent;
use crate::error::ServiceError;
use crate::services::{EventBroker, ServiceResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

struct OrderLog {
    events: Vec<OrderEvent>,
    tx: broadcast::Sender<OrderEvent>,
}

impl OrderLog {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            events: Vec::new(),
            tx,
        }
    }

    fn next_seq(&self) -> i64 {
        self.events.last().map_or(1, |event| event.seq + 1)
    }
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<i64, OrderLog>,
    next_id: i64,
}

pub struct MemoryBroker {
    state: RwLock<BrokerState>,
    capacity: usize,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    async fn publish(
        &self,
        order_id: i64,
        event_type: &str,
        data: Value,
    ) -> ServiceResult<OrderEvent> {
        if event_type.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id;
        let capacity = self.capacity;
        let log = state
            .logs
            .entry(order_id)
            .or_insert_with(|| OrderLog::new(capacity));
        let event = OrderEvent {
            id,
            order_id,
            seq: log.next_seq(),
            event_type: event_type.to_string(),
            data,
            created_at: Utc::now(),
        };
        log.events.push(event.clone());
        match log.tx.send(event.clone()) {
            Ok(receivers) => debug!(order_id, seq = event.seq, receivers, "Order event broadcast"),
            Err(_) => debug!(order_id, seq = event.seq, "No subscribers for order event"),
        }
        Ok(event)
    }

    async fn list(&self, order_id: i64, after_seq: i64) -> ServiceResult<Vec<OrderEvent>> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .get(&order_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|event| event.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream(
        &self,
        order_id: i64,
        last_seq: i64,
    ) -> ServiceResult<BoxStream<'static, OrderEvent>> {
        let mut state = self.state.write().await;
        let capacity = self.capacity;
        let log = state
            .logs
            .entry(order_id)
            .or_insert_with(|| OrderLog::new(capacity));
        let backlog: Vec<OrderEvent> = log
            .events
            .iter()
            .filter(|event| event.seq > last_seq)
            .cloned()
            .collect();
        let rx = log.tx.subscribe();
        drop(state);

        let cursor = backlog.last().map_or(last_seq, |event| event.seq);
        let live = BroadcastStream::new(rx).filter_map(move |item| {
            let event = match item {
                Ok(event) if event.seq > cursor => Some(event),
                Ok(_) => None,
                Err(err) => {
                    // Lagged receivers skip ahead; the client can reconnect with Last-Event-ID.
                    warn!(order_id, "Order event subscriber lagged: {err}");
                    None
                }
            };
            futures::future::ready(event)
        });
        Ok(stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn seq_is_monotonic_per_order() -> Result<()> {
        let broker = MemoryBroker::new();
        let a1 = broker.publish(1, "order.created", json!({})).await?;
        let b1 = broker.publish(2, "order.created", json!({})).await?;
        let a2 = broker.publish(1, "order.approved", json!({})).await?;
        assert_eq!((a1.seq, a2.seq, b1.seq), (1, 2, 1));
        assert!(a2.id > b1.id);

        let after = broker.list(1, 1).await?;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_type, "order.approved");
        Ok(())
    }

    #[tokio::test]
    async fn stream_replays_then_follows() -> Result<()> {
        let broker = MemoryBroker::new();
        broker.publish(9, "order.created", json!({"n": 1})).await?;
        broker.publish(9, "order.pending_review", json!({"n": 2})).await?;

        let mut events = broker.stream(9, 1).await?;
        let first = timeout(Duration::from_secs(1), events.next()).await?;
        assert_eq!(first.map(|e| e.seq), Some(2));

        broker.publish(9, "order.approved", json!({"n": 3})).await?;
        let live = timeout(Duration::from_secs(1), events.next()).await?;
        assert_eq!(live.map(|e| e.event_type), Some("order.approved".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_blank_type() {
        let broker = MemoryBroker::new();
        assert!(broker.publish(1, " ", json!({})).await.is_err());
    }
}
