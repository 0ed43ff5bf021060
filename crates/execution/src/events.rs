//! Lifecycle events broadcast by the orchestrator.

use chrono::{DateTime, Utc};
use lp_keeper_domain::{BinRange, InstanceId, Phase, PositionAddress, StoppingReason};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// An event emitted for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Event ID.
    pub id: String,
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl LifecycleEvent {
    pub fn new(instance_id: InstanceId, data: EventData) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Event-specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    PhaseChanged {
        from: Phase,
        to: Phase,
        reason: Option<StoppingReason>,
    },
    PositionOpened {
        address: PositionAddress,
        range: BinRange,
        amount: Decimal,
    },
    PositionClosed {
        address: PositionAddress,
        /// The position was already gone when the close was sent.
        already_closed: bool,
    },
    RecreationDecided {
        kind: String,
        confidence: Decimal,
        reasoning: String,
    },
    StopLossDecided {
        action: String,
        risk_score: Decimal,
        confidence: Decimal,
        reasoning: String,
    },
    SwapExecuted {
        input_mint: String,
        amount_atomic: u64,
        output_amount_atomic: u64,
    },
    CleanupAttempt {
        retry_count: u32,
        remaining: usize,
    },
    LockForceReleased {
        lock: String,
        held_secs: u64,
    },
    Error {
        message: String,
    },
}

/// Broadcast channel for lifecycle events. Publishing never blocks and never
/// fails; events without subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, instance_id: &InstanceId, data: EventData) {
        let _ = self
            .sender
            .send(LifecycleEvent::new(instance_id.clone(), data));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = InstanceId::from("i-1");

        bus.publish(
            &id,
            EventData::PhaseChanged {
                from: Phase::Creating,
                to: Phase::Monitoring,
                reason: None,
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.instance_id, id);
        assert!(matches!(
            event.data,
            EventData::PhaseChanged {
                to: Phase::Monitoring,
                ..
            }
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(
            &InstanceId::from("i-1"),
            EventData::Error {
                message: "boom".to_string(),
            },
        );
    }
}
