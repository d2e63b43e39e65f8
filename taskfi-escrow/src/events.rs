//! Event Publisher - Emits domain events for downstream notification
//!
//! Every committed ledger transition is recorded in an append-only audit
//! history and fanned out over a broadcast channel. Publishing never fails:
//! a missing subscriber or a failing notification sink must not roll back
//! a transition that has already been written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::escrow_ledger::Resolution;

/// Domain events consumed by the notification collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    EscrowCreated {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    EscrowReleased {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
    },
    EscrowRefunded {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
    },
    EscrowDisputed {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        raised_by: Uuid,
        amount: Decimal,
        reason: String,
    },
    DisputeResolved {
        payment_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        resolved_by: Uuid,
        amount: Decimal,
        resolution: Resolution,
    },
    WithdrawalCompleted {
        transaction_id: Uuid,
        account_id: Uuid,
        amount: Decimal,
    },
    WithdrawalFailed {
        transaction_id: Uuid,
        account_id: Uuid,
        amount: Decimal,
        reason: String,
    },
}

impl DomainEvent {
    /// Accounts a notification should be delivered to
    pub fn recipients(&self) -> Vec<Uuid> {
        match self {
            Self::EscrowCreated {
                payer_id, payee_id, ..
            }
            | Self::EscrowReleased {
                payer_id, payee_id, ..
            }
            | Self::EscrowRefunded {
                payer_id, payee_id, ..
            }
            | Self::EscrowDisputed {
                payer_id, payee_id, ..
            }
            | Self::DisputeResolved {
                payer_id, payee_id, ..
            } => vec![*payer_id, *payee_id],
            Self::WithdrawalCompleted { account_id, .. }
            | Self::WithdrawalFailed { account_id, .. } => vec![*account_id],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::EscrowCreated { .. } => "escrow.created",
            Self::EscrowReleased { .. } => "escrow.released",
            Self::EscrowRefunded { .. } => "escrow.refunded",
            Self::EscrowDisputed { .. } => "escrow.disputed",
            Self::DisputeResolved { .. } => "escrow.dispute_resolved",
            Self::WithdrawalCompleted { .. } => "withdrawal.completed",
            Self::WithdrawalFailed { .. } => "withdrawal.failed",
        }
    }
}

/// Event with its position in the audit history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub event: DomainEvent,
    pub created_at: DateTime<Utc>,
}

/// Delivery target for notifications (email, push, chat...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, record: &EventRecord) -> Result<(), String>;
}

/// Append-only event history with broadcast fan-out
pub struct EventPublisher {
    sender: broadcast::Sender<EventRecord>,
    history: RwLock<Vec<EventRecord>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Record and broadcast an event. Never fails.
    pub async fn publish(&self, event: DomainEvent) {
        let record = {
            let mut history = self.history.write().await;
            let record = EventRecord {
                sequence: history.len() as u64 + 1,
                event,
                created_at: Utc::now(),
            };
            history.push(record.clone());
            record
        };
        debug!(sequence = record.sequence, kind = record.event.kind(), "Published event");

        if self.sender.send(record).is_err() {
            debug!("No notification subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Full audit history in publication order
    pub async fn history(&self) -> Vec<EventRecord> {
        self.history.read().await.clone()
    }

    /// Events that concern `account_id`
    pub async fn history_for(&self, account_id: Uuid) -> Vec<EventRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.event.recipients().contains(&account_id))
            .cloned()
            .collect()
    }

    /// Forward every published event to `sink` until the publisher is dropped
    pub fn spawn_dispatcher(&self, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
        let mut receiver = self.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(record) => {
                        if let Err(e) = sink.deliver(&record).await {
                            warn!(
                                sequence = record.sequence,
                                kind = record.event.kind(),
                                error = %e,
                                "Notification delivery failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification dispatcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, record: &EventRecord) -> Result<(), String> {
            self.delivered.lock().await.push(record.sequence);
            if self.fail {
                Err("smtp down".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn withdrawal(account_id: Uuid) -> DomainEvent {
        DomainEvent::WithdrawalCompleted {
            transaction_id: Uuid::new_v4(),
            account_id,
            amount: Decimal::from(40),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_recorded() {
        let publisher = EventPublisher::default();
        let account = Uuid::new_v4();
        publisher.publish(withdrawal(account)).await;
        publisher.publish(withdrawal(Uuid::new_v4())).await;

        let history = publisher.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sequence, 1);
        assert_eq!(history[1].sequence, 2);
        assert_eq!(publisher.history_for(account).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_survives_sink_failures() {
        let publisher = EventPublisher::default();
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
            fail: true,
        });
        let handle = publisher.spawn_dispatcher(sink.clone());

        publisher.publish(withdrawal(Uuid::new_v4())).await;
        publisher.publish(withdrawal(Uuid::new_v4())).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*sink.delivered.lock().await, vec![1, 2]);
        handle.abort();
    }

    #[test]
    fn test_recipients() {
        let payer = Uuid::new_v4();
        let payee = Uuid::new_v4();
        let event = DomainEvent::EscrowReleased {
            payment_id: Uuid::new_v4(),
            payer_id: payer,
            payee_id: payee,
            amount: Decimal::from(100),
        };
        assert_eq!(event.recipients(), vec![payer, payee]);
        assert_eq!(event.kind(), "escrow.released");
    }
}
