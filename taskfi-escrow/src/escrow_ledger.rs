//! Escrow Ledger - Owns the PaymentRecord lifecycle
//!
//! Payments are created directly in ESCROW against a fundable engagement and
//! then move exactly once along ESCROW -> RELEASED | REFUNDED, or through
//! ESCROW -> DISPUTED -> RELEASED | REFUNDED under moderation. Every
//! transition is a check-and-set performed while holding the write guard of
//! the payment map, so concurrent callers on the same record observe a
//! single winner.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engagement::{EngagementDirectory, EngagementRef},
    error::{EscrowError, StateError, ValidationError},
    events::{DomainEvent, EventPublisher},
    models::{Identity, PaymentRecord, PaymentStatus},
    policy::{self, Action, Resource},
    EscrowResult,
};

/// Longest dispute reason accepted
const MAX_DISPUTE_REASON_CHARS: usize = 500;

/// Configuration for the escrow ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowLedgerConfig {
    /// Settlement currency recorded on every payment
    pub currency: String,
    /// Maximum amount a single escrow may lock
    pub max_amount: Decimal,
}

impl Default for EscrowLedgerConfig {
    fn default() -> Self {
        Self {
            currency: "USDC".to_string(),
            max_amount: Decimal::from(1_000_000),
        }
    }
}

/// Outcome chosen by a moderator for a disputed payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Release,
    Refund,
}

impl Resolution {
    fn target(&self) -> PaymentStatus {
        match self {
            Self::Release => PaymentStatus::Released,
            Self::Refund => PaymentStatus::Refunded,
        }
    }
}

/// Payment ledger
pub struct EscrowLedger {
    config: EscrowLedgerConfig,
    /// Payment records by id
    payments: Arc<RwLock<HashMap<Uuid, PaymentRecord>>>,
    /// Marketplace lookup for payee and fundable state
    engagements: Arc<dyn EngagementDirectory>,
    events: Arc<EventPublisher>,
}

impl EscrowLedger {
    pub fn new(
        config: EscrowLedgerConfig,
        engagements: Arc<dyn EngagementDirectory>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            payments: Arc::new(RwLock::new(HashMap::new())),
            engagements,
            events,
        }
    }

    pub fn config(&self) -> &EscrowLedgerConfig {
        &self.config
    }

    /// Lock `amount` against an engagement on behalf of `payer`
    pub async fn create_escrow(
        &self,
        payer: &Identity,
        amount: Decimal,
        reference: EngagementRef,
    ) -> EscrowResult<PaymentRecord> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount).into());
        }
        if amount > self.config.max_amount {
            return Err(ValidationError::AmountTooLarge {
                amount,
                max: self.config.max_amount,
            }
            .into());
        }

        let engagement = self
            .engagements
            .resolve(&reference)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("Engagement {}", reference)))?;

        if engagement.payee_id == payer.account_id {
            return Err(ValidationError::SelfPayment.into());
        }
        if !engagement.is_fundable() {
            return Err(ValidationError::NotFundable(reference.to_string()).into());
        }
        policy::ensure(payer, Action::FundEscrow, Resource::Engagement(&engagement))?;

        let record = PaymentRecord::escrowed(
            payer.account_id,
            engagement.payee_id,
            reference,
            amount,
            self.config.currency.clone(),
        );
        self.payments
            .write()
            .await
            .insert(record.id, record.clone());

        info!(
            payment_id = %record.id,
            payer_id = %record.payer_id,
            payee_id = %record.payee_id,
            amount = %record.amount,
            engagement = %reference,
            "Created escrow"
        );

        self.events
            .publish(DomainEvent::EscrowCreated {
                payment_id: record.id,
                payer_id: record.payer_id,
                payee_id: record.payee_id,
                amount: record.amount,
                currency: record.currency.clone(),
            })
            .await;

        Ok(record)
    }

    /// ESCROW -> RELEASED. The amount becomes part of the payee's balance.
    pub async fn release_escrow(
        &self,
        payment_id: Uuid,
        actor: &Identity,
    ) -> EscrowResult<PaymentRecord> {
        let record = self
            .transition(payment_id, actor, Action::ReleaseEscrow, PaymentStatus::Released, |_| {})
            .await?;
        info!(payment_id = %payment_id, actor = %actor.account_id, "Released escrow");

        self.events
            .publish(DomainEvent::EscrowReleased {
                payment_id,
                payer_id: record.payer_id,
                payee_id: record.payee_id,
                amount: record.amount,
            })
            .await;
        Ok(record)
    }

    /// ESCROW -> REFUNDED
    pub async fn refund_escrow(
        &self,
        payment_id: Uuid,
        actor: &Identity,
    ) -> EscrowResult<PaymentRecord> {
        let record = self
            .transition(payment_id, actor, Action::RefundEscrow, PaymentStatus::Refunded, |_| {})
            .await?;
        info!(payment_id = %payment_id, actor = %actor.account_id, "Refunded escrow");

        self.events
            .publish(DomainEvent::EscrowRefunded {
                payment_id,
                payer_id: record.payer_id,
                payee_id: record.payee_id,
                amount: record.amount,
            })
            .await;
        Ok(record)
    }

    /// ESCROW -> DISPUTED. Frozen until a moderator resolves it.
    pub async fn dispute_escrow(
        &self,
        payment_id: Uuid,
        actor: &Identity,
        reason: &str,
    ) -> EscrowResult<PaymentRecord> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::InvalidReason("reason is empty".into()).into());
        }
        if reason.chars().count() > MAX_DISPUTE_REASON_CHARS {
            return Err(ValidationError::InvalidReason(format!(
                "reason exceeds {} characters",
                MAX_DISPUTE_REASON_CHARS
            ))
            .into());
        }

        let raised_by = actor.account_id;
        let record = self
            .transition(payment_id, actor, Action::DisputeEscrow, PaymentStatus::Disputed, |r| {
                r.dispute_reason = Some(reason.to_string());
                r.disputed_by = Some(raised_by);
                r.disputed_at = Some(Utc::now());
            })
            .await?;
        warn!(payment_id = %payment_id, raised_by = %raised_by, "Escrow disputed");

        self.events
            .publish(DomainEvent::EscrowDisputed {
                payment_id,
                payer_id: record.payer_id,
                payee_id: record.payee_id,
                raised_by,
                amount: record.amount,
                reason: reason.to_string(),
            })
            .await;
        Ok(record)
    }

    /// DISPUTED -> RELEASED | REFUNDED, moderators only
    pub async fn resolve_dispute(
        &self,
        payment_id: Uuid,
        moderator: &Identity,
        resolution: Resolution,
    ) -> EscrowResult<PaymentRecord> {
        let record = self
            .transition(payment_id, moderator, Action::ResolveDispute, resolution.target(), |_| {})
            .await?;
        info!(
            payment_id = %payment_id,
            moderator = %moderator.account_id,
            ?resolution,
            "Resolved dispute"
        );

        self.events
            .publish(DomainEvent::DisputeResolved {
                payment_id,
                payer_id: record.payer_id,
                payee_id: record.payee_id,
                resolved_by: moderator.account_id,
                amount: record.amount,
                resolution,
            })
            .await;
        Ok(record)
    }

    /// Get a payment record by id
    pub async fn get(&self, payment_id: Uuid) -> EscrowResult<PaymentRecord> {
        self.payments
            .read()
            .await
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Payment {}", payment_id)))
    }

    /// Payments where the account is payer or payee, oldest first
    pub async fn payments_for(&self, account_id: Uuid) -> Vec<PaymentRecord> {
        let mut records: Vec<PaymentRecord> = self
            .payments
            .read()
            .await
            .values()
            .filter(|r| r.involves(account_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Sum of RELEASED amounts paid to `payee_id`, replayed from every record
    pub async fn released_total(&self, payee_id: Uuid) -> Decimal {
        self.payments
            .read()
            .await
            .values()
            .filter(|r| r.payee_id == payee_id && r.status == PaymentStatus::Released)
            .map(|r| r.amount)
            .sum()
    }

    /// Authorize and apply `to` as a single check-and-set under the write guard
    async fn transition<F>(
        &self,
        payment_id: Uuid,
        actor: &Identity,
        action: Action,
        to: PaymentStatus,
        apply: F,
    ) -> EscrowResult<PaymentRecord>
    where
        F: FnOnce(&mut PaymentRecord),
    {
        let moderated = action == Action::ResolveDispute;
        let mut payments = self.payments.write().await;
        let record = payments
            .get_mut(&payment_id)
            .ok_or_else(|| EscrowError::not_found(format!("Payment {}", payment_id)))?;

        policy::ensure(actor, action, Resource::Payment(&*record))?;

        let from = record.status;
        if from.is_terminal() {
            return Err(StateError::AlreadyProcessed {
                payment_id,
                status: from,
            }
            .into());
        }
        if !from.can_transition(to, moderated) {
            return Err(StateError::InvalidTransition { payment_id, from, to }.into());
        }

        let now = Utc::now();
        record.status = to;
        record.updated_at = now;
        if to.is_terminal() {
            record.settled_at = Some(now);
        }
        apply(record);

        Ok(record.clone())
    }
}
