//! Withdrawal Authorizer - Moves derived balance out to a wallet
//!
//! A withdrawal runs in three phases:
//! 1. under the per-account lock, check the request against the available
//!    balance and record a PENDING transaction;
//! 2. with no lock held, ask the transfer collaborator, bounded by a timeout;
//! 3. resolve the transaction with a PENDING -> terminal check-and-set.
//!
//! Ambiguous outcomes (timeout, unreachable collaborator, pending transfer)
//! leave the transaction PENDING for reconciliation. PENDING amounts are
//! subtracted from the available balance, so they cannot be spent twice.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    balance::BalanceCalculator,
    error::{EscrowError, StateError, TransferError, ValidationError},
    events::{DomainEvent, EventPublisher},
    identity::WalletAddress,
    models::{Identity, TransactionStatus, WalletTransaction},
    policy::{self, Action, Resource},
    transfer::{TransferOutcome, TransferService},
    wallet::{Settlement, WalletStore},
    EscrowResult,
};

/// Configuration for the withdrawal authorizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalConfig {
    /// Upper bound on a single transfer call
    pub transfer_timeout_ms: u64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 10_000,
        }
    }
}

pub struct WithdrawalAuthorizer {
    config: WithdrawalConfig,
    balances: Arc<BalanceCalculator>,
    wallet: Arc<WalletStore>,
    transfers: Arc<dyn TransferService>,
    events: Arc<EventPublisher>,
    /// Serializes the balance check and PENDING insert per account
    account_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WithdrawalAuthorizer {
    pub fn new(
        config: WithdrawalConfig,
        balances: Arc<BalanceCalculator>,
        wallet: Arc<WalletStore>,
        transfers: Arc<dyn TransferService>,
        events: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            balances,
            wallet,
            transfers,
            events,
            account_locks: DashMap::new(),
        }
    }

    fn account_lock(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        self.account_locks.entry(account_id).or_default().clone()
    }

    /// Drop the account's lock entry once no request holds or awaits it.
    /// Clones are taken under the same shard lock, so a count of one is final.
    fn release_account_lock(&self, account_id: Uuid) {
        self.account_locks
            .remove_if(&account_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Check `amount` against the available balance and record it PENDING.
    /// Callers hold the account lock.
    async fn reserve(
        &self,
        account_id: Uuid,
        amount: Decimal,
        destination: &WalletAddress,
    ) -> EscrowResult<WalletTransaction> {
        let sheet = self.balances.balance_sheet(account_id).await;
        if amount > sheet.available {
            warn!(
                account_id = %account_id,
                requested = %amount,
                available = %sheet.available,
                "Withdrawal exceeds available balance"
            );
            return Err(EscrowError::InsufficientFunds {
                requested: amount,
                available: sheet.available,
            });
        }

        let transaction =
            WalletTransaction::pending_withdrawal(account_id, amount, destination.clone());
        self.wallet.insert(transaction.clone()).await;
        Ok(transaction)
    }

    /// Withdraw `amount` from `account_id` to `destination`
    pub async fn request_withdrawal(
        &self,
        actor: &Identity,
        account_id: Uuid,
        amount: Decimal,
        destination: &str,
    ) -> EscrowResult<WalletTransaction> {
        policy::ensure(actor, Action::Withdraw, Resource::Account(account_id))?;
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount).into());
        }
        let destination = WalletAddress::parse(destination)
            .map_err(|_| ValidationError::InvalidDestination(destination.to_string()))?;

        let reserved = {
            let lock = self.account_lock(account_id);
            let reserved = {
                let _guard = lock.lock().await;
                self.reserve(account_id, amount, &destination).await
            };
            drop(lock);
            self.release_account_lock(account_id);
            reserved
        };
        let transaction = reserved?;
        info!(
            transaction_id = %transaction.id,
            account_id = %account_id,
            %amount,
            "Withdrawal pending"
        );

        let timeout = Duration::from_millis(self.config.transfer_timeout_ms);
        let outcome =
            match tokio::time::timeout(timeout, self.transfers.transfer(&destination, amount)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        transaction_id = %transaction.id,
                        "Transfer timed out, withdrawal left pending"
                    );
                    return Err(TransferError::Timeout {
                        transaction_id: transaction.id,
                        after_ms: self.config.transfer_timeout_ms,
                    }
                    .into());
                }
            };

        match outcome {
            Ok(TransferOutcome::Success { external_ref }) => {
                self.settle(transaction.id, Settlement::completed(Some(external_ref)))
                    .await
            }
            Ok(TransferOutcome::Pending { external_ref }) => {
                if let Some(external_ref) = external_ref {
                    self.wallet.note_external_ref(transaction.id, external_ref).await;
                }
                info!(transaction_id = %transaction.id, "Transfer accepted, awaiting confirmation");
                self.wallet.get(transaction.id).await
            }
            Ok(TransferOutcome::Failure { reason }) => {
                self.settle(transaction.id, Settlement::failed(reason.clone()))
                    .await?;
                Err(TransferError::Rejected(reason).into())
            }
            Err(TransferError::Rejected(reason)) => {
                self.settle(transaction.id, Settlement::failed(reason.clone()))
                    .await?;
                Err(TransferError::Rejected(reason).into())
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Transfer outcome unknown, withdrawal left pending"
                );
                Err(e.into())
            }
        }
    }

    /// Resolve a PENDING withdrawal from an externally confirmed outcome
    pub async fn reconcile_withdrawal(
        &self,
        transaction_id: Uuid,
        moderator: &Identity,
        outcome: TransferOutcome,
    ) -> EscrowResult<WalletTransaction> {
        let transaction = self.wallet.get(transaction_id).await?;
        policy::ensure(
            moderator,
            Action::ReconcileWithdrawal,
            Resource::Account(transaction.account_id),
        )?;

        match outcome {
            TransferOutcome::Success { external_ref } => {
                self.settle(transaction_id, Settlement::completed(Some(external_ref)))
                    .await
            }
            TransferOutcome::Failure { reason } => {
                self.settle(transaction_id, Settlement::failed(reason)).await
            }
            TransferOutcome::Pending { external_ref } => {
                if transaction.status != TransactionStatus::Pending {
                    return Err(StateError::TransactionResolved {
                        transaction_id,
                        status: transaction.status,
                    }
                    .into());
                }
                if let Some(external_ref) = external_ref {
                    self.wallet.note_external_ref(transaction_id, external_ref).await;
                }
                self.wallet.get(transaction_id).await
            }
        }
    }

    /// Wallet transactions of an account
    pub async fn transactions_for(
        &self,
        actor: &Identity,
        account_id: Uuid,
    ) -> EscrowResult<Vec<WalletTransaction>> {
        policy::ensure(actor, Action::ViewBalance, Resource::Account(account_id))?;
        Ok(self.wallet.list_for(account_id).await)
    }

    async fn settle(
        &self,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> EscrowResult<WalletTransaction> {
        let tx = self.wallet.resolve(transaction_id, settlement).await?;

        let event = match tx.status {
            TransactionStatus::Completed => {
                info!(transaction_id = %tx.id, account_id = %tx.account_id, amount = %tx.amount, "Withdrawal completed");
                DomainEvent::WithdrawalCompleted {
                    transaction_id: tx.id,
                    account_id: tx.account_id,
                    amount: tx.amount,
                }
            }
            _ => {
                let reason = tx.metadata.failure_reason.clone().unwrap_or_default();
                warn!(transaction_id = %tx.id, account_id = %tx.account_id, %reason, "Withdrawal failed");
                DomainEvent::WithdrawalFailed {
                    transaction_id: tx.id,
                    account_id: tx.account_id,
                    amount: tx.amount,
                    reason,
                }
            }
        };
        self.events.publish(event).await;

        Ok(tx)
    }
}
