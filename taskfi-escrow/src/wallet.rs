//! Wallet transaction store
//!
//! WalletTransactions are created PENDING by the withdrawal authorizer and
//! resolved exactly once to COMPLETED or FAILED.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{EscrowError, StateError},
    models::{TransactionStatus, WalletTransaction},
    EscrowResult,
};

/// Withdrawal totals for one account, replayed from its transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WithdrawalTotals {
    pub completed: Decimal,
    pub pending: Decimal,
}

/// Final state written by `resolve`
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub failure_reason: Option<String>,
}

impl Settlement {
    pub fn completed(external_ref: Option<String>) -> Self {
        Self {
            status: TransactionStatus::Completed,
            external_ref,
            failure_reason: None,
        }
    }

    pub fn failed<S: Into<String>>(reason: S) -> Self {
        Self {
            status: TransactionStatus::Failed,
            external_ref: None,
            failure_reason: Some(reason.into()),
        }
    }
}

#[derive(Default)]
pub struct WalletStore {
    transactions: Arc<RwLock<HashMap<Uuid, WalletTransaction>>>,
}

impl WalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, transaction: WalletTransaction) {
        self.transactions
            .write()
            .await
            .insert(transaction.id, transaction);
    }

    pub async fn get(&self, transaction_id: Uuid) -> EscrowResult<WalletTransaction> {
        self.transactions
            .read()
            .await
            .get(&transaction_id)
            .cloned()
            .ok_or_else(|| EscrowError::not_found(format!("Transaction {}", transaction_id)))
    }

    /// Attach an external reference to a transaction that is still PENDING
    pub async fn note_external_ref(&self, transaction_id: Uuid, external_ref: String) {
        if let Some(tx) = self.transactions.write().await.get_mut(&transaction_id) {
            if tx.status == TransactionStatus::Pending {
                tx.metadata.external_ref = Some(external_ref);
            }
        }
    }

    /// PENDING -> COMPLETED | FAILED as a single check-and-set
    pub async fn resolve(
        &self,
        transaction_id: Uuid,
        settlement: Settlement,
    ) -> EscrowResult<WalletTransaction> {
        if !settlement.status.is_terminal() {
            return Err(EscrowError::internal("settlement status must be terminal"));
        }

        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| EscrowError::not_found(format!("Transaction {}", transaction_id)))?;

        if tx.status != TransactionStatus::Pending {
            return Err(StateError::TransactionResolved {
                transaction_id,
                status: tx.status,
            }
            .into());
        }

        tx.status = settlement.status;
        if settlement.external_ref.is_some() {
            tx.metadata.external_ref = settlement.external_ref;
        }
        tx.metadata.failure_reason = settlement.failure_reason;
        tx.metadata.resolved_at = Some(Utc::now());

        Ok(tx.clone())
    }

    /// Transactions of an account, oldest first
    pub async fn list_for(&self, account_id: Uuid) -> Vec<WalletTransaction> {
        let mut list: Vec<WalletTransaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect();
        list.sort_by_key(|tx| tx.metadata.requested_at);
        list
    }

    pub async fn withdrawal_totals(&self, account_id: Uuid) -> WithdrawalTotals {
        self.transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.account_id == account_id && tx.is_withdrawal())
            .fold(WithdrawalTotals::default(), |mut totals, tx| {
                match tx.status {
                    TransactionStatus::Completed => totals.completed += tx.amount,
                    TransactionStatus::Pending => totals.pending += tx.amount,
                    TransactionStatus::Failed => {}
                }
                totals
            })
    }
}
