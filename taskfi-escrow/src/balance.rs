//! Balance Calculator - Derives spendable balances from ledger truth
//!
//! Nothing here is cached. Every call replays the payment records and wallet
//! transactions of the account.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{escrow_ledger::EscrowLedger, wallet::WalletStore};

/// Breakdown of an account's derived balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSheet {
    /// Sum of RELEASED payments to the account
    pub released: Decimal,
    /// Sum of COMPLETED withdrawals
    pub withdrawn: Decimal,
    /// Sum of withdrawals still awaiting the transfer collaborator
    pub pending: Decimal,
    /// released - withdrawn, floored at zero
    pub balance: Decimal,
    /// balance - pending, floored at zero
    pub available: Decimal,
}

pub struct BalanceCalculator {
    ledger: Arc<EscrowLedger>,
    wallet: Arc<WalletStore>,
}

impl BalanceCalculator {
    pub fn new(ledger: Arc<EscrowLedger>, wallet: Arc<WalletStore>) -> Self {
        Self { ledger, wallet }
    }

    /// Released payments minus completed withdrawals, floored at zero
    pub async fn compute_balance(&self, account_id: Uuid) -> Decimal {
        self.balance_sheet(account_id).await.balance
    }

    pub async fn balance_sheet(&self, account_id: Uuid) -> BalanceSheet {
        let released = self.ledger.released_total(account_id).await;
        let totals = self.wallet.withdrawal_totals(account_id).await;

        let balance = (released - totals.completed).max(Decimal::ZERO);
        let available = (balance - totals.pending).max(Decimal::ZERO);
        debug!(
            account_id = %account_id,
            %released,
            withdrawn = %totals.completed,
            pending = %totals.pending,
            %balance,
            "Computed balance"
        );

        BalanceSheet {
            released,
            withdrawn: totals.completed,
            pending: totals.pending,
            balance,
            available,
        }
    }
}
