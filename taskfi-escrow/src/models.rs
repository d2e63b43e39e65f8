//! Core data models for the marketplace core
//!
//! Accounts, escrowed payments and wallet transactions, together with the
//! status state machines that guard every ledger mutation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engagement::EngagementRef;
use crate::identity::WalletAddress;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Freelancer,
    Hirer,
    /// Platform moderator
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Freelancer => "FREELANCER",
            Self::Hirer => "HIRER",
            Self::Admin => "ADMIN",
        }
    }

    pub fn is_moderator(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Identity record. Balance is never stored here; see `balance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub wallet_address: WalletAddress,
    pub username: String,
    pub role: Role,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(wallet_address: WalletAddress, username: String, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_address,
            username,
            role,
            verified: true,
            created_at: Utc::now(),
        }
    }
}

/// Authenticated caller, as carried by a validated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub account_id: Uuid,
    pub wallet_address: WalletAddress,
    pub role: Role,
}

impl From<&Account> for Identity {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            wallet_address: account.wallet_address.clone(),
            role: account.role,
        }
    }
}

/// Escrowed payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Reserved for rails that confirm funding asynchronously; records
    /// created by the ledger start in `Escrow`
    Pending,
    /// Funds locked against the engagement
    Escrow,
    /// Funds credited to the payee
    Released,
    /// Funds returned to the payer
    Refunded,
    /// Frozen until a moderator resolves it
    Disputed,
}

impl PaymentStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Whether `self -> to` is an edge of the payment state machine.
    /// `moderated` marks transitions performed through dispute resolution.
    pub fn can_transition(&self, to: PaymentStatus, moderated: bool) -> bool {
        match (self, to) {
            (Self::Pending, Self::Escrow) => true,
            (Self::Escrow, Self::Released) => !moderated,
            (Self::Escrow, Self::Refunded) => !moderated,
            (Self::Escrow, Self::Disputed) => !moderated,
            (Self::Disputed, Self::Released) => moderated,
            (Self::Disputed, Self::Refunded) => moderated,
            _ => false,
        }
    }
}

/// Payment held in escrow against an engagement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub payer_id: Uuid,
    /// Engagement the payee was resolved through
    pub engagement: EngagementRef,
    /// Payee resolved from the engagement when the escrow was created
    pub payee_id: Uuid,
    pub dispute_reason: Option<String>,
    pub disputed_by: Option<Uuid>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// Create a record with funds already locked
    pub fn escrowed(
        payer_id: Uuid,
        payee_id: Uuid,
        engagement: EngagementRef,
        amount: Decimal,
        currency: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: PaymentStatus::Escrow,
            amount,
            currency,
            payer_id,
            engagement,
            payee_id,
            dispute_reason: None,
            disputed_by: None,
            disputed_at: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    pub fn involves(&self, account_id: Uuid) -> bool {
        self.payer_id == account_id || self.payee_id == account_id
    }
}

/// Wallet transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

/// Wallet transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Audit metadata attached to a wallet transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub destination: Option<WalletAddress>,
    pub external_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Auditable movement of funds out of (or into) an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub metadata: TransactionMetadata,
}

impl WalletTransaction {
    /// Create a PENDING withdrawal
    pub fn pending_withdrawal(
        account_id: Uuid,
        amount: Decimal,
        destination: WalletAddress,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            kind: TransactionType::Withdrawal,
            amount,
            status: TransactionStatus::Pending,
            metadata: TransactionMetadata {
                destination: Some(destination),
                requested_at: Some(Utc::now()),
                ..TransactionMetadata::default()
            },
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.kind == TransactionType::Withdrawal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_state_machine() {
        use PaymentStatus::*;

        assert!(Escrow.can_transition(Released, false));
        assert!(Escrow.can_transition(Refunded, false));
        assert!(Escrow.can_transition(Disputed, false));
        assert!(Disputed.can_transition(Released, true));
        assert!(Disputed.can_transition(Refunded, true));

        // Disputes only leave through moderation
        assert!(!Disputed.can_transition(Released, false));
        assert!(!Escrow.can_transition(Released, true));

        // Terminal states never move
        for to in [Pending, Escrow, Released, Refunded, Disputed] {
            assert!(!Released.can_transition(to, false));
            assert!(!Released.can_transition(to, true));
            assert!(!Refunded.can_transition(to, false));
            assert!(!Refunded.can_transition(to, true));
        }
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::Hirer).unwrap();
        assert_eq!(json, "\"HIRER\"");
        assert_eq!(Role::Admin.as_str(), "ADMIN");
        assert!(Role::Admin.is_moderator());
    }
}
