//! Error types for the marketplace core
//!
//! Every failure surfaces as an `EscrowError` carrying a stable machine code,
//! so callers can branch on `code()` instead of matching display strings.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PaymentStatus, TransactionStatus};

/// Main error type for marketplace operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad, expired or malformed signed message, or an invalid session
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// Role or ownership mismatch for a ledger action
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Input rejected before touching any state
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid or already-consumed transition
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Withdrawal larger than the derived balance
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    /// External transfer collaborator errors
    #[error("External transfer error: {0}")]
    ExternalTransfer(#[from] TransferError),

    /// Uniqueness violations at account creation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown account, payment, engagement or transaction
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while proving wallet ownership or validating a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed sign-in message: {0}")]
    MalformedMessage(String),

    #[error("message declares wallet {declared} but caller claims {claimed}")]
    AddressMismatch { claimed: String, declared: String },

    #[error("message is bound to domain {found}, expected {expected}")]
    DomainMismatch { expected: String, found: String },

    #[error("message expired: {age_secs}s old, window is {window_secs}s")]
    ExpiredMessage { age_secs: i64, window_secs: i64 },

    #[error("message issued {ahead_secs}s in the future")]
    IssuedInFuture { ahead_secs: i64 },

    #[error("signature does not match message and wallet")]
    InvalidSignature,

    #[error("nonce {0} was already used for this wallet")]
    ReplayedNonce(String),

    #[error("too many sign-in attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid session: {0}")]
    InvalidSession(String),
}

/// Input validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("amount {amount} exceeds maximum {max}")]
    AmountTooLarge { amount: Decimal, max: Decimal },

    #[error("invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("payer and payee are the same account")]
    SelfPayment,

    #[error("engagement {0} is not in a fundable state")]
    NotFundable(String),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("invalid dispute reason: {0}")]
    InvalidReason(String),
}

/// Ledger state machine violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("payment {payment_id} already processed ({status:?})")]
    AlreadyProcessed {
        payment_id: Uuid,
        status: PaymentStatus,
    },

    #[error("invalid transition {from:?} -> {to:?} for payment {payment_id}")]
    InvalidTransition {
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("wallet transaction {transaction_id} already resolved ({status:?})")]
    TransactionResolved {
        transaction_id: Uuid,
        status: TransactionStatus,
    },
}

/// External transfer failures. Timeouts and unavailability are ambiguous
/// (the withdrawal stays PENDING), rejections are terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer for {transaction_id} timed out after {after_ms}ms")]
    Timeout { transaction_id: Uuid, after_ms: u64 },

    #[error("transfer service unavailable: {0}")]
    Unavailable(String),

    #[error("transfer rejected: {0}")]
    Rejected(String),
}

impl EscrowError {
    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(e) => match e {
                AuthError::MalformedMessage(_) => "MALFORMED_MESSAGE",
                AuthError::AddressMismatch { .. } => "ADDRESS_MISMATCH",
                AuthError::DomainMismatch { .. } => "DOMAIN_MISMATCH",
                AuthError::ExpiredMessage { .. } => "EXPIRED_MESSAGE",
                AuthError::IssuedInFuture { .. } => "ISSUED_IN_FUTURE",
                AuthError::InvalidSignature => "INVALID_SIGNATURE",
                AuthError::ReplayedNonce(_) => "REPLAYED_NONCE",
                AuthError::RateLimited { .. } => "RATE_LIMITED",
                AuthError::InvalidSession(_) => "INVALID_SESSION",
            },
            Self::Authorization(_) => "FORBIDDEN",
            Self::Validation(e) => match e {
                ValidationError::NonPositiveAmount(_) => "NON_POSITIVE_AMOUNT",
                ValidationError::AmountTooLarge { .. } => "AMOUNT_TOO_LARGE",
                ValidationError::InvalidDestination(_) => "INVALID_DESTINATION",
                ValidationError::InvalidAddress(_) => "INVALID_ADDRESS",
                ValidationError::SelfPayment => "SELF_PAYMENT",
                ValidationError::NotFundable(_) => "NOT_FUNDABLE",
                ValidationError::InvalidUsername(_) => "INVALID_USERNAME",
                ValidationError::InvalidReason(_) => "INVALID_REASON",
            },
            Self::State(e) => match e {
                StateError::AlreadyProcessed { .. } => "ALREADY_PROCESSED",
                StateError::InvalidTransition { .. } => "INVALID_TRANSITION",
                StateError::TransactionResolved { .. } => "TRANSACTION_RESOLVED",
            },
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::ExternalTransfer(e) => match e {
                TransferError::Timeout { .. } => "TRANSFER_TIMEOUT",
                TransferError::Unavailable(_) => "TRANSFER_UNAVAILABLE",
                TransferError::Rejected(_) => "TRANSFER_REJECTED",
            },
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the same request may succeed later without changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Authentication(AuthError::RateLimited { .. })
                | Self::ExternalTransfer(TransferError::Timeout { .. })
                | Self::ExternalTransfer(TransferError::Unavailable(_))
        )
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
