//! Wallet-authenticated escrow core for a freelance marketplace
//!
//! This crate implements the money-moving part of the marketplace:
//! - ed25519 wallet signatures as the sign-in primitive
//! - stateless HS256 sessions bound to a verified wallet
//! - an escrow ledger whose payments settle exactly once
//! - balances derived by replaying the ledger, never cached
//! - withdrawals serialized per account and handed to an external transfer service

pub mod balance;
pub mod engagement;
pub mod error;
pub mod escrow_ledger;
pub mod events;
pub mod identity;
pub mod models;
pub mod node;
pub mod policy;
pub mod rate_limit;
pub mod session;
pub mod settings;
pub mod transfer;
pub mod wallet;
pub mod withdrawal;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
