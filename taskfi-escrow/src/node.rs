//! Market Node - High-level API for the marketplace core
//!
//! Wires the identity verifier, session issuer, escrow ledger, balance
//! calculator and withdrawal authorizer together. Every ledger entry point
//! takes a session token and validates it to an `Identity` before
//! delegating.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::{
    balance::{BalanceCalculator, BalanceSheet},
    engagement::{EngagementDirectory, EngagementRef},
    escrow_ledger::{EscrowLedger, Resolution},
    events::EventPublisher,
    identity::{IdentityVerifier, VerifiedWallet, WalletAddress},
    models::{Account, Identity, PaymentRecord, Role, WalletTransaction},
    policy::{self, Action, Resource},
    rate_limit::RateLimiter,
    session::{AccountRegistry, Session, SessionIssuer, SignInOutcome},
    settings::Settings,
    transfer::{TransferOutcome, TransferService},
    wallet::WalletStore,
    withdrawal::WithdrawalAuthorizer,
    EscrowResult,
};

/// Main node that coordinates all components
pub struct MarketNode {
    sessions: Arc<SessionIssuer>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<EscrowLedger>,
    balances: Arc<BalanceCalculator>,
    withdrawals: Arc<WithdrawalAuthorizer>,
    events: Arc<EventPublisher>,
}

impl MarketNode {
    /// Create a node from settings and the external collaborators
    pub fn new(
        settings: Settings,
        engagements: Arc<dyn EngagementDirectory>,
        transfers: Arc<dyn TransferService>,
    ) -> EscrowResult<Self> {
        info!(domain = %settings.auth.domain, "Initializing market node");

        let events = Arc::new(EventPublisher::default());
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit));
        let sessions = Arc::new(SessionIssuer::new(
            settings.session,
            IdentityVerifier::new(settings.auth),
            Arc::new(AccountRegistry::new()),
            limiter.clone(),
        )?);

        let ledger = Arc::new(EscrowLedger::new(settings.ledger, engagements, events.clone()));
        let wallet = Arc::new(WalletStore::new());
        let balances = Arc::new(BalanceCalculator::new(ledger.clone(), wallet.clone()));
        let withdrawals = Arc::new(WithdrawalAuthorizer::new(
            settings.withdrawal,
            balances.clone(),
            wallet,
            transfers,
            events.clone(),
        ));

        info!("Market node initialized successfully");

        Ok(Self {
            sessions,
            limiter,
            ledger,
            balances,
            withdrawals,
            events,
        })
    }

    /// Start periodic maintenance (rate-limit sweeps)
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        self.limiter.spawn_sweeper()
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    pub fn sessions(&self) -> &Arc<SessionIssuer> {
        &self.sessions
    }

    /// Validate a session token
    pub fn authenticate(&self, token: &str) -> EscrowResult<Identity> {
        self.sessions.validate(token)
    }

    /// Prove wallet ownership with a signed message
    pub async fn sign_in(
        &self,
        wallet_address: &str,
        message: &str,
        signature: &str,
    ) -> EscrowResult<SignInOutcome> {
        self.sessions.sign_in(wallet_address, message, signature).await
    }

    /// Create the account for a freshly verified wallet
    pub async fn complete_profile(
        &self,
        wallet: VerifiedWallet,
        username: &str,
        role: Role,
    ) -> EscrowResult<Session> {
        self.sessions.complete_profile(wallet, username, role).await
    }

    /// Create a moderator account (operator tooling)
    pub async fn provision_moderator(
        &self,
        wallet: WalletAddress,
        username: &str,
    ) -> EscrowResult<Account> {
        self.sessions.provision_moderator(wallet, username).await
    }

    pub async fn refresh_session(&self, token: &str) -> EscrowResult<Session> {
        self.sessions.refresh(token).await
    }

    /// Fund an engagement
    pub async fn create_escrow(
        &self,
        token: &str,
        amount: Decimal,
        reference: EngagementRef,
    ) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        self.ledger.create_escrow(&actor, amount, reference).await
    }

    pub async fn release_escrow(&self, token: &str, payment_id: Uuid) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        self.ledger.release_escrow(payment_id, &actor).await
    }

    pub async fn refund_escrow(&self, token: &str, payment_id: Uuid) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        self.ledger.refund_escrow(payment_id, &actor).await
    }

    pub async fn dispute_escrow(
        &self,
        token: &str,
        payment_id: Uuid,
        reason: &str,
    ) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        self.ledger.dispute_escrow(payment_id, &actor, reason).await
    }

    pub async fn resolve_dispute(
        &self,
        token: &str,
        payment_id: Uuid,
        resolution: Resolution,
    ) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        self.ledger.resolve_dispute(payment_id, &actor, resolution).await
    }

    /// Get a payment the caller is party to
    pub async fn payment(&self, token: &str, payment_id: Uuid) -> EscrowResult<PaymentRecord> {
        let actor = self.authenticate(token)?;
        let record = self.ledger.get(payment_id).await?;
        policy::ensure(&actor, Action::ViewPayment, Resource::Payment(&record))?;
        Ok(record)
    }

    /// Payments of the caller, as payer or payee
    pub async fn my_payments(&self, token: &str) -> EscrowResult<Vec<PaymentRecord>> {
        let actor = self.authenticate(token)?;
        Ok(self.ledger.payments_for(actor.account_id).await)
    }

    /// Derived balance of `account_id`
    pub async fn balance(&self, token: &str, account_id: Uuid) -> EscrowResult<BalanceSheet> {
        let actor = self.authenticate(token)?;
        policy::ensure(&actor, Action::ViewBalance, Resource::Account(account_id))?;
        Ok(self.balances.balance_sheet(account_id).await)
    }

    /// Withdraw from the caller's own balance
    pub async fn request_withdrawal(
        &self,
        token: &str,
        amount: Decimal,
        destination: &str,
    ) -> EscrowResult<WalletTransaction> {
        let actor = self.authenticate(token)?;
        self.withdrawals
            .request_withdrawal(&actor, actor.account_id, amount, destination)
            .await
    }

    pub async fn reconcile_withdrawal(
        &self,
        token: &str,
        transaction_id: Uuid,
        outcome: TransferOutcome,
    ) -> EscrowResult<WalletTransaction> {
        let actor = self.authenticate(token)?;
        self.withdrawals
            .reconcile_withdrawal(transaction_id, &actor, outcome)
            .await
    }

    pub async fn transactions(
        &self,
        token: &str,
        account_id: Uuid,
    ) -> EscrowResult<Vec<WalletTransaction>> {
        let actor = self.authenticate(token)?;
        self.withdrawals.transactions_for(&actor, account_id).await
    }

    /// Health check for the node
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        if self.limiter.tracked() > 10_000 {
            issues.push("rate limiter tracking more than 10000 wallets".to_string());
        }

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            accounts: self.sessions.accounts().len().await,
            events_published: self.events.history().await.len(),
            issues,
            timestamp: Utc::now(),
        })
    }
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub accounts: usize,
    pub events_published: usize,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engagement::{Engagement, EngagementState, InMemoryEngagements},
        identity::SignedMessage,
        models::{PaymentStatus, TransactionStatus},
        transfer::SimulatedTransferService,
    };
    use ed25519_dalek::SigningKey;

    struct Harness {
        node: MarketNode,
        engagements: Arc<InMemoryEngagements>,
    }

    fn harness() -> Harness {
        let engagements = Arc::new(InMemoryEngagements::new());
        let node = MarketNode::new(
            Settings::default(),
            engagements.clone(),
            Arc::new(SimulatedTransferService::default()),
        )
        .unwrap();
        Harness { node, engagements }
    }

    /// Sign in a fresh wallet and register it
    async fn register(node: &MarketNode, seed: u8, username: &str, role: Role) -> Session {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let address = WalletAddress::from_verifying_key(&key.verifying_key());
        let message = SignedMessage::new("taskfi.app", &address, format!("nonce{:04}", seed), Utc::now());
        let signature = message.sign(&key);

        match node
            .sign_in(address.as_str(), &message.to_string(), &signature)
            .await
            .unwrap()
        {
            SignInOutcome::ProfileRequired(verified) => {
                node.complete_profile(verified, username, role).await.unwrap()
            }
            SignInOutcome::Authenticated(_) => panic!("wallet should be new"),
        }
    }

    #[tokio::test]
    async fn test_node_initialization() {
        let h = harness();
        let health = h.node.health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.accounts, 0);
    }

    #[tokio::test]
    async fn test_escrow_release_and_withdrawal_flow() {
        let h = harness();
        let hirer = register(&h.node, 1, "hirer_one", Role::Hirer).await;
        let freelancer = register(&h.node, 2, "freelancer_two", Role::Freelancer).await;
        let freelancer_id = freelancer.identity.account_id;

        let job = EngagementRef::Job(Uuid::new_v4());
        h.engagements
            .upsert(Engagement {
                reference: job,
                client_id: hirer.identity.account_id,
                payee_id: freelancer_id,
                state: EngagementState::Open,
            })
            .await;

        let payment = h
            .node
            .create_escrow(&hirer.token, Decimal::from(100), job)
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Escrow);

        let released = h.node.release_escrow(&hirer.token, payment.id).await.unwrap();
        assert_eq!(released.status, PaymentStatus::Released);

        let sheet = h.node.balance(&freelancer.token, freelancer_id).await.unwrap();
        assert_eq!(sheet.balance, Decimal::from(100));

        let destination = "9a".repeat(32);
        let tx = h
            .node
            .request_withdrawal(&freelancer.token, Decimal::from(40), &destination)
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        let sheet = h.node.balance(&freelancer.token, freelancer_id).await.unwrap();
        assert_eq!(sheet.balance, Decimal::from(60));

        let err = h
            .node
            .request_withdrawal(&freelancer.token, Decimal::from(70), &destination)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        let sheet = h.node.balance(&freelancer.token, freelancer_id).await.unwrap();
        assert_eq!(sheet.balance, Decimal::from(60));

        // The hirer cannot look at the freelancer's balance
        let err = h.node.balance(&hirer.token, freelancer_id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let kinds: Vec<_> = h
            .node
            .events()
            .history()
            .await
            .iter()
            .map(|r| r.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["escrow.created", "escrow.released", "withdrawal.completed"]
        );
    }

    #[tokio::test]
    async fn test_moderated_dispute() {
        let h = harness();
        let hirer = register(&h.node, 3, "hirer_three", Role::Hirer).await;
        let freelancer = register(&h.node, 4, "freelancer_four", Role::Freelancer).await;

        let admin_key = SigningKey::from_bytes(&[5; 32]);
        let admin_wallet = WalletAddress::from_verifying_key(&admin_key.verifying_key());
        let admin = h.node.provision_moderator(admin_wallet, "moderator").await.unwrap();
        let admin_token = h.node.sessions().issue(&admin).unwrap().token;

        let gig = EngagementRef::Gig(Uuid::new_v4());
        h.engagements
            .upsert(Engagement {
                reference: gig,
                client_id: hirer.identity.account_id,
                payee_id: freelancer.identity.account_id,
                state: EngagementState::Active,
            })
            .await;

        let payment = h
            .node
            .create_escrow(&hirer.token, Decimal::from(75), gig)
            .await
            .unwrap();
        h.node
            .dispute_escrow(&freelancer.token, payment.id, "client unresponsive")
            .await
            .unwrap();

        let err = h.node.refund_escrow(&hirer.token, payment.id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        let resolved = h
            .node
            .resolve_dispute(&admin_token, payment.id, Resolution::Refund)
            .await
            .unwrap();
        assert_eq!(resolved.status, PaymentStatus::Refunded);

        let sheet = h
            .node
            .balance(&admin_token, freelancer.identity.account_id)
            .await
            .unwrap();
        assert_eq!(sheet.balance, Decimal::ZERO);

        let seen = h.node.payment(&freelancer.token, payment.id).await.unwrap();
        assert_eq!(seen.dispute_reason.as_deref(), Some("client unresponsive"));
        assert_eq!(h.node.my_payments(&hirer.token).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let h = harness();
        let err = h
            .node
            .create_escrow("not-a-token", Decimal::ONE, EngagementRef::Job(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SESSION");
    }
}
