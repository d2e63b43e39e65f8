//! Authorization capability check
//!
//! Every ledger and wallet entry point asks `can_perform` before mutating
//! anything, so the role and ownership rules live in one place.

use uuid::Uuid;

use crate::{
    engagement::Engagement,
    error::EscrowError,
    models::{Identity, PaymentRecord, Role},
    EscrowResult,
};

/// Actions guarded by the capability check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    FundEscrow,
    ReleaseEscrow,
    RefundEscrow,
    DisputeEscrow,
    ResolveDispute,
    Withdraw,
    ReconcileWithdrawal,
    ViewBalance,
    ViewPayment,
}

/// Resource an action is performed on
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Engagement(&'a Engagement),
    Payment(&'a PaymentRecord),
    Account(Uuid),
}

/// Decide whether `actor` may perform `action` on `resource`
pub fn can_perform(actor: &Identity, action: Action, resource: Resource<'_>) -> bool {
    let moderator = actor.role.is_moderator();
    let me = actor.account_id;

    match (action, resource) {
        (Action::FundEscrow, Resource::Engagement(engagement)) => {
            actor.role == Role::Hirer && engagement.client_id == me
        }
        (Action::ReleaseEscrow, Resource::Payment(payment))
        | (Action::RefundEscrow, Resource::Payment(payment)) => {
            moderator || payment.payer_id == me
        }
        (Action::DisputeEscrow, Resource::Payment(payment))
        | (Action::ViewPayment, Resource::Payment(payment)) => moderator || payment.involves(me),
        (Action::ResolveDispute, Resource::Payment(_)) => moderator,
        (Action::ReconcileWithdrawal, Resource::Account(_)) => moderator,
        (Action::Withdraw, Resource::Account(owner)) => owner == me,
        (Action::ViewBalance, Resource::Account(owner)) => moderator || owner == me,
        _ => false,
    }
}

/// `can_perform` as a `Result`, for use with `?`
pub fn ensure(actor: &Identity, action: Action, resource: Resource<'_>) -> EscrowResult<()> {
    if can_perform(actor, action, resource) {
        Ok(())
    } else {
        Err(EscrowError::authorization(format!(
            "{} {} may not perform {:?}",
            actor.role.as_str(),
            actor.account_id,
            action
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engagement::{EngagementRef, EngagementState},
        identity::WalletAddress,
    };
    use rust_decimal::Decimal;

    fn identity(role: Role) -> Identity {
        Identity {
            account_id: Uuid::new_v4(),
            wallet_address: WalletAddress::parse(&"ab".repeat(32)).unwrap(),
            role,
        }
    }

    fn payment(payer: &Identity, payee: &Identity) -> PaymentRecord {
        PaymentRecord::escrowed(
            payer.account_id,
            payee.account_id,
            EngagementRef::Job(Uuid::new_v4()),
            Decimal::from(100),
            "USDC".to_string(),
        )
    }

    #[test]
    fn test_funding_requires_owning_hirer() {
        let hirer = identity(Role::Hirer);
        let freelancer = identity(Role::Freelancer);
        let engagement = Engagement {
            reference: EngagementRef::Job(Uuid::new_v4()),
            client_id: hirer.account_id,
            payee_id: freelancer.account_id,
            state: EngagementState::Open,
        };

        assert!(can_perform(&hirer, Action::FundEscrow, Resource::Engagement(&engagement)));
        assert!(!can_perform(&freelancer, Action::FundEscrow, Resource::Engagement(&engagement)));
        assert!(!can_perform(
            &identity(Role::Hirer),
            Action::FundEscrow,
            Resource::Engagement(&engagement)
        ));
    }

    #[test]
    fn test_payment_actions() {
        let hirer = identity(Role::Hirer);
        let freelancer = identity(Role::Freelancer);
        let admin = identity(Role::Admin);
        let stranger = identity(Role::Hirer);
        let record = payment(&hirer, &freelancer);
        let res = Resource::Payment(&record);

        assert!(can_perform(&hirer, Action::ReleaseEscrow, res));
        assert!(can_perform(&admin, Action::ReleaseEscrow, res));
        assert!(!can_perform(&freelancer, Action::ReleaseEscrow, res));

        assert!(can_perform(&hirer, Action::RefundEscrow, res));
        assert!(!can_perform(&freelancer, Action::RefundEscrow, res));
        assert!(!can_perform(&stranger, Action::RefundEscrow, res));

        assert!(can_perform(&hirer, Action::DisputeEscrow, res));
        assert!(can_perform(&freelancer, Action::DisputeEscrow, res));
        assert!(!can_perform(&stranger, Action::DisputeEscrow, res));

        assert!(can_perform(&freelancer, Action::ViewPayment, res));
        assert!(can_perform(&admin, Action::ViewPayment, res));
        assert!(!can_perform(&stranger, Action::ViewPayment, res));

        assert!(can_perform(&admin, Action::ResolveDispute, res));
        assert!(!can_perform(&hirer, Action::ResolveDispute, res));
        assert!(!can_perform(&freelancer, Action::ResolveDispute, res));
    }

    #[test]
    fn test_account_actions() {
        let owner = identity(Role::Freelancer);
        let admin = identity(Role::Admin);
        let other = identity(Role::Freelancer);
        let account = Resource::Account(owner.account_id);

        assert!(can_perform(&owner, Action::Withdraw, account));
        assert!(!can_perform(&admin, Action::Withdraw, account));
        assert!(!can_perform(&other, Action::Withdraw, account));

        assert!(can_perform(&owner, Action::ViewBalance, account));
        assert!(can_perform(&admin, Action::ViewBalance, account));
        assert!(!can_perform(&other, Action::ViewBalance, account));

        assert!(can_perform(&admin, Action::ReconcileWithdrawal, account));
        assert!(!can_perform(&owner, Action::ReconcileWithdrawal, account));

        let err = ensure(&other, Action::Withdraw, account).unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn test_mismatched_resource_is_denied() {
        let admin = identity(Role::Admin);
        assert!(!can_perform(&admin, Action::ResolveDispute, Resource::Account(admin.account_id)));
    }
}
