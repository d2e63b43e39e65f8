//! Engagements - Jobs and gigs that escrow payments are funded against
//!
//! The marketplace data layer owns engagements; the core only needs to know
//! who the client and payee are and whether the engagement can be funded.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::EscrowResult;

/// Reference to a job or gig engagement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EngagementRef {
    Job(Uuid),
    Gig(Uuid),
}

impl fmt::Display for EngagementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{}", id),
            Self::Gig(id) => write!(f, "gig:{}", id),
        }
    }
}

/// Lifecycle state reported by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementState {
    Open,
    InProgress,
    Active,
    Completed,
    Cancelled,
}

/// Engagement as seen by the escrow core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engagement {
    pub reference: EngagementRef,
    /// Hirer who commissions the work and funds the escrow
    pub client_id: Uuid,
    /// Account credited when the escrow is released
    pub payee_id: Uuid,
    pub state: EngagementState,
}

impl Engagement {
    /// Jobs are fundable while open or in progress, gigs while active
    pub fn is_fundable(&self) -> bool {
        match self.reference {
            EngagementRef::Job(_) => matches!(
                self.state,
                EngagementState::Open | EngagementState::InProgress
            ),
            EngagementRef::Gig(_) => self.state == EngagementState::Active,
        }
    }
}

/// Lookup of engagements in the marketplace data layer
#[async_trait]
pub trait EngagementDirectory: Send + Sync {
    async fn resolve(&self, reference: &EngagementRef) -> EscrowResult<Option<Engagement>>;
}

/// In-memory engagement directory
#[derive(Default)]
pub struct InMemoryEngagements {
    engagements: Arc<RwLock<HashMap<EngagementRef, Engagement>>>,
}

impl InMemoryEngagements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an engagement
    pub async fn upsert(&self, engagement: Engagement) {
        self.engagements
            .write()
            .await
            .insert(engagement.reference, engagement);
    }

    /// Update the state of a known engagement; returns false when unknown
    pub async fn set_state(&self, reference: &EngagementRef, state: EngagementState) -> bool {
        match self.engagements.write().await.get_mut(reference) {
            Some(engagement) => {
                engagement.state = state;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl EngagementDirectory for InMemoryEngagements {
    async fn resolve(&self, reference: &EngagementRef) -> EscrowResult<Option<Engagement>> {
        Ok(self.engagements.read().await.get(reference).cloned())
    }
}
