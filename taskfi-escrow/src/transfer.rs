//! External transfer collaborator
//!
//! The core never moves funds itself. It asks a transfer service to send an
//! amount to a destination wallet and records whatever it reports.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::TransferError, identity::WalletAddress};

/// What the collaborator reports for a transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Success { external_ref: String },
    /// Accepted but not yet final; reconciled later
    Pending { external_ref: Option<String> },
    Failure { reason: String },
}

#[async_trait]
pub trait TransferService: Send + Sync {
    async fn transfer(
        &self,
        destination: &WalletAddress,
        amount: Decimal,
    ) -> Result<TransferOutcome, TransferError>;
}

/// Configuration for the HTTP transfer client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfer endpoint; the simulator is used when unset
    pub endpoint: Option<String>,
    /// Bearer token sent with each request
    pub api_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    destination: &'a str,
    amount: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransferStatus {
    Success,
    Pending,
    Failure,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    status: TransferStatus,
    external_ref: Option<String>,
    reason: Option<String>,
}

impl TransferResponse {
    /// A success without a usable reference is kept pending, so the
    /// withdrawal can still be reconciled against a real reference.
    fn into_outcome(self) -> TransferOutcome {
        let external_ref = self.external_ref.filter(|r| !r.trim().is_empty());
        match (self.status, external_ref) {
            (TransferStatus::Success, Some(external_ref)) => {
                TransferOutcome::Success { external_ref }
            }
            (TransferStatus::Success, None) => {
                warn!("Transfer reported success without a reference");
                TransferOutcome::Pending { external_ref: None }
            }
            (TransferStatus::Pending, external_ref) => TransferOutcome::Pending { external_ref },
            (TransferStatus::Failure, _) => TransferOutcome::Failure {
                reason: self.reason.unwrap_or_else(|| "unspecified".to_string()),
            },
        }
    }
}

/// Transfer service reached over HTTP with a JSON POST
pub struct HttpTransferService {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpTransferService {
    pub fn new(endpoint: String, api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_token,
        }
    }

    /// Build from config; `None` when no endpoint is configured
    pub fn from_config(config: &TransferConfig) -> Option<Self> {
        config
            .endpoint
            .clone()
            .map(|endpoint| Self::new(endpoint, config.api_token.clone()))
    }
}

#[async_trait]
impl TransferService for HttpTransferService {
    async fn transfer(
        &self,
        destination: &WalletAddress,
        amount: Decimal,
    ) -> Result<TransferOutcome, TransferError> {
        let payload = TransferRequest {
            destination: destination.as_str(),
            amount: amount.to_string(),
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransferError::Unavailable(format!("transfer service returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Transfer request refused");
            return Err(TransferError::Rejected(format!("{}: {}", status, body)));
        }

        let body: TransferResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Unavailable(format!("unreadable response: {}", e)))?;
        debug!(status = ?body.status, external_ref = ?body.external_ref, "Transfer response");

        Ok(body.into_outcome())
    }
}

/// Scripted behaviour of the simulated transfer service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedMode {
    Succeed,
    Pend,
    Fail(String),
    Unavailable,
    /// Never answers
    Hang,
}

/// In-process transfer service for tests and local demos
pub struct SimulatedTransferService {
    mode: Mutex<SimulatedMode>,
    calls: AtomicUsize,
}

impl SimulatedTransferService {
    pub fn new(mode: SimulatedMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: SimulatedMode) {
        *self.mode.lock() = mode;
    }

    /// Number of transfer requests received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedTransferService {
    fn default() -> Self {
        Self::new(SimulatedMode::Succeed)
    }
}

#[async_trait]
impl TransferService for SimulatedTransferService {
    async fn transfer(
        &self,
        destination: &WalletAddress,
        amount: Decimal,
    ) -> Result<TransferOutcome, TransferError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = self.mode.lock().clone();
        debug!(call, destination = %destination, %amount, ?mode, "Simulated transfer");

        match mode {
            SimulatedMode::Succeed => Ok(TransferOutcome::Success {
                external_ref: format!("sim-{}", call),
            }),
            SimulatedMode::Pend => Ok(TransferOutcome::Pending {
                external_ref: Some(format!("sim-{}", call)),
            }),
            SimulatedMode::Fail(reason) => Ok(TransferOutcome::Failure { reason }),
            SimulatedMode::Unavailable => {
                Err(TransferError::Unavailable("simulated outage".to_string()))
            }
            SimulatedMode::Hang => {
                std::future::pending::<()>().await;
                Err(TransferError::Unavailable("unreachable".to_string()))
            }
        }
    }
}
