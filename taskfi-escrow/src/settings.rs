//! Layered configuration
//!
//! Defaults, then an optional TOML file, then `TASKFI_*` environment
//! variables with `__` separating nested keys, e.g.
//! `TASKFI_SESSION__JWT_SECRET` or `TASKFI_LEDGER__MAX_AMOUNT`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    escrow_ledger::EscrowLedgerConfig, identity::IdentityVerifierConfig,
    rate_limit::RateLimitConfig, session::SessionIssuerConfig, transfer::TransferConfig,
    withdrawal::WithdrawalConfig, EscrowResult,
};

/// Default config file looked up when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "taskfi.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auth: IdentityVerifierConfig,
    pub session: SessionIssuerConfig,
    pub rate_limit: RateLimitConfig,
    pub ledger: EscrowLedgerConfig,
    pub withdrawal: WithdrawalConfig,
    pub transfer: TransferConfig,
}

impl Settings {
    /// Load settings from `path` (or `taskfi.toml` when present) and the environment
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("TASKFI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;

        debug!(
            domain = %settings.auth.domain,
            currency = %settings.ledger.currency,
            "Loaded settings"
        );
        Ok(settings)
    }

    /// Load from an in-memory TOML document, without the environment
    pub fn from_toml(source: &str) -> EscrowResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values no component could start with
    pub fn validate(&self) -> EscrowResult<()> {
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.auth.domain, "taskfi.app");
        assert_eq!(settings.auth.freshness_window_secs, 300);
        assert_eq!(settings.session.session_ttl_secs, 86_400);
        assert_eq!(settings.ledger.currency, "USDC");
        assert_eq!(settings.withdrawal.transfer_timeout_ms, 10_000);
        assert_eq!(settings.rate_limit.max_attempts, 10);
        assert!(settings.transfer.endpoint.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            [auth]
            domain = "staging.taskfi.app"

            [ledger]
            max_amount = "2500.50"

            [transfer]
            endpoint = "http://localhost:8089/transfer"
            "#,
        )
        .unwrap();

        assert_eq!(settings.auth.domain, "staging.taskfi.app");
        assert_eq!(settings.auth.freshness_window_secs, 300);
        assert_eq!(settings.ledger.max_amount, Decimal::new(250050, 2));
        assert_eq!(settings.ledger.currency, "USDC");
        assert_eq!(
            settings.transfer.endpoint.as_deref(),
            Some("http://localhost:8089/transfer")
        );
    }

    #[test]
    fn test_short_secret_rejected_at_load() {
        let err = Settings::from_toml(
            r#"
            [session]
            jwt_secret = "too-short"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "CONFIG");

        let settings = Settings::from_toml(&format!(
            "[session]\njwt_secret = \"{}\"\n",
            "k".repeat(crate::session::MIN_SECRET_LEN)
        ))
        .unwrap();
        assert_eq!(settings.session.jwt_secret.len(), 32);
    }

    #[test]
    fn test_missing_required_file() {
        let err = Settings::load(Some("/nonexistent/taskfi.toml")).unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }
}
