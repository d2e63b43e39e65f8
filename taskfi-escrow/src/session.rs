//! Session Issuer - Turns verified wallets into accounts and sessions
//!
//! A caller signs in with a signed message. Known wallets receive a signed,
//! stateless session token carrying `{account id, wallet, role}`; unknown
//! wallets are told to complete their profile first. Every later operation
//! re-validates the token instead of consulting the ledger.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AuthError, EscrowError, ValidationError},
    identity::{IdentityVerifier, VerifiedWallet, WalletAddress},
    models::{Account, Identity, Role},
    rate_limit::RateLimiter,
    EscrowResult,
};

/// Shortest accepted session secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Configuration for the session issuer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionIssuerConfig {
    /// HMAC secret for session tokens
    pub jwt_secret: String,
    /// Session lifetime in seconds
    pub session_ttl_secs: i64,
}

impl Default for SessionIssuerConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "taskfi-development-secret-change-me-0000".to_string(),
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SessionIssuerConfig {
    pub fn validate(&self) -> EscrowResult<()> {
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(EscrowError::config(format!(
                "session secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(())
    }
}

/// Session token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    wallet: String,
    role: Role,
    iat: i64,
    exp: i64,
}

/// Issued session
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub identity: Identity,
    pub expires_at: DateTime<Utc>,
}

/// Result of a sign-in attempt
#[derive(Debug, Clone)]
pub enum SignInOutcome {
    /// Wallet belongs to an existing account
    Authenticated(Session),
    /// Wallet is verified but has no account yet
    ProfileRequired(VerifiedWallet),
}

#[derive(Default)]
struct Directory {
    accounts: HashMap<Uuid, Account>,
    by_wallet: HashMap<WalletAddress, Uuid>,
    by_username: HashMap<String, Uuid>,
}

/// Account store with wallet and username uniqueness
#[derive(Default)]
pub struct AccountRegistry {
    inner: RwLock<Directory>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account; wallet and username (case-insensitive) must be free
    pub async fn create(
        &self,
        wallet_address: WalletAddress,
        username: &str,
        role: Role,
    ) -> EscrowResult<Account> {
        validate_username(username)?;
        let username_key = username.to_ascii_lowercase();

        let mut dir = self.inner.write().await;
        if dir.by_wallet.contains_key(&wallet_address) {
            return Err(EscrowError::conflict(format!(
                "wallet {} already has an account",
                wallet_address
            )));
        }
        if dir.by_username.contains_key(&username_key) {
            return Err(EscrowError::conflict(format!(
                "username {} is taken",
                username
            )));
        }

        let account = Account::new(wallet_address, username.to_string(), role);
        dir.by_wallet
            .insert(account.wallet_address.clone(), account.id);
        dir.by_username.insert(username_key, account.id);
        dir.accounts.insert(account.id, account.clone());

        Ok(account)
    }

    pub async fn get(&self, id: Uuid) -> Option<Account> {
        self.inner.read().await.accounts.get(&id).cloned()
    }

    pub async fn find_by_wallet(&self, wallet: &WalletAddress) -> Option<Account> {
        let dir = self.inner.read().await;
        dir.by_wallet
            .get(wallet)
            .and_then(|id| dir.accounts.get(id))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.accounts.len()
    }
}

fn validate_username(username: &str) -> Result<(), ValidationError> {
    let len_ok = (3..=32).contains(&username.len());
    let chars_ok = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidUsername(
            "3-32 characters of letters, digits or underscore".to_string(),
        ))
    }
}

/// Nonces already consumed per wallet. An entry is pruned only once the
/// verifier would reject its message as expired at the same instant, using
/// the same exact comparison.
#[derive(Default)]
struct NonceRegistry {
    used: Mutex<HashMap<(WalletAddress, String), DateTime<Utc>>>,
}

impl NonceRegistry {
    fn claim(
        &self,
        wallet: &VerifiedWallet,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut used = self.used.lock();
        used.retain(|_, issued_at| now - *issued_at <= window);

        let key = (wallet.address().clone(), wallet.nonce().to_string());
        if used.contains_key(&key) {
            return Err(AuthError::ReplayedNonce(wallet.nonce().to_string()));
        }
        used.insert(key, wallet.issued_at());
        Ok(())
    }
}

/// Issues and validates sessions bound to verified wallets
pub struct SessionIssuer {
    config: SessionIssuerConfig,
    verifier: IdentityVerifier,
    accounts: Arc<AccountRegistry>,
    limiter: Arc<RateLimiter>,
    nonces: NonceRegistry,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionIssuer {
    /// Create a new session issuer; rejects secrets shorter than 32 bytes
    pub fn new(
        config: SessionIssuerConfig,
        verifier: IdentityVerifier,
        accounts: Arc<AccountRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> EscrowResult<Self> {
        config.validate()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            config,
            verifier,
            accounts,
            limiter,
            nonces: NonceRegistry::default(),
        })
    }

    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        &self.accounts
    }

    /// Prove wallet ownership and open a session if the wallet is known
    pub async fn sign_in(
        &self,
        wallet_address: &str,
        message: &str,
        signature: &str,
    ) -> EscrowResult<SignInOutcome> {
        self.sign_in_at(wallet_address, message, signature, Utc::now())
            .await
    }

    /// `sign_in` as of `now`; verification and nonce pruning share the instant
    async fn sign_in_at(
        &self,
        wallet_address: &str,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> EscrowResult<SignInOutcome> {
        let rate_key = wallet_address.trim().to_ascii_lowercase();
        self.limiter.check(&rate_key)?;

        let verified = match self
            .verifier
            .verify_at(wallet_address, message, signature, now)
        {
            Ok(verified) => verified,
            Err(e) => {
                warn!(wallet = %rate_key, error = %e, "Sign-in rejected");
                return Err(e.into());
            }
        };
        self.nonces
            .claim(&verified, self.verifier.freshness_window(), now)?;

        match self.accounts.find_by_wallet(verified.address()).await {
            Some(account) => {
                info!(account_id = %account.id, "Wallet signed in");
                Ok(SignInOutcome::Authenticated(self.issue(&account)?))
            }
            None => {
                info!(wallet = %verified.address(), "Verified wallet has no account yet");
                Ok(SignInOutcome::ProfileRequired(verified))
            }
        }
    }

    /// Create the account for a verified wallet and open its first session
    pub async fn complete_profile(
        &self,
        wallet: VerifiedWallet,
        username: &str,
        role: Role,
    ) -> EscrowResult<Session> {
        if role == Role::Admin {
            return Err(EscrowError::authorization(
                "moderator accounts cannot be self-registered",
            ));
        }

        let account = self
            .accounts
            .create(wallet.address().clone(), username, role)
            .await?;
        info!(account_id = %account.id, role = role.as_str(), "Account created");

        self.issue(&account)
    }

    /// Operator path for creating moderator accounts
    pub async fn provision_moderator(
        &self,
        wallet: WalletAddress,
        username: &str,
    ) -> EscrowResult<Account> {
        let account = self.accounts.create(wallet, username, Role::Admin).await?;
        info!(account_id = %account.id, "Moderator provisioned");
        Ok(account)
    }

    /// Issue a session token for `account`
    pub fn issue(&self, account: &Account) -> EscrowResult<Session> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.session_ttl_secs);
        let claims = Claims {
            sub: account.id.to_string(),
            wallet: account.wallet_address.to_string(),
            role: account.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| EscrowError::internal(format!("failed to sign session: {}", e)))?;

        Ok(Session {
            token,
            identity: Identity::from(account),
            expires_at,
        })
    }

    /// Check token integrity and expiry and return the caller's identity
    pub fn validate(&self, token: &str) -> EscrowResult<Identity> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidSession(e.to_string()))?;
        let claims = data.claims;

        let account_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidSession("bad subject".into()))?;
        let wallet_address = WalletAddress::parse(&claims.wallet)
            .map_err(|_| AuthError::InvalidSession("bad wallet claim".into()))?;

        Ok(Identity {
            account_id,
            wallet_address,
            role: claims.role,
        })
    }

    /// Re-issue a valid session, picking up the account's current role
    pub async fn refresh(&self, token: &str) -> EscrowResult<Session> {
        let identity = self.validate(token)?;
        let account = self
            .accounts
            .get(identity.account_id)
            .await
            .ok_or_else(|| AuthError::InvalidSession("account no longer exists".into()))?;
        self.issue(&account)
    }
}
