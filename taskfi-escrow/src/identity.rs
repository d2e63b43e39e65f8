//! Identity Verifier - Proves control of a wallet's private key
//!
//! A caller proves ownership of a wallet by signing a short, human-readable
//! sign-in message with the wallet's ed25519 key. The signature is detached:
//! it covers exactly the UTF-8 bytes of the message and is checked against
//! the public key encoded in the wallet address. Verification is pure
//! computation and holds no shared state.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ValidationError};

const STATEMENT_SUFFIX: &str = " wants you to sign in with your wallet:";
const NONCE_PREFIX: &str = "Nonce: ";
const ISSUED_AT_PREFIX: &str = "Issued At: ";
const MIN_NONCE_LEN: usize = 8;
const MAX_NONCE_LEN: usize = 64;

/// Public identifier of an ed25519 keypair: lowercase hex of the 32-byte
/// public key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Parse and normalize a hex wallet address
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() != 64 {
            return Err(ValidationError::InvalidAddress(format!(
                "expected 64 hex characters, got {}",
                normalized.len()
            )));
        }
        if hex::decode(&normalized).is_err() {
            return Err(ValidationError::InvalidAddress(
                "address is not valid hex".to_string(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into an ed25519 public key. Not every 32-byte string is a
    /// valid curve point.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut bytes).ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(address: WalletAddress) -> Self {
        address.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured sign-in message. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub domain: String,
    pub address: String,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

impl SignedMessage {
    /// Build a message; the timestamp is truncated to whole seconds, which is
    /// the precision of the text form
    pub fn new(
        domain: impl Into<String>,
        address: &WalletAddress,
        nonce: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            address: address.to_string(),
            nonce: nonce.into(),
            issued_at: DateTime::from_timestamp(issued_at.timestamp(), 0).unwrap_or(issued_at),
        }
    }

    /// Parse the text form produced by `Display`
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let lines: Vec<&str> = text.split('\n').collect();
        let [statement, address, blank, nonce_line, issued_line] = lines.as_slice() else {
            return Err(AuthError::MalformedMessage(format!(
                "expected 5 lines, got {}",
                lines.len()
            )));
        };

        let domain = statement
            .strip_suffix(STATEMENT_SUFFIX)
            .filter(|d| !d.is_empty() && !d.contains(char::is_whitespace))
            .ok_or_else(|| AuthError::MalformedMessage("missing sign-in statement".into()))?;

        if address.is_empty() || !blank.is_empty() {
            return Err(AuthError::MalformedMessage(
                "missing wallet address line".into(),
            ));
        }

        let nonce = nonce_line
            .strip_prefix(NONCE_PREFIX)
            .ok_or_else(|| AuthError::MalformedMessage("missing nonce".into()))?;
        if nonce.len() < MIN_NONCE_LEN
            || nonce.len() > MAX_NONCE_LEN
            || !nonce.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(AuthError::MalformedMessage(format!(
                "nonce must be {}-{} alphanumeric characters",
                MIN_NONCE_LEN, MAX_NONCE_LEN
            )));
        }

        let issued_at = issued_line
            .strip_prefix(ISSUED_AT_PREFIX)
            .ok_or_else(|| AuthError::MalformedMessage("missing issuance timestamp".into()))?;
        let issued_at = DateTime::parse_from_rfc3339(issued_at)
            .map_err(|e| AuthError::MalformedMessage(format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Self {
            domain: domain.to_string(),
            address: address.to_string(),
            nonce: nonce.to_string(),
            issued_at,
        })
    }

    /// Sign the text form with `key`, returning the hex signature
    pub fn sign(&self, key: &SigningKey) -> String {
        hex::encode(key.sign(self.to_string().as_bytes()).to_bytes())
    }
}

impl fmt::Display for SignedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}\n{}\n\n{}{}\n{}{}",
            self.domain,
            STATEMENT_SUFFIX,
            self.address,
            NONCE_PREFIX,
            self.nonce,
            ISSUED_AT_PREFIX,
            self.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Proof that a wallet signed a fresh sign-in message. Only the verifier
/// can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedWallet {
    address: WalletAddress,
    nonce: String,
    issued_at: DateTime<Utc>,
}

impl VerifiedWallet {
    pub fn address(&self) -> &WalletAddress {
        &self.address
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Configuration for the identity verifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityVerifierConfig {
    /// Domain the message must be bound to
    pub domain: String,
    /// Maximum message age in seconds
    pub freshness_window_secs: i64,
    /// Tolerated clock drift for timestamps slightly in the future
    pub max_clock_skew_secs: i64,
}

impl Default for IdentityVerifierConfig {
    fn default() -> Self {
        Self {
            domain: "taskfi.app".to_string(),
            freshness_window_secs: 300, // 5 minutes
            max_clock_skew_secs: 30,
        }
    }
}

/// Verifies detached wallet signatures over sign-in messages
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    config: IdentityVerifierConfig,
}

impl IdentityVerifier {
    pub fn new(config: IdentityVerifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &IdentityVerifierConfig {
        &self.config
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::seconds(self.config.freshness_window_secs)
    }

    /// Verify against the current clock
    pub fn verify(
        &self,
        wallet_address: &str,
        message: &str,
        signature: &str,
    ) -> Result<VerifiedWallet, AuthError> {
        self.verify_at(wallet_address, message, signature, Utc::now())
    }

    /// Boolean form of `verify`
    pub fn is_valid(&self, wallet_address: &str, message: &str, signature: &str) -> bool {
        self.verify(wallet_address, message, signature).is_ok()
    }

    /// Verify as of `now`. Freshness is checked before the signature, so a
    /// stale message is rejected regardless of signature validity.
    pub fn verify_at(
        &self,
        wallet_address: &str,
        message: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedWallet, AuthError> {
        let parsed = SignedMessage::parse(message)?;

        let claimed = WalletAddress::parse(wallet_address)
            .map_err(|e| AuthError::MalformedMessage(e.to_string()))?;
        let declared = WalletAddress::parse(&parsed.address)
            .map_err(|e| AuthError::MalformedMessage(e.to_string()))?;
        if claimed != declared {
            return Err(AuthError::AddressMismatch {
                claimed: claimed.to_string(),
                declared: declared.to_string(),
            });
        }

        if parsed.domain != self.config.domain {
            return Err(AuthError::DomainMismatch {
                expected: self.config.domain.clone(),
                found: parsed.domain,
            });
        }

        let age = now - parsed.issued_at;
        if age > self.freshness_window() {
            return Err(AuthError::ExpiredMessage {
                age_secs: age.num_seconds(),
                window_secs: self.config.freshness_window_secs,
            });
        }
        if -age > Duration::seconds(self.config.max_clock_skew_secs) {
            return Err(AuthError::IssuedInFuture {
                ahead_secs: (-age).num_seconds(),
            });
        }

        let key = claimed
            .verifying_key()
            .ok_or(AuthError::InvalidSignature)?;
        let mut sig_bytes = [0u8; 64];
        hex::decode_to_slice(signature.trim(), &mut sig_bytes)
            .map_err(|_| AuthError::InvalidSignature)?;
        key.verify_strict(message.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| AuthError::InvalidSignature)?;

        Ok(VerifiedWallet {
            address: claimed,
            nonce: parsed.nonce,
            issued_at: parsed.issued_at,
        })
    }
}

impl Default for IdentityVerifier {
    fn default() -> Self {
        Self::new(IdentityVerifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> (SigningKey, WalletAddress) {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let address = WalletAddress::from_verifying_key(&key.verifying_key());
        (key, address)
    }

    fn signed(seed: u8, issued_at: DateTime<Utc>) -> (WalletAddress, String, String) {
        let (key, address) = keypair(seed);
        let message = SignedMessage::new("taskfi.app", &address, "n0nce1234", issued_at);
        let signature = message.sign(&key);
        (address, message.to_string(), signature)
    }

    #[test]
    fn test_genuine_signature_verifies() {
        let verifier = IdentityVerifier::default();
        for seed in [1u8, 7, 42, 200] {
            let (address, message, signature) = signed(seed, Utc::now());
            let verified = verifier
                .verify(address.as_str(), &message, &signature)
                .unwrap();
            assert_eq!(verified.address(), &address);
            assert_eq!(verified.nonce(), "n0nce1234");
        }
    }

    #[test]
    fn test_single_bit_mutations_fail() {
        let verifier = IdentityVerifier::default();
        let now = Utc::now();
        let (address, message, signature) = signed(3, now);

        let sig_bytes = hex::decode(&signature).unwrap();
        for byte in 0..sig_bytes.len() {
            for bit in 0..8 {
                let mut mutated = sig_bytes.clone();
                mutated[byte] ^= 1 << bit;
                let result =
                    verifier.verify_at(address.as_str(), &message, &hex::encode(&mutated), now);
                assert!(result.is_err(), "signature bit {}:{} accepted", byte, bit);
            }
        }

        let msg_bytes = message.as_bytes().to_vec();
        for byte in 0..msg_bytes.len() {
            // Stay within ASCII so the mutation remains a valid &str
            for bit in 0..7 {
                let mut mutated = msg_bytes.clone();
                mutated[byte] ^= 1 << bit;
                let mutated = String::from_utf8(mutated).unwrap();
                let result = verifier.verify_at(address.as_str(), &mutated, &signature, now);
                assert!(result.is_err(), "message bit {}:{} accepted", byte, bit);
            }
        }
    }

    #[test]
    fn test_replay_after_window_is_expired() {
        let verifier = IdentityVerifier::default();
        let signed_at = Utc::now() - Duration::hours(1);
        let (address, message, signature) = signed(9, signed_at);
        let window = verifier.freshness_window();

        let at_edge = signed_at + window;
        assert!(verifier
            .verify_at(address.as_str(), &message, &signature, at_edge)
            .is_ok());

        let replay_at = signed_at + window + Duration::seconds(1);
        let err = verifier
            .verify_at(address.as_str(), &message, &signature, replay_at)
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredMessage { .. }));
    }

    #[test]
    fn test_window_edge_is_exact() {
        let verifier = IdentityVerifier::default();
        let signed_at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let (address, message, signature) = signed(12, signed_at);
        let window = verifier.freshness_window();

        // A fraction of a second past the window is already too old
        for late in [Duration::milliseconds(1), Duration::milliseconds(999)] {
            let err = verifier
                .verify_at(address.as_str(), &message, &signature, signed_at + window + late)
                .unwrap_err();
            assert!(matches!(err, AuthError::ExpiredMessage { .. }));
        }

        let skew = Duration::seconds(verifier.config().max_clock_skew_secs);
        assert!(verifier
            .verify_at(address.as_str(), &message, &signature, signed_at - skew)
            .is_ok());
        let err = verifier
            .verify_at(
                address.as_str(),
                &message,
                &signature,
                signed_at - skew - Duration::milliseconds(1),
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::IssuedInFuture { .. }));
    }

    #[test]
    fn test_stale_message_rejected_even_with_valid_signature() {
        let verifier = IdentityVerifier::default();
        let (address, message, signature) = signed(11, Utc::now() - Duration::minutes(10));
        let err = verifier
            .verify(address.as_str(), &message, &signature)
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredMessage { .. }));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let verifier = IdentityVerifier::default();
        let (address, message, signature) = signed(12, Utc::now() + Duration::minutes(5));
        let err = verifier
            .verify(address.as_str(), &message, &signature)
            .unwrap_err();
        assert!(matches!(err, AuthError::IssuedInFuture { .. }));
    }

    #[test]
    fn test_address_mismatch() {
        let verifier = IdentityVerifier::default();
        let (_, message, signature) = signed(5, Utc::now());
        let (_, other) = keypair(6);
        let err = verifier
            .verify(other.as_str(), &message, &signature)
            .unwrap_err();
        assert!(matches!(err, AuthError::AddressMismatch { .. }));
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let verifier = IdentityVerifier::default();
        let (_, address) = keypair(21);
        let (impostor, _) = keypair(22);
        let message = SignedMessage::new("taskfi.app", &address, "abcdefgh1", Utc::now());
        let signature = message.sign(&impostor);
        let err = verifier
            .verify(address.as_str(), &message.to_string(), &signature)
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn test_domain_binding() {
        let verifier = IdentityVerifier::default();
        let (key, address) = keypair(8);
        let message = SignedMessage::new("evil.example", &address, "abcdefgh2", Utc::now());
        let signature = message.sign(&key);
        let err = verifier
            .verify(address.as_str(), &message.to_string(), &signature)
            .unwrap_err();
        assert!(matches!(err, AuthError::DomainMismatch { .. }));
    }

    #[test]
    fn test_malformed_messages() {
        let verifier = IdentityVerifier::default();
        let (_, address) = keypair(4);
        for text in [
            "",
            "hello world",
            "taskfi.app wants you to sign in with your wallet:\nabc",
            &format!(
                "taskfi.app wants you to sign in with your wallet:\n{}\n\nNonce: short\nIssued At: 2026-01-01T00:00:00Z",
                address
            ),
            &format!(
                "taskfi.app wants you to sign in with your wallet:\n{}\n\nNonce: abcdefgh3\nIssued At: yesterday",
                address
            ),
        ] {
            let err = verifier.verify(address.as_str(), text, "00").unwrap_err();
            assert!(matches!(err, AuthError::MalformedMessage(_)), "{:?}", text);
        }
    }

    #[test]
    fn test_message_round_trip_and_address_normalization() {
        let (_, address) = keypair(30);
        let message = SignedMessage::new("taskfi.app", &address, "Zz09Zz09", Utc::now());
        assert_eq!(SignedMessage::parse(&message.to_string()).unwrap(), message);

        let upper = address.as_str().to_ascii_uppercase();
        assert_eq!(WalletAddress::parse(&upper).unwrap(), address);
        assert!(WalletAddress::parse("xyz").is_err());
        assert!(WalletAddress::parse(&"g".repeat(64)).is_err());
    }
}
