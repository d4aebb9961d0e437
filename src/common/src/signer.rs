//! Pluggable order signing.
//!
//! The venue's canonical EIP-712 order typing is not implemented here; the
//! signer capability covers an EIP-191 personal-message signature over the
//! canonical payload rendering, which a venue-exact implementation can
//! replace without touching the execution module.

use std::str::FromStr;

use alloy::primitives::hex;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use thiserror::Error;

use crate::models::OrderPayload;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Signs CLOB order payloads.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
pub trait OrderSigner: Send + Sync {
    /// Produce a hex-encoded signature over the payload.
    fn sign(&self, payload: &OrderPayload) -> Result<String, SignerError>;
}

/// Wallet-backed signer over a secp256k1 private key.
pub struct WalletSigner {
    signer: PrivateKeySigner,
}

impl WalletSigner {
    pub fn from_private_key(key: &str) -> Result<Self, SignerError> {
        let key = if key.starts_with("0x") {
            key.to_string()
        } else {
            format!("0x{key}")
        };

        let signer = PrivateKeySigner::from_str(&key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        Ok(Self { signer })
    }
}

impl OrderSigner for WalletSigner {
    fn sign(&self, payload: &OrderPayload) -> Result<String, SignerError> {
        let message = payload.canonical();
        let signature = self
            .signer
            .sign_message_sync(message.as_bytes())
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        Ok(hex::encode(signature.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;

    // Throwaway key, never funded.
    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn payload() -> OrderPayload {
        OrderPayload::new("tok-1", dec!(0.56), dec!(25), OrderSide::Buy, 1700000000000)
    }

    #[test]
    fn signer_accepts_key_with_or_without_prefix() {
        assert!(WalletSigner::from_private_key(TEST_KEY).is_ok());
        assert!(WalletSigner::from_private_key(&format!("0x{TEST_KEY}")).is_ok());
    }

    #[test]
    fn signer_rejects_garbage_key() {
        let result = WalletSigner::from_private_key("not-a-key");
        assert!(matches!(result, Err(SignerError::InvalidKey(_))));
    }

    #[test]
    fn signature_is_65_bytes_hex() {
        let signer = WalletSigner::from_private_key(TEST_KEY).unwrap();
        let signature = signer.sign(&payload()).unwrap();
        assert_eq!(signature.len(), 130);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signing_is_deterministic_for_equal_payloads() {
        let signer = WalletSigner::from_private_key(TEST_KEY).unwrap();
        assert_eq!(signer.sign(&payload()).unwrap(), signer.sign(&payload()).unwrap());
    }
}
