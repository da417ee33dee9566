//! Ed25519 authentication of off-chain channel payments.
//!
//! A channel payment is authorised by the channel owner signing the UTF-8 message
//! `"{channel_id}|{amount}|{nonce}"`, with `amount` in normalized decimal form (`"2.5"`,
//! never `"2.50"`). Public keys and signatures are base58, as on Solana.

use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, VerifyingKey};
use rust_decimal::Decimal;

/// Why a signature or key was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The public key is not base58 or not a valid curve point.
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    /// The signature is not base58 or has the wrong length.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    /// The signature does not match the message and key.
    #[error("signature does not match channel owner")]
    Mismatch,
}

/// Canonical bytes a channel owner signs to authorise a payment.
#[must_use]
pub fn channel_payment_message(channel_id: &str, amount: Decimal, nonce: u64) -> Vec<u8> {
    format!("{channel_id}|{}|{nonce}", amount.normalize()).into_bytes()
}

/// Parses a base58 ed25519 public key.
///
/// # Errors
///
/// Returns [`SignatureError::MalformedKey`] if decoding fails or the bytes are not a
/// valid point.
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = bs58::decode(public_key)
        .into_vec()
        .map_err(|e| SignatureError::MalformedKey(e.to_string()))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        SignatureError::MalformedKey(format!("expected {PUBLIC_KEY_LENGTH} bytes, got {}", b.len()))
    })?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::MalformedKey(e.to_string()))
}

/// Verifies a base58 signature over `message` by `public_key`.
///
/// Uses strict verification, which rejects small-order keys and malleable signatures.
///
/// # Errors
///
/// Returns [`SignatureError`] if either input is malformed or the signature does not
/// match.
pub fn verify_signature(
    public_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), SignatureError> {
    let key = parse_public_key(public_key)?;
    let bytes = bs58::decode(signature)
        .into_vec()
        .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        SignatureError::MalformedSignature(format!(
            "expected {SIGNATURE_LENGTH} bytes, got {}",
            b.len()
        ))
    })?;
    let signature = Signature::from_bytes(&bytes);
    key.verify_strict(message, &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verifies that `signature` authorises paying `amount` at `nonce` on `channel_id`.
///
/// # Errors
///
/// See [`verify_signature`].
pub fn verify_channel_payment(
    public_key: &str,
    channel_id: &str,
    amount: Decimal,
    nonce: u64,
    signature: &str,
) -> Result<(), SignatureError> {
    let message = channel_payment_message(channel_id, amount, nonce);
    verify_signature(public_key, &message, signature)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use ed25519_dalek::{Signer, SigningKey};
    use rust_decimal::Decimal;

    /// Deterministic channel owner key for tests.
    pub(crate) fn owner(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub(crate) fn public_key(key: &SigningKey) -> String {
        bs58::encode(key.verifying_key().to_bytes()).into_string()
    }

    pub(crate) fn sign_payment(key: &SigningKey, channel_id: &str, amount: Decimal, nonce: u64) -> String {
        let message = super::channel_payment_message(channel_id, amount, nonce);
        bs58::encode(key.sign(&message).to_bytes()).into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;

    #[test]
    fn message_uses_normalized_amount() {
        let message = channel_payment_message("ch_1", Decimal::new(250, 2), 3);
        assert_eq!(message, b"ch_1|2.5|3".to_vec());
    }

    #[test]
    fn accepts_owner_signature() {
        let key = owner(7);
        let sig = sign_payment(&key, "ch", Decimal::TWO, 1);
        assert_eq!(
            verify_channel_payment(&public_key(&key), "ch", Decimal::TWO, 1, &sig),
            Ok(())
        );
    }

    #[test]
    fn rejects_tampered_fields_and_foreign_keys() {
        let key = owner(7);
        let pk = public_key(&key);
        let sig = sign_payment(&key, "ch", Decimal::TWO, 1);

        assert_eq!(
            verify_channel_payment(&pk, "ch", Decimal::TEN, 1, &sig),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_channel_payment(&pk, "ch", Decimal::TWO, 2, &sig),
            Err(SignatureError::Mismatch)
        );
        let other = public_key(&owner(9));
        assert_eq!(
            verify_channel_payment(&other, "ch", Decimal::TWO, 1, &sig),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_malformed_inputs() {
        let pk = public_key(&owner(1));
        assert!(matches!(
            verify_signature(&pk, b"m", "not-base58-0OIl"),
            Err(SignatureError::MalformedSignature(_))
        ));
        assert!(matches!(
            verify_signature(&pk, b"m", "abc"),
            Err(SignatureError::MalformedSignature(_))
        ));
        assert!(matches!(
            parse_public_key("short"),
            Err(SignatureError::MalformedKey(_))
        ));
    }
}
