//! Payment receipts and their tamper-evident proof hash.
//!
//! A receipt's `proof` is the lowercase hex SHA-256 of its fields joined with `|`:
//!
//! ```text
//! signature|amount|merchant|payer|timestamp|reference|blockHeight
//! ```
//!
//! The proof is an integrity checksum, not a signature. It shows that a receipt was
//! not edited after it was issued; authenticity still rests on the ledger
//! transaction it names, which [`verify_receipt`] checks.

use std::fmt::Write as _;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorBody, ErrorCode, SettlementError};
use crate::ledger::{Ledger, LedgerError, TransactionRef};
use crate::timestamp::UnixTimestamp;

/// Lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    Sha256::digest(bytes.as_ref())
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// The hashed fields of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    /// Ledger transaction signature.
    pub signature: String,
    /// Amount paid to the merchant.
    pub amount: Decimal,
    /// Merchant address or id.
    pub merchant: String,
    /// Payer address.
    pub payer: String,
    /// When the payment landed.
    pub timestamp: UnixTimestamp,
    /// Caller reference.
    pub reference: String,
    /// Block height (slot) of the transaction.
    pub block_height: u64,
}

/// A payment receipt carrying its proof hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    /// Hashed fields.
    #[serde(flatten)]
    pub details: PaymentDetails,
    /// Hex SHA-256 over [`PaymentDetails`].
    pub proof: String,
    /// `true` only if the transaction was confirmed against the ledger.
    pub verified: bool,
}

/// Computes the proof hash for `details`.
#[must_use]
pub fn generate_proof(details: &PaymentDetails) -> String {
    let amount = details.amount.normalize().to_string();
    let timestamp = details.timestamp.to_string();
    let block_height = details.block_height.to_string();
    let canonical = [
        details.signature.as_str(),
        amount.as_str(),
        details.merchant.as_str(),
        details.payer.as_str(),
        timestamp.as_str(),
        details.reference.as_str(),
        block_height.as_str(),
    ]
    .join("|");
    sha256_hex(canonical)
}

/// Issues an unverified receipt for a payment the caller already knows about.
#[must_use]
pub fn create_receipt_from_payment(details: PaymentDetails) -> PaymentReceipt {
    let proof = generate_proof(&details);
    PaymentReceipt {
        details,
        proof,
        verified: false,
    }
}

/// Recomputes the proof and compares it with the one the receipt carries.
#[must_use]
pub fn validate_proof(receipt: &PaymentReceipt) -> bool {
    generate_proof(&receipt.details) == receipt.proof
}

/// What a verifier expects a payment transaction to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptQuery {
    /// Transaction to look up.
    pub signature: TransactionRef,
    /// Minimum amount the merchant must have received.
    pub expected_amount: Decimal,
    /// Address that must appear among the transaction's destinations.
    pub expected_merchant: String,
    /// Payer the transaction must come from, if known.
    #[serde(default)]
    pub expected_payer: Option<String>,
}

/// Why a receipt could not be verified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    /// The ledger does not know the transaction.
    #[error("transaction {0} not found or not confirmed")]
    NotFound(TransactionRef),
    /// The transaction landed but failed.
    #[error("transaction {0} failed on-chain")]
    Failed(TransactionRef),
    /// The transaction came from someone else.
    #[error("payer mismatch: expected {expected}, found {actual}")]
    PayerMismatch {
        /// Expected payer.
        expected: String,
        /// Actual source of the transaction.
        actual: String,
    },
    /// The merchant received less than expected (or nothing).
    #[error("merchant {merchant} received {paid}, expected at least {expected}")]
    AmountMismatch {
        /// Merchant address.
        merchant: String,
        /// Expected amount.
        expected: Decimal,
        /// Amount actually transferred to the merchant.
        paid: Decimal,
    },
    /// The ledger could not be queried.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ReceiptError {
    /// Stable external error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::Failed(_) => ErrorCode::PaymentTransactionFailed,
            Self::PayerMismatch { .. } | Self::AmountMismatch { .. } => {
                ErrorCode::PaymentVerificationFailed
            }
            Self::Ledger(err) => SettlementError::from(err.clone()).code(),
        }
    }

    /// Builds the serializable error body for transports.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let retryable = matches!(self, Self::Ledger(err) if err.is_transient());
        ErrorBody::new(self.code(), self.to_string(), retryable)
    }
}

/// Confirms a payment against the ledger and issues a verified receipt.
///
/// # Errors
///
/// Returns [`ReceiptError`] if the transaction is unknown, failed, came from the wrong
/// payer, or did not pay the merchant enough.
pub async fn verify_receipt(
    ledger: &dyn Ledger,
    query: &ReceiptQuery,
) -> Result<PaymentReceipt, ReceiptError> {
    let record = ledger
        .get_transaction(&query.signature)
        .await?
        .ok_or_else(|| ReceiptError::NotFound(query.signature.clone()))?;

    if !record.succeeded {
        return Err(ReceiptError::Failed(query.signature.clone()));
    }
    if let Some(expected) = &query.expected_payer
        && *expected != record.from
    {
        return Err(ReceiptError::PayerMismatch {
            expected: expected.clone(),
            actual: record.from,
        });
    }

    let paid: Decimal = record
        .legs
        .iter()
        .filter(|leg| leg.to == query.expected_merchant)
        .map(|leg| leg.amount)
        .sum();
    if paid < query.expected_amount || paid.is_zero() {
        return Err(ReceiptError::AmountMismatch {
            merchant: query.expected_merchant.clone(),
            expected: query.expected_amount,
            paid,
        });
    }

    let signature = query.signature.as_str();
    let details = PaymentDetails {
        signature: signature.to_owned(),
        amount: query.expected_amount,
        merchant: query.expected_merchant.clone(),
        payer: record.from,
        timestamp: record.block_time.unwrap_or_else(UnixTimestamp::now),
        reference: signature.chars().take(16).collect(),
        block_height: record.block_height,
    };
    let mut receipt = create_receipt_from_payment(details);
    receipt.verified = true;
    Ok(receipt)
}

/// A receipt that failed verification inside [`verify_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedReceipt {
    /// Transaction that was checked.
    pub signature: TransactionRef,
    /// Why it was rejected.
    pub reason: String,
}

/// Aggregate view over a set of receipts claimed for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedSession {
    /// Session the receipts belong to.
    pub session_id: String,
    /// Receipts that verified.
    pub receipts: Vec<PaymentReceipt>,
    /// Receipts that did not.
    pub rejected: Vec<RejectedReceipt>,
    /// Sum of verified amounts.
    pub total_paid: Decimal,
    /// Number of verified receipts.
    pub total_transactions: usize,
    /// Earliest verified payment.
    pub first_payment: Option<UnixTimestamp>,
    /// Latest verified payment.
    pub last_payment: Option<UnixTimestamp>,
    /// `true` if at least one receipt verified.
    pub is_valid: bool,
    /// `true` if every verified receipt paid the same merchant.
    pub merchant_verified: bool,
}

/// Verifies each query and aggregates the results.
///
/// Individual failures do not abort the aggregation; they are listed in
/// [`VerifiedSession::rejected`].
pub async fn verify_session(
    ledger: &dyn Ledger,
    session_id: &str,
    queries: &[ReceiptQuery],
) -> VerifiedSession {
    let mut receipts = Vec::with_capacity(queries.len());
    let mut rejected = Vec::new();
    for query in queries {
        match verify_receipt(ledger, query).await {
            Ok(receipt) => receipts.push(receipt),
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(session_id, signature = %query.signature, error = %err, "Receipt rejected");
                rejected.push(RejectedReceipt {
                    signature: query.signature.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let total_paid = receipts.iter().map(|r| r.details.amount).sum();
    let first_payment = receipts.iter().map(|r| r.details.timestamp).min();
    let last_payment = receipts.iter().map(|r| r.details.timestamp).max();
    let merchant_verified = receipts
        .first()
        .is_some_and(|first| receipts.iter().all(|r| r.details.merchant == first.details.merchant));

    VerifiedSession {
        session_id: session_id.to_owned(),
        total_transactions: receipts.len(),
        is_valid: !receipts.is_empty(),
        receipts,
        rejected,
        total_paid,
        first_payment,
        last_payment,
        merchant_verified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    fn details() -> PaymentDetails {
        PaymentDetails {
            signature: "5sig".into(),
            amount: Decimal::new(125, 2),
            merchant: "merchant".into(),
            payer: "payer".into(),
            timestamp: UnixTimestamp::from_secs(1_700_000_000),
            reference: "order-1".into(),
            block_height: 42,
        }
    }

    #[test]
    fn proof_matches_canonical_join() {
        let expected = sha256_hex("5sig|1.25|merchant|payer|1700000000|order-1|42");
        assert_eq!(generate_proof(&details()), expected);
        assert_eq!(expected.len(), 64);
    }

    #[test]
    fn created_receipts_validate() {
        let receipt = create_receipt_from_payment(details());
        assert!(validate_proof(&receipt));
        assert!(!receipt.verified);
    }

    #[test]
    fn any_field_change_breaks_the_proof() {
        let original = create_receipt_from_payment(details());
        let edits: [fn(&mut PaymentDetails); 7] = [
            |d| d.signature.push('x'),
            |d| d.amount += Decimal::ONE,
            |d| d.merchant = "other".into(),
            |d| d.payer = "other".into(),
            |d| d.timestamp = d.timestamp + 1,
            |d| d.reference.push('2'),
            |d| d.block_height += 1,
        ];
        for edit in edits {
            let mut tampered = original.clone();
            edit(&mut tampered.details);
            assert!(!validate_proof(&tampered));
        }
    }

    #[test]
    fn receipt_serializes_flat() {
        let json = serde_json::to_value(create_receipt_from_payment(details())).unwrap();
        assert_eq!(json["blockHeight"], 42);
        assert_eq!(json["amount"], "1.25");
        assert!(json["proof"].is_string());
    }

    #[tokio::test]
    async fn verifies_against_the_ledger() {
        let ledger = InMemoryLedger::new();
        ledger.credit("payer", Decimal::TEN);
        let signature = ledger.transfer("payer", "merchant", Decimal::TWO).await.unwrap();

        let query = ReceiptQuery {
            signature: signature.clone(),
            expected_amount: Decimal::TWO,
            expected_merchant: "merchant".into(),
            expected_payer: Some("payer".into()),
        };
        let receipt = verify_receipt(&ledger, &query).await.unwrap();
        assert!(receipt.verified);
        assert!(validate_proof(&receipt));
        assert_eq!(receipt.details.payer, "payer");

        let wrong_payer = ReceiptQuery {
            expected_payer: Some("mallory".into()),
            ..query.clone()
        };
        assert!(matches!(
            verify_receipt(&ledger, &wrong_payer).await,
            Err(ReceiptError::PayerMismatch { .. })
        ));

        let overclaimed = ReceiptQuery {
            expected_amount: Decimal::TEN,
            ..query.clone()
        };
        assert!(matches!(
            verify_receipt(&ledger, &overclaimed).await,
            Err(ReceiptError::AmountMismatch { .. })
        ));

        let session = verify_session(
            &ledger,
            "sess",
            &[
                query,
                ReceiptQuery {
                    signature: TransactionRef::new("missing"),
                    expected_amount: Decimal::ONE,
                    expected_merchant: "merchant".into(),
                    expected_payer: None,
                },
            ],
        )
        .await;
        assert_eq!(session.total_transactions, 1);
        assert_eq!(session.total_paid, Decimal::TWO);
        assert_eq!(session.rejected.len(), 1);
        assert!(session.is_valid);
        assert!(session.merchant_verified);
        assert_eq!(session.first_payment, session.last_payment);
    }

    #[test]
    fn receipt_errors_carry_codes() {
        assert_eq!(
            ReceiptError::NotFound(TransactionRef::new("x")).code().as_u16(),
            3002
        );
        let body = ReceiptError::Ledger(LedgerError::Timeout("slow".into())).to_body();
        assert!(body.retryable);
        assert_eq!(body.code, ErrorCode::FacilitatorUnavailable);
    }
}
