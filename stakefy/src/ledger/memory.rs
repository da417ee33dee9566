//! In-process ledger used by the development server and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{Ledger, LedgerError, TransactionRecord, TransactionRef, TransferLeg};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<String, Decimal>,
    transactions: HashMap<TransactionRef, TransactionRecord>,
    applied_keys: HashMap<String, TransactionRef>,
    height: u64,
}

/// A ledger that keeps balances in memory.
///
/// Multi-leg transfers are applied atomically and deduplicated by idempotency key.
/// [`InMemoryLedger::fail_next`] injects transient failures and
/// [`InMemoryLedger::lose_next_transfer_ack`] injects timeouts after a transfer has
/// landed, so retry paths can be exercised.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    pending_failures: AtomicU32,
    lost_acks: AtomicU32,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `amount` to `address`, as if an external payer had funded it.
    pub fn credit(&self, address: &str, amount: Decimal) {
        let mut state = self.state();
        *state.balances.entry(address.to_owned()).or_default() += amount;
    }

    /// Current balance of `address`. Unknown addresses hold nothing.
    #[must_use]
    pub fn balance(&self, address: &str) -> Decimal {
        self.state()
            .balances
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    /// Number of transactions recorded so far.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.state().transactions.len()
    }

    /// Makes the next `count` calls fail with [`LedgerError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` successful transfers report [`LedgerError::Timeout`]
    /// even though their funds moved.
    pub fn lose_next_transfer_ack(&self, count: u32) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), LedgerError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(LedgerError::Unavailable("injected failure".to_owned()))
        } else {
            Ok(())
        }
    }
}

/// Random base58 string of `blocks * 16` bytes, shaped like a Solana key or signature.
fn random_base58(blocks: usize) -> String {
    let bytes: Vec<u8> = (0..blocks)
        .flat_map(|_| Uuid::new_v4().into_bytes())
        .collect();
    bs58::encode(bytes).into_string()
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn generate_deposit_address(&self) -> Result<String, LedgerError> {
        self.injected_failure()?;
        let address = random_base58(2);
        self.state().balances.insert(address.clone(), Decimal::ZERO);
        Ok(address)
    }

    async fn check_balance(&self, address: &str, min_amount: Decimal) -> Result<bool, LedgerError> {
        self.injected_failure()?;
        Ok(self.balance(address) >= min_amount)
    }

    async fn get_transaction(
        &self,
        reference: &TransactionRef,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        self.injected_failure()?;
        Ok(self.state().transactions.get(reference).cloned())
    }

    async fn transfer_many(
        &self,
        from: &str,
        legs: &[TransferLeg],
        idempotency_key: Option<&str>,
    ) -> Result<TransactionRef, LedgerError> {
        self.injected_failure()?;
        if legs.is_empty() {
            return Err(LedgerError::Rejected("transfer has no legs".to_owned()));
        }
        if let Some(leg) = legs.iter().find(|leg| leg.amount <= Decimal::ZERO) {
            return Err(LedgerError::Rejected(format!(
                "non-positive amount {} to {}",
                leg.amount, leg.to
            )));
        }

        let mut state = self.state();
        let applied = idempotency_key.and_then(|key| Some((key, state.applied_keys.get(key)?)));
        if let Some((key, reference)) = applied {
            let landed = state.transactions.get(reference);
            if landed.is_some_and(|record| record.from == from && record.legs == legs) {
                return Ok(reference.clone());
            }
            return Err(LedgerError::Rejected(format!(
                "idempotency key {key} was used for a different transfer"
            )));
        }

        let total = legs
            .iter()
            .try_fold(Decimal::ZERO, |sum, leg| sum.checked_add(leg.amount))
            .ok_or_else(|| LedgerError::Rejected("transfer total overflows".to_owned()))?;
        let available = state.balances.get(from).copied().unwrap_or_default();
        if available < total {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds in {from}: have {available}, need {total}"
            )));
        }

        *state.balances.entry(from.to_owned()).or_default() -= total;
        for leg in legs {
            *state.balances.entry(leg.to.clone()).or_default() += leg.amount;
        }
        state.height += 1;

        let reference = TransactionRef::new(random_base58(4));
        let record = TransactionRecord {
            reference: reference.clone(),
            from: from.to_owned(),
            legs: legs.to_vec(),
            block_height: state.height,
            block_time: Some(UnixTimestamp::now()),
            succeeded: true,
        };
        state.transactions.insert(reference.clone(), record);
        if let Some(key) = idempotency_key {
            state.applied_keys.insert(key.to_owned(), reference.clone());
        }
        drop(state);

        let ack_lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ack_lost {
            return Err(LedgerError::Timeout(format!(
                "transfer {reference} landed but the reply was lost"
            )));
        }
        Ok(reference)
    }
}
