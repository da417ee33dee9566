//! Status transitions shared by sessions, budgets and channels.
//!
//! Expiry is applied lazily: whenever a record is read or written, [`Observe::observe`]
//! moves it into its expired state if the deadline passed. The transition is persisted
//! through the same compare-and-swap path as any other write, so once one reader has
//! observed expiry every later reader sees it too.
//!
//! Settlement of sessions and channels is tracked with [`SettlementState`]. A
//! settlement is claimed before any funds move and completed or released afterwards,
//! so two concurrent settle calls can never both reach the ledger.

use serde::{Deserialize, Serialize};

use crate::error::{RecordKind, SettlementError};
use crate::ledger::TransactionRef;
use crate::store::{RecordStore, Step, mutate};
use crate::timestamp::UnixTimestamp;

/// A record whose status can change merely because time passed.
pub trait Observe {
    /// Applies any transition implied by `now`. Returns `true` if the record changed.
    fn observe(&mut self, now: UnixTimestamp) -> bool;
}

/// Reads a record, applying and persisting any pending time-driven transition.
///
/// # Errors
///
/// Returns [`SettlementError::NotFound`] for unknown ids, or a storage error.
pub async fn observe_record<T>(
    store: &dyn RecordStore<T>,
    kind: RecordKind,
    id: &str,
    now: UnixTimestamp,
) -> Result<T, SettlementError>
where
    T: Observe + Clone + Send + Sync + 'static,
{
    mutate(store, kind, id, |record| {
        let snapshot = if record.observe(now) {
            Step::Commit(record.clone())
        } else {
            Step::Skip(record.clone())
        };
        Ok(snapshot)
    })
    .await
}

/// Refuses an operation. If `observed` is set the record was just moved by
/// [`Observe::observe`], so the transition is persisted before failing.
pub(crate) fn refuse<R>(observed: bool, err: SettlementError) -> Result<Step<R>, SettlementError> {
    if observed {
        Ok(Step::CommitErr(err))
    } else {
        Err(err)
    }
}

/// Progress of moving a record's funds on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SettlementState {
    /// No settlement attempted yet, or the last attempt failed.
    #[default]
    Unsettled,
    /// A settle call holds the claim and is talking to the ledger.
    #[serde(rename_all = "camelCase")]
    InProgress {
        /// When the claim was taken.
        started_at: UnixTimestamp,
    },
    /// Funds moved. `signature` is `None` when there was nothing to move.
    #[serde(rename_all = "camelCase")]
    Settled {
        /// Ledger transaction that moved the funds.
        signature: Option<TransactionRef>,
        /// When settlement completed.
        settled_at: UnixTimestamp,
    },
}

impl SettlementState {
    /// Returns `true` once funds have moved.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }

    /// Returns `true` while a settle call holds the claim.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }

    /// Takes the settlement claim.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::AlreadySettled`] after a completed settlement, or
    /// [`SettlementError::InvalidState`] while another settle call holds the claim.
    pub fn claim(
        &mut self,
        kind: RecordKind,
        id: &str,
        now: UnixTimestamp,
    ) -> Result<(), SettlementError> {
        match self {
            Self::Unsettled => {
                *self = Self::InProgress { started_at: now };
                Ok(())
            }
            Self::InProgress { .. } => Err(SettlementError::InvalidState {
                kind,
                id: id.to_owned(),
                status: "settling".to_owned(),
                operation: "settle",
            }),
            Self::Settled { .. } => Err(SettlementError::AlreadySettled {
                kind,
                id: id.to_owned(),
            }),
        }
    }

    /// Drops a claim after a failed ledger call. Returns `true` if a claim was held.
    pub fn release(&mut self) -> bool {
        if self.is_in_progress() {
            *self = Self::Unsettled;
            true
        } else {
            false
        }
    }

    /// Records a completed settlement.
    pub fn complete(&mut self, signature: Option<TransactionRef>, settled_at: UnixTimestamp) {
        *self = Self::Settled {
            signature,
            settled_at,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_and_final() {
        let now = UnixTimestamp::from_secs(1);
        let mut state = SettlementState::default();
        state.claim(RecordKind::Session, "s", now).unwrap();
        assert!(state.is_in_progress());
        assert!(matches!(
            state.claim(RecordKind::Session, "s", now),
            Err(SettlementError::InvalidState { .. })
        ));

        assert!(state.release());
        assert!(!state.release());
        state.claim(RecordKind::Session, "s", now).unwrap();
        state.complete(Some(TransactionRef::new("sig")), now);
        assert!(state.is_settled());
        assert_eq!(
            state.claim(RecordKind::Session, "s", now),
            Err(SettlementError::AlreadySettled {
                kind: RecordKind::Session,
                id: "s".into()
            })
        );
    }

    #[test]
    fn serializes_with_state_tag() {
        let state = SettlementState::Settled {
            signature: Some(TransactionRef::new("abc")),
            settled_at: UnixTimestamp::from_secs(9),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "settled");
        assert_eq!(json["signature"], "abc");
        assert_eq!(json["settledAt"], "9");
    }
}
