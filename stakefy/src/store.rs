//! Versioned record storage with compare-and-swap.
//!
//! Managers never hold a lock across ledger I/O. Instead every mutation reads a
//! [`Versioned`] snapshot, validates and edits a copy, and writes it back with
//! [`RecordStore::compare_and_swap`]. A concurrent writer bumps the version, the swap
//! fails with [`StoreError::Conflict`], and [`mutate`] re-runs the edit against the
//! fresh record.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{RecordKind, SettlementError};

/// How many times [`mutate`] re-reads a contended record before giving up.
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// A record together with its write version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Incremented on every successful write, starting at 1.
    pub version: u64,
    /// The stored record.
    pub record: T,
}

/// Errors reported by a [`RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// `insert` found an existing record with the same id.
    #[error("record {0} already exists")]
    Duplicate(String),
    /// `compare_and_swap` targeted a missing record.
    #[error("record {0} does not exist")]
    Missing(String),
    /// `compare_and_swap` lost a race with another writer.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    Conflict {
        /// Record id.
        id: String,
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },
    /// The backing store failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Storage for one kind of record, keyed by id.
#[async_trait]
pub trait RecordStore<T>: Send + Sync + fmt::Debug
where
    T: Clone + Send + Sync + 'static,
{
    /// Reads the current version of a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the store cannot be read.
    async fn get(&self, id: &str) -> Result<Option<Versioned<T>>, StoreError>;

    /// Stores a new record at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] if the id is taken.
    async fn insert(&self, id: &str, record: T) -> Result<Versioned<T>, StoreError>;

    /// Replaces a record only if it is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if another write happened first, or
    /// [`StoreError::Missing`] if the record does not exist.
    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        record: T,
    ) -> Result<Versioned<T>, StoreError>;

    /// Removes every record for which `keep` returns `false`. Returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the store cannot be written.
    async fn retain(&self, keep: &(dyn for<'a> Fn(&'a T) -> bool + Send + Sync)) -> Result<usize, StoreError>;
}

/// [`RecordStore`] backed by a sharded concurrent map.
///
/// Writes to different ids proceed in parallel; a swap holds only its own shard's
/// entry lock, and only for the version comparison and assignment.
#[derive(Debug)]
pub struct InMemoryStore<T> {
    records: DashMap<String, Versioned<T>>,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<T> InMemoryStore<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl<T> RecordStore<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    async fn get(&self, id: &str) -> Result<Option<Versioned<T>>, StoreError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, id: &str, record: T) -> Result<Versioned<T>, StoreError> {
        match self.records.entry(id.to_owned()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(id.to_owned())),
            Entry::Vacant(slot) => {
                let stored = Versioned { version: 1, record };
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        record: T,
    ) -> Result<Versioned<T>, StoreError> {
        let Some(mut current) = self.records.get_mut(id) else {
            return Err(StoreError::Missing(id.to_owned()));
        };
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_owned(),
                expected: expected_version,
                found: current.version,
            });
        }
        let stored = Versioned {
            version: expected_version + 1,
            record,
        };
        *current = stored.clone();
        Ok(stored)
    }

    async fn retain(&self, keep: &(dyn for<'a> Fn(&'a T) -> bool + Send + Sync)) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.records.retain(|_, entry| {
            let kept = keep(&entry.record);
            removed += usize::from(!kept);
            kept
        });
        Ok(removed)
    }
}

/// Outcome of one edit attempt inside [`mutate`].
#[derive(Debug)]
pub enum Step<R> {
    /// Persist the edited record and return `R`.
    Commit(R),
    /// Return `R` without writing anything.
    Skip(R),
    /// Persist the edited record, then fail with the error.
    ///
    /// Used when a read observes a transition (such as expiry) that must stick even
    /// though the requested operation is refused.
    CommitErr(SettlementError),
}

/// Applies `edit` to the record `id` under optimistic concurrency.
///
/// `edit` runs against a fresh copy of the stored record on every attempt. Returning
/// `Err` aborts without writing; the [`Step`] variants decide whether the copy is
/// persisted. Version conflicts re-run `edit` up to [`MAX_CAS_ATTEMPTS`] times.
///
/// # Errors
///
/// Returns [`SettlementError::NotFound`] for an unknown id, the error produced by
/// `edit`, or [`SettlementError::Storage`] if the record stays contended.
pub async fn mutate<T, R, F>(
    store: &dyn RecordStore<T>,
    kind: RecordKind,
    id: &str,
    mut edit: F,
) -> Result<R, SettlementError>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&mut T) -> Result<Step<R>, SettlementError>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(current) = store.get(id).await? else {
            return Err(SettlementError::not_found(kind, id));
        };
        let mut record = current.record;
        let (outcome, write) = match edit(&mut record)? {
            Step::Skip(value) => return Ok(value),
            Step::Commit(value) => (Ok(value), record),
            Step::CommitErr(err) => (Err(err), record),
        };
        match store.compare_and_swap(id, current.version, write).await {
            Ok(_) => return outcome,
            Err(StoreError::Conflict { .. }) => {}
            Err(other) => return Err(other.into()),
        }
    }
    Err(SettlementError::Storage(format!(
        "{kind} {id} stayed contended after {MAX_CAS_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn swap_requires_matching_version() {
        let store = InMemoryStore::new();
        let first = store.insert("a", 1u32).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(
            store.insert("a", 2).await,
            Err(StoreError::Duplicate("a".into()))
        );

        let second = store.compare_and_swap("a", 1, 5).await.unwrap();
        assert_eq!(second.version, 2);
        assert!(matches!(
            store.compare_and_swap("a", 1, 6).await,
            Err(StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            })
        ));
        assert_eq!(store.get("a").await.unwrap().unwrap().record, 5);
        assert_eq!(
            store.compare_and_swap("b", 1, 0).await,
            Err(StoreError::Missing("b".into()))
        );
    }

    #[tokio::test]
    async fn mutate_skips_and_commits() {
        let store = InMemoryStore::new();
        store.insert("x", 10u32).await.unwrap();

        let seen = mutate(&store, RecordKind::Budget, "x", |v| Ok(Step::Skip(*v)))
            .await
            .unwrap();
        assert_eq!(seen, 10);
        assert_eq!(store.get("x").await.unwrap().unwrap().version, 1);

        mutate(&store, RecordKind::Budget, "x", |v| {
            *v -= 3;
            Ok(Step::Commit(()))
        })
        .await
        .unwrap();
        let stored = store.get("x").await.unwrap().unwrap();
        assert_eq!((stored.version, stored.record), (2, 7));
    }

    #[tokio::test]
    async fn commit_err_persists_then_fails() {
        let store = InMemoryStore::new();
        store.insert("x", 1u32).await.unwrap();
        let err = mutate(&store, RecordKind::Channel, "x", |v| {
            *v = 0;
            Ok::<Step<()>, _>(Step::CommitErr(SettlementError::InvalidRequest(
                "closed".into(),
            )))
        })
        .await
        .unwrap_err();
        assert_eq!(err, SettlementError::InvalidRequest("closed".into()));
        assert_eq!(store.get("x").await.unwrap().unwrap().record, 0);
    }

    #[tokio::test]
    async fn retain_drops_rejected_records() {
        let store = InMemoryStore::new();
        for (id, value) in [("a", 1u32), ("b", 2), ("c", 3)] {
            store.insert(id, value).await.unwrap();
        }
        assert_eq!(store.retain(&|v| *v != 2).await, Ok(1));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.retain(&|_| true).await, Ok(0));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryStore::<u32>::new();
        let err = mutate(&store, RecordKind::Session, "nope", |_| Ok(Step::Skip(())))
            .await
            .unwrap_err();
        assert_eq!(err, SettlementError::not_found(RecordKind::Session, "nope"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("counter", 0u64).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        mutate(store.as_ref(), RecordKind::Budget, "counter", |v| {
                            *v += 1;
                            Ok(Step::Commit(()))
                        })
                        .await
                        .unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let stored = store.get("counter").await.unwrap().unwrap();
        assert_eq!(stored.record, 80);
        assert_eq!(stored.version, 81);
    }
}
