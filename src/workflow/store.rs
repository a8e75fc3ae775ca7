//! Persistence collaborator for order status and its history.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use thiserror::Error;

use super::order::{StatusTransition, history_is_consistent};
use super::status::OrderStatus;
use crate::error::{Classify, ErrorClass};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    /// Status and history no longer agree; never retried.
    #[error("status and history of order '{order_id}' diverged: {detail}")]
    Consistency { order_id: String, detail: String },
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout => ErrorClass::Transient,
            StoreError::NotFound(_) | StoreError::Rejected(_) | StoreError::Consistency { .. } => {
                ErrorClass::NonRetryable
            }
        }
    }
}

/// Where order status and transition history live.
///
/// Implementors supply the three primitive operations plus the history read.
/// [`commit_transition`](Self::commit_transition) combines them into one unit;
/// stores with real transactions should override it.
pub trait StatusStore: Send + Sync {
    /// Current status, or `None` if nothing was ever recorded for the order.
    fn read_status(
        &self,
        order_id: &str,
    ) -> impl Future<Output = Result<Option<OrderStatus>, StoreError>> + Send;

    fn write_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn append_history(
        &self,
        record: &StatusTransition,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every transition recorded for the order, oldest first.
    fn history(
        &self,
        order_id: &str,
    ) -> impl Future<Output = Result<Vec<StatusTransition>, StoreError>> + Send;

    /// Forget the status of an order that has no history yet.
    ///
    /// Only used to undo a first write whose history append failed.
    fn remove_status(&self, order_id: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        let order_id = order_id.to_string();
        async move {
            Err(StoreError::Rejected(format!(
                "store cannot remove status of '{order_id}'"
            )))
        }
    }

    /// Write `record.to_status` and append `record` as one unit.
    ///
    /// If the append fails the status write is undone and the append error
    /// returned. If the undo fails too, the order is left inconsistent and
    /// [`StoreError::Consistency`] is returned.
    fn commit_transition(
        &self,
        record: &StatusTransition,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        async move {
            self.write_status(&record.order_id, record.to_status).await?;

            let Err(append_err) = self.append_history(record).await else {
                return Ok(());
            };

            let undo = match record.from_status {
                Some(previous) => self.write_status(&record.order_id, previous).await,
                None => self.remove_status(&record.order_id).await,
            };
            match undo {
                Ok(()) => Err(append_err),
                Err(undo_err) => Err(StoreError::Consistency {
                    order_id: record.order_id.clone(),
                    detail: format!(
                        "history append failed ({append_err}) and status rollback failed ({undo_err})"
                    ),
                }),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    statuses: HashMap<String, OrderStatus>,
    history: HashMap<String, Vec<StatusTransition>>,
}

/// Process-local store used by the CLI and tests.
///
/// Status and history share one lock, so `commit_transition` is atomic here
/// without needing the rollback path.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    tables: Mutex<Tables>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.lock().statuses.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check that the stored history of `order_id` ends at its stored status.
    pub fn is_consistent(&self, order_id: &str) -> bool {
        let tables = self.tables.lock();
        let history = tables.history.get(order_id).map(Vec::as_slice).unwrap_or_default();
        history_is_consistent(history, tables.statuses.get(order_id).copied())
    }
}

impl StatusStore for InMemoryStatusStore {
    async fn read_status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError> {
        Ok(self.tables.lock().statuses.get(order_id).copied())
    }

    async fn write_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
        self.tables.lock().statuses.insert(order_id.to_string(), status);
        Ok(())
    }

    async fn append_history(&self, record: &StatusTransition) -> Result<(), StoreError> {
        self.tables
            .lock()
            .history
            .entry(record.order_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn history(&self, order_id: &str) -> Result<Vec<StatusTransition>, StoreError> {
        Ok(self.tables.lock().history.get(order_id).cloned().unwrap_or_default())
    }

    async fn remove_status(&self, order_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.history.get(order_id).is_some_and(|h| !h.is_empty()) {
            return Err(StoreError::Rejected(format!(
                "order '{order_id}' already has history"
            )));
        }
        tables.statuses.remove(order_id);
        Ok(())
    }

    async fn commit_transition(&self, record: &StatusTransition) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables
            .statuses
            .insert(record.order_id.clone(), record.to_status);
        tables
            .history
            .entry(record.order_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Delegates to the in-memory tables but can fail appends and undo writes.
    #[derive(Default)]
    struct BrokenAppends {
        inner: InMemoryStatusStore,
        writes: AtomicU32,
        fail_undo: AtomicBool,
    }

    impl StatusStore for BrokenAppends {
        async fn read_status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError> {
            self.inner.read_status(order_id).await
        }

        async fn write_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
            // The second write of a commit is the undo.
            let is_undo = self.writes.fetch_add(1, Ordering::SeqCst) > 0;
            if is_undo && self.fail_undo.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout);
            }
            self.inner.write_status(order_id, status).await
        }

        async fn append_history(&self, _record: &StatusTransition) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("history table locked".into()))
        }

        async fn history(&self, order_id: &str) -> Result<Vec<StatusTransition>, StoreError> {
            self.inner.history(order_id).await
        }
    }

    #[test]
    fn errors_are_classified() {
        assert_eq!(StoreError::Timeout.class(), ErrorClass::Transient);
        assert_eq!(StoreError::Unavailable("x".into()).class(), ErrorClass::Transient);
        assert_eq!(StoreError::NotFound("x".into()).class(), ErrorClass::NonRetryable);
        let consistency = StoreError::Consistency {
            order_id: "o".into(),
            detail: "d".into(),
        };
        assert_eq!(consistency.class(), ErrorClass::NonRetryable);
    }

    #[tokio::test]
    async fn memory_store_commits_status_and_history_together() {
        let store = InMemoryStatusStore::new();
        let record = StatusTransition::new("o-1", None, OrderStatus::OrderProcessed, "system", "new");
        store.commit_transition(&record).await.unwrap();

        assert_eq!(store.read_status("o-1").await.unwrap(), Some(OrderStatus::OrderProcessed));
        assert_eq!(store.history("o-1").await.unwrap(), vec![record]);
        assert!(store.is_consistent("o-1"));
        assert_eq!(store.order_ids(), vec!["o-1"]);
    }

    #[tokio::test]
    async fn unknown_order_reads_as_empty() {
        let store = InMemoryStatusStore::new();
        assert_eq!(store.read_status("nope").await.unwrap(), None);
        assert!(store.history("nope").await.unwrap().is_empty());
        assert!(store.is_consistent("nope"));
    }

    #[tokio::test]
    async fn failed_append_rolls_back_status() {
        let store = BrokenAppends::default();
        store
            .inner
            .commit_transition(&StatusTransition::new("o", None, OrderStatus::OrderProcessed, "s", ""))
            .await
            .unwrap();

        let record = StatusTransition::new(
            "o",
            Some(OrderStatus::OrderProcessed),
            OrderStatus::MaterialsOrdered,
            "jay",
            "ordered frame",
        );
        let err = store.commit_transition(&record).await.unwrap_err();

        assert_eq!(err, StoreError::Unavailable("history table locked".into()));
        assert_eq!(store.read_status("o").await.unwrap(), Some(OrderStatus::OrderProcessed));
        assert!(store.inner.is_consistent("o"));
    }

    #[tokio::test]
    async fn failed_first_append_without_remove_is_inconsistent() {
        let store = BrokenAppends::default();
        let record = StatusTransition::new("fresh", None, OrderStatus::OrderProcessed, "s", "");
        let err = store.commit_transition(&record).await.unwrap_err();

        // The default remove_status refuses, so the order is left inconsistent.
        assert!(matches!(err, StoreError::Consistency { .. }));
    }

    #[tokio::test]
    async fn memory_store_removes_status_of_order_without_history() {
        let store = InMemoryStatusStore::new();
        store.write_status("fresh", OrderStatus::OrderProcessed).await.unwrap();

        store.remove_status("fresh").await.unwrap();

        assert_eq!(store.read_status("fresh").await.unwrap(), None);
        assert!(store.is_consistent("fresh"));
        assert!(store.order_ids().is_empty());
    }

    #[tokio::test]
    async fn memory_store_refuses_to_remove_status_with_history() {
        let store = InMemoryStatusStore::new();
        let record = StatusTransition::new("o", None, OrderStatus::OrderProcessed, "s", "");
        store.commit_transition(&record).await.unwrap();

        let err = store.remove_status("o").await.unwrap_err();

        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.read_status("o").await.unwrap(), Some(OrderStatus::OrderProcessed));
    }

    #[tokio::test]
    async fn failed_rollback_is_a_consistency_error() {
        let store = BrokenAppends::default();
        store
            .inner
            .commit_transition(&StatusTransition::new("o", None, OrderStatus::OrderProcessed, "s", ""))
            .await
            .unwrap();
        store.fail_undo.store(true, Ordering::SeqCst);

        let record = StatusTransition::new("o", Some(OrderStatus::OrderProcessed), OrderStatus::Delayed, "jay", "");
        let err = store.commit_transition(&record).await.unwrap_err();

        match err {
            StoreError::Consistency { order_id, detail } => {
                assert_eq!(order_id, "o");
                assert!(detail.contains("history table locked"));
                assert!(detail.contains("timed out"));
            }
            other => panic!("expected consistency error, got {other:?}"),
        }
        assert!(!store.inner.is_consistent("o"));
    }
}
