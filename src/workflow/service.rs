use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use super::order::StatusTransition;
use super::status::OrderStatus;
use super::store::{StatusStore, StoreError};
use crate::resilience::{CallContext, ProtectedError, ProtectedOperation};

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Status and history disagree; the order needs operator attention.
    #[error("status and history of order '{order_id}' diverged: {detail}")]
    Consistency { order_id: String, detail: String },

    #[error("order '{order_id}' cannot advance automatically from {status}")]
    CannotAdvance { order_id: String, status: OrderStatus },

    #[error("order '{0}' has no recorded status")]
    NotFound(String),

    #[error(transparent)]
    Dependency(#[from] ProtectedError<StoreError>),
}

impl WorkflowError {
    /// A consistency failure stays fatal whichever way the call ended.
    fn from_store(err: ProtectedError<StoreError>) -> Self {
        if let Some(StoreError::Consistency { order_id, detail }) = err.last_error() {
            error!(order_id = %order_id, event = "consistency_failure", detail = %detail, "status and history diverged");
            return WorkflowError::Consistency {
                order_id: order_id.clone(),
                detail: detail.clone(),
            };
        }
        WorkflowError::Dependency(err)
    }
}

#[derive(Clone, Copy)]
enum Target {
    Explicit(OrderStatus),
    Next,
}

/// Serializes transitions per order so two writers never read the same
/// `from_status`.
#[derive(Default)]
struct OrderLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OrderLocks {
    async fn acquire(&self, order_id: &str) -> OrderGuard<'_> {
        let lock = self
            .locks
            .lock()
            .entry(order_id.to_string())
            .or_default()
            .clone();
        // Built before waiting so a caller dropped mid-wait still cleans up.
        let mut guard = OrderGuard {
            locks: self,
            order_id: order_id.to_string(),
            held: None,
        };
        guard.held = Some(lock.lock_owned().await);
        guard
    }
}

/// Holds one order's lock; dropping it, even on cancellation, removes the
/// map entry once no other task holds or waits on it.
struct OrderGuard<'a> {
    locks: &'a OrderLocks,
    order_id: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self.locks.locks.lock();
        if locks
            .get(&self.order_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.order_id);
        }
    }
}

/// Records order status changes through a protected store.
///
/// Every write runs as one unit inside `protected`, so a store outage fails
/// the whole transition instead of splitting status from history.
pub struct StatusWorkflow<S> {
    store: Arc<S>,
    protected: ProtectedOperation,
    locks: OrderLocks,
}

impl<S: StatusStore> StatusWorkflow<S> {
    pub fn new(store: Arc<S>, protected: ProtectedOperation) -> Self {
        Self {
            store,
            protected,
            locks: OrderLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn protected(&self) -> &ProtectedOperation {
        &self.protected
    }

    /// Move `order_id` to `to_status`, whatever its current status.
    ///
    /// Out-of-order moves are recorded as [`TransitionKind::Override`](super::TransitionKind::Override)
    /// rather than refused.
    pub async fn transition(
        &self,
        ctx: &CallContext,
        order_id: &str,
        to_status: OrderStatus,
        changed_by: &str,
        reason: &str,
    ) -> Result<StatusTransition, WorkflowError> {
        self.apply(ctx, order_id, Target::Explicit(to_status), changed_by, reason)
            .await
    }

    /// Move `order_id` one stage forward along the pipeline.
    ///
    /// Refused for unknown orders, side states and the terminal stage.
    pub async fn advance(
        &self,
        ctx: &CallContext,
        order_id: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<StatusTransition, WorkflowError> {
        self.apply(ctx, order_id, Target::Next, changed_by, reason).await
    }

    pub async fn current_status(
        &self,
        ctx: &CallContext,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, WorkflowError> {
        self.protected
            .execute(ctx, move || self.store.read_status(order_id))
            .await
            .map_err(WorkflowError::from_store)
    }

    pub async fn history(
        &self,
        ctx: &CallContext,
        order_id: &str,
    ) -> Result<Vec<StatusTransition>, WorkflowError> {
        self.protected
            .execute(ctx, move || self.store.history(order_id))
            .await
            .map_err(WorkflowError::from_store)
    }

    async fn apply(
        &self,
        ctx: &CallContext,
        order_id: &str,
        target: Target,
        changed_by: &str,
        reason: &str,
    ) -> Result<StatusTransition, WorkflowError> {
        let guard = self.locks.acquire(order_id).await;

        let outcome = self
            .protected
            .execute(ctx, move || async move {
                let from = self.store.read_status(order_id).await?;
                let to = match target {
                    Target::Explicit(status) => status,
                    Target::Next => match from.and_then(OrderStatus::next) {
                        Some(next) => next,
                        None => return Ok::<_, StoreError>(Err(from)),
                    },
                };
                let record = StatusTransition::new(order_id, from, to, changed_by, reason);
                self.store.commit_transition(&record).await?;
                Ok::<_, StoreError>(Ok(record))
            })
            .await;

        drop(guard);

        let record = match outcome.map_err(WorkflowError::from_store)? {
            Ok(record) => record,
            Err(Some(status)) => {
                return Err(WorkflowError::CannotAdvance {
                    order_id: order_id.to_string(),
                    status,
                });
            }
            Err(None) => return Err(WorkflowError::NotFound(order_id.to_string())),
        };

        let from = record
            .from_status
            .map_or_else(|| "NONE".to_string(), |s| s.to_string());
        if record.kind.is_out_of_order() {
            warn!(
                order_id,
                event = "status_transition",
                from = %from,
                to = %record.to_status,
                kind = %record.kind,
                changed_by,
                "out-of-order status change recorded"
            );
        } else {
            info!(
                order_id,
                event = "status_transition",
                from = %from,
                to = %record.to_status,
                kind = %record.kind,
                changed_by,
                "status changed"
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerConfig, BreakerState, CircuitBreaker, RetryPolicy};
    use crate::workflow::order::history_is_consistent;
    use crate::workflow::store::InMemoryStatusStore;
    use crate::workflow::TransitionKind;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    /// In-memory tables behind injectable faults and artificial latency.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryStatusStore,
        /// Fail this many upcoming reads with a transient error.
        outages: AtomicU32,
        fail_appends: AtomicBool,
        fail_undo: AtomicBool,
        writes: AtomicU32,
        latency: Duration,
    }

    impl FaultyStore {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        fn slow() -> Self {
            Self::with_latency(Duration::from_millis(5))
        }

        async fn pause(&self) {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }
    }

    impl StatusStore for FaultyStore {
        async fn read_status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError> {
            self.pause().await;
            let pending = self.outages.load(Ordering::SeqCst);
            if pending > 0 {
                self.outages.store(pending - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.read_status(order_id).await
        }

        async fn write_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
            self.pause().await;
            let is_undo = self.writes.fetch_add(1, Ordering::SeqCst) % 2 == 1;
            if is_undo && self.fail_undo.load(Ordering::SeqCst) {
                return Err(StoreError::Timeout);
            }
            self.inner.write_status(order_id, status).await
        }

        async fn append_history(&self, record: &StatusTransition) -> Result<(), StoreError> {
            self.pause().await;
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("history table read-only".into()));
            }
            self.inner.append_history(record).await
        }

        async fn history(&self, order_id: &str) -> Result<Vec<StatusTransition>, StoreError> {
            self.inner.history(order_id).await
        }
    }

    fn protected() -> ProtectedOperation {
        let breaker = CircuitBreaker::new(
            "orders-db",
            BreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 30_000,
                success_threshold: 1,
            },
        );
        ProtectedOperation::new(
            Arc::new(breaker),
            RetryPolicy {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                ..RetryPolicy::default()
            },
        )
    }

    fn workflow<S: StatusStore>(store: S) -> StatusWorkflow<S> {
        StatusWorkflow::new(Arc::new(store), protected())
    }

    async fn seed<S: StatusStore>(wf: &StatusWorkflow<S>, order_id: &str) {
        wf.transition(&CallContext::new(), order_id, OrderStatus::OrderProcessed, "pos-import", "new order")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_transition_has_no_from_status() {
        let wf = workflow(InMemoryStatusStore::new());
        let record = wf
            .transition(&CallContext::new(), "o-1", OrderStatus::OrderProcessed, "pos-import", "new order")
            .await
            .unwrap();

        assert_eq!(record.from_status, None);
        assert_eq!(record.to_status, OrderStatus::OrderProcessed);
        assert_eq!(record.kind, TransitionKind::Initial);
    }

    #[tokio::test(start_paused = true)]
    async fn transition_records_from_and_to() {
        let wf = workflow(InMemoryStatusStore::new());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;

        let record = wf
            .transition(&ctx, "o-1", OrderStatus::MaterialsOrdered, "jay", "ordered frame")
            .await
            .unwrap();

        assert_eq!(record.from_status, Some(OrderStatus::OrderProcessed));
        assert_eq!(record.to_status, OrderStatus::MaterialsOrdered);
        assert_eq!(record.changed_by, "jay");
        assert_eq!(record.reason, "ordered frame");
        assert_eq!(
            wf.current_status(&ctx, "o-1").await.unwrap(),
            Some(OrderStatus::MaterialsOrdered)
        );

        let history = wf.history(&ctx, "o-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last(), Some(&record));
    }

    #[tokio::test(start_paused = true)]
    async fn advance_walks_the_whole_pipeline() {
        let wf = workflow(InMemoryStatusStore::new());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;

        for expected in &OrderStatus::PIPELINE[1..] {
            let record = wf.advance(&ctx, "o-1", "system", "auto").await.unwrap();
            assert_eq!(record.to_status, *expected);
            assert_eq!(record.kind, TransitionKind::Advance);
        }

        let err = wf.advance(&ctx, "o-1", "system", "auto").await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::CannotAdvance {
                status: OrderStatus::PickedUp,
                ..
            }
        ));
        assert!(wf.store().is_consistent("o-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn advance_refuses_side_states_and_unknown_orders() {
        let wf = workflow(InMemoryStatusStore::new());
        let ctx = CallContext::new();

        let err = wf.advance(&ctx, "ghost", "system", "auto").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(ref id) if id == "ghost"));

        seed(&wf, "o-1").await;
        let delayed = wf
            .transition(&ctx, "o-1", OrderStatus::Delayed, "jay", "glass back-ordered")
            .await
            .unwrap();
        assert_eq!(delayed.kind, TransitionKind::SideTrack);

        let err = wf.advance(&ctx, "o-1", "system", "auto").await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::CannotAdvance {
                status: OrderStatus::Delayed,
                ..
            }
        ));

        let resumed = wf
            .transition(&ctx, "o-1", OrderStatus::MaterialsArrived, "jay", "glass in")
            .await
            .unwrap();
        assert_eq!(resumed.kind, TransitionKind::Resume);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_is_recorded_not_refused() {
        let wf = workflow(InMemoryStatusStore::new());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;

        let jump = wf
            .transition(&ctx, "o-1", OrderStatus::Prepped, "jay", "fixing mis-recorded stage")
            .await
            .unwrap();
        assert_eq!(jump.kind, TransitionKind::Override);

        let back = wf
            .transition(&ctx, "o-1", OrderStatus::FrameCut, "jay", "wrong order")
            .await
            .unwrap();
        assert_eq!(back.from_status, Some(OrderStatus::Prepped));
        assert_eq!(back.kind, TransitionKind::Override);
        assert!(wf.store().is_consistent("o-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_outage_is_retried() {
        let store = FaultyStore::default();
        store.outages.store(2, Ordering::SeqCst);
        let wf = workflow(store);

        let record = wf
            .transition(&CallContext::new(), "o-1", OrderStatus::OrderProcessed, "system", "new")
            .await
            .unwrap();

        assert_eq!(record.to_status, OrderStatus::OrderProcessed);
        assert_eq!(wf.protected().breaker().state(), BreakerState::Closed);
        assert!(wf.store().inner.is_consistent("o-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_append_leaves_status_untouched() {
        let wf = workflow(FaultyStore::default());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;
        wf.store().fail_appends.store(true, Ordering::SeqCst);

        let err = wf
            .transition(&ctx, "o-1", OrderStatus::MaterialsOrdered, "jay", "ordered frame")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Dependency(ProtectedError::NonRetryable { attempts: 1, .. })
        ));
        let store = &wf.store().inner;
        assert_eq!(
            store.read_status("o-1").await.unwrap(),
            Some(OrderStatus::OrderProcessed)
        );
        assert!(store.is_consistent("o-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_surfaces_consistency_error() {
        let wf = workflow(FaultyStore::default());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;
        wf.store().writes.store(0, Ordering::SeqCst);
        wf.store().fail_appends.store(true, Ordering::SeqCst);
        wf.store().fail_undo.store(true, Ordering::SeqCst);

        let err = wf
            .transition(&ctx, "o-1", OrderStatus::MaterialsOrdered, "jay", "ordered frame")
            .await
            .unwrap_err();

        match err {
            WorkflowError::Consistency { order_id, .. } => assert_eq!(order_id, "o-1"),
            other => panic!("expected consistency error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_transition_without_touching_store() {
        let store = FaultyStore::default();
        store.outages.store(100, Ordering::SeqCst);
        let wf = workflow(store);
        let ctx = CallContext::new();

        for _ in 0..2 {
            let err = wf
                .transition(&ctx, "o-1", OrderStatus::OrderProcessed, "system", "new")
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                WorkflowError::Dependency(ProtectedError::Exhausted { attempts: 4, .. })
            ));
        }
        assert_eq!(wf.protected().breaker().state(), BreakerState::Open);

        let outages_before = wf.store().outages.load(Ordering::SeqCst);
        let err = wf
            .transition(&ctx, "o-1", OrderStatus::OrderProcessed, "system", "new")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Dependency(ref e) if e.is_unavailable()));
        assert_eq!(wf.store().outages.load(Ordering::SeqCst), outages_before);
        assert_eq!(wf.store().inner.read_status("o-1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_transitions_on_one_order_are_serialized() {
        let wf = workflow(FaultyStore::slow());
        let ctx = CallContext::new();
        seed(&wf, "o-1").await;

        let targets = [
            OrderStatus::MaterialsOrdered,
            OrderStatus::Delayed,
            OrderStatus::MaterialsArrived,
            OrderStatus::FrameCut,
            OrderStatus::MatCut,
        ];
        let results = join_all(
            targets
                .iter()
                .map(|to| wf.transition(&ctx, "o-1", *to, "station", "scan")),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));

        let history = wf.history(&ctx, "o-1").await.unwrap();
        assert_eq!(history.len(), 6);
        let current = wf.current_status(&ctx, "o-1").await.unwrap();
        assert!(history_is_consistent(&history, current));
        assert!(wf.locks.locks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_transitions_leave_no_lock_entries() {
        let wf = workflow(FaultyStore::with_latency(Duration::from_secs(10)));
        let ctx = CallContext::new();

        for i in 0..20 {
            let id = format!("o-{}", i % 4);
            let attempt = tokio::time::timeout(
                Duration::from_millis(1),
                wf.transition(&ctx, &id, OrderStatus::OrderProcessed, "system", "new"),
            )
            .await;
            assert!(attempt.is_err());
        }
        assert!(wf.locks.locks.lock().is_empty());

        // One holder and two waiters on the same order, all abandoned.
        let abandoned = join_all((0..3).map(|_| {
            tokio::time::timeout(
                Duration::from_millis(1),
                wf.transition(&ctx, "o-busy", OrderStatus::OrderProcessed, "system", "new"),
            )
        }))
        .await;
        assert!(abandoned.iter().all(Result::is_err));
        assert!(wf.locks.locks.lock().is_empty());
        assert_eq!(wf.store().inner.read_status("o-busy").await.unwrap(), None);
    }

    #[test]
    fn consistency_failure_stays_fatal_after_retries() {
        let err = WorkflowError::from_store(ProtectedError::Exhausted {
            dependency: "orders-db".into(),
            attempts: 3,
            breaker: BreakerState::Closed,
            source: StoreError::Consistency {
                order_id: "o-1".into(),
                detail: "rollback failed".into(),
            },
        });
        assert!(matches!(
            err,
            WorkflowError::Consistency { ref order_id, .. } if order_id == "o-1"
        ));

        let outage = WorkflowError::from_store(ProtectedError::Exhausted {
            dependency: "orders-db".into(),
            attempts: 3,
            breaker: BreakerState::Closed,
            source: StoreError::Timeout,
        });
        assert!(matches!(outage, WorkflowError::Dependency(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_on_different_orders_run_independently() {
        let wf = Arc::new(workflow(FaultyStore::slow()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let wf = wf.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("o-{i}");
                wf.transition(&CallContext::new(), &id, OrderStatus::OrderProcessed, "system", "new")
                    .await
                    .map(|r| r.order_id)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(wf.store().inner.order_ids().len(), 4);
    }
}
