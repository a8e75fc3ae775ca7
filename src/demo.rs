//! End-to-end run of the status workflow against unreliable dependencies.
//!
//! Orders are recorded, advanced stage by stage through a flaky database,
//! customers are texted in paced batches, and notified orders are picked up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Days, Utc};
use futures::future::join_all;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FramewrightConfig;
use crate::error::{Classify, ErrorClass};
use crate::resilience::{BreakerMetrics, CallContext, DependencyClass};
use crate::ui::DemoProgress;
use crate::workflow::{
    InMemoryStatusStore, OrderStatus, Priority, StatusStore, StatusTransition, StatusWorkflow,
    StoreError, WorkItem, WorkflowError,
};

/// Name under which the order database is registered.
pub const ORDERS_DB: &str = "orders-db";
/// Name under which the SMS gateway is registered.
pub const SMS_GATEWAY: &str = "sms-gateway";

/// In-memory tables that drop a share of calls on the floor.
pub struct FlakyStore {
    inner: InMemoryStatusStore,
    failure_rate: f64,
}

impl FlakyStore {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            inner: InMemoryStatusStore::new(),
            failure_rate,
        }
    }

    /// The tables without the simulated outages.
    pub fn inner(&self) -> &InMemoryStatusStore {
        &self.inner
    }

    fn roll(&self) -> Result<(), StoreError> {
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            Err(StoreError::Unavailable("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

impl StatusStore for FlakyStore {
    async fn read_status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError> {
        self.roll()?;
        self.inner.read_status(order_id).await
    }

    async fn write_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
        self.roll()?;
        self.inner.write_status(order_id, status).await
    }

    async fn append_history(&self, record: &StatusTransition) -> Result<(), StoreError> {
        self.roll()?;
        self.inner.append_history(record).await
    }

    async fn history(&self, order_id: &str) -> Result<Vec<StatusTransition>, StoreError> {
        self.roll()?;
        self.inner.history(order_id).await
    }

    async fn remove_status(&self, order_id: &str) -> Result<(), StoreError> {
        self.inner.remove_status(order_id).await
    }

    // One roll per commit: the tables apply status and history under one lock.
    async fn commit_transition(&self, record: &StatusTransition) -> Result<(), StoreError> {
        self.roll()?;
        self.inner.commit_transition(record).await
    }
}

#[derive(Debug, Clone, Error)]
pub enum SmsError {
    #[error("carrier error")]
    Carrier,
    #[error("throttled by carrier")]
    Throttled,
}

impl Classify for SmsError {
    fn class(&self) -> ErrorClass {
        match self {
            SmsError::Carrier => ErrorClass::Transient,
            SmsError::Throttled => ErrorClass::RateLimited,
        }
    }
}

/// Pretend SMS provider.
pub struct SmsGateway {
    failure_rate: f64,
}

impl SmsGateway {
    pub fn new(failure_rate: f64) -> Self {
        Self { failure_rate }
    }

    /// Send a pickup notice, returning the provider's message id.
    pub async fn send(&self, order_id: &str) -> Result<String, SmsError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let outcome = {
            let mut rng = rand::thread_rng();
            if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate) {
                Err(if rng.gen_bool(0.5) {
                    SmsError::Carrier
                } else {
                    SmsError::Throttled
                })
            } else {
                Ok(())
            }
        };
        outcome.map(|()| format!("sms-{order_id}"))
    }
}

/// What a demo run left behind.
#[derive(Debug)]
pub struct DemoReport {
    /// Orders in scheduling order with their final status.
    pub orders: Vec<WorkItem>,
    /// Full history per order, read straight from the tables.
    pub histories: Vec<Vec<StatusTransition>>,
    pub failed_transitions: usize,
    pub notifications_sent: usize,
    pub metrics: Vec<BreakerMetrics>,
}

impl DemoReport {
    pub fn picked_up(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::PickedUp)
            .count()
    }
}

fn random_orders(count: usize) -> Vec<WorkItem> {
    let mut rng = rand::thread_rng();
    let today = Utc::now().date_naive();
    let mut orders: Vec<WorkItem> = (0..count)
        .map(|_| {
            let due = if rng.gen_bool(0.8) {
                today.checked_add_days(Days::new(rng.gen_range(1..=21)))
            } else {
                None
            };
            let priority = match rng.gen_range(0..10) {
                0 => Priority::Rush,
                1 | 2 => Priority::High,
                9 => Priority::Low,
                _ => Priority::Normal,
            };
            WorkItem::new(due, priority)
        })
        .collect();
    orders.sort_by_key(WorkItem::schedule_key);
    orders
}

/// Record the outcome of one round of transitions on the local copies.
fn settle(
    orders: &mut [WorkItem],
    indices: &[usize],
    results: Vec<Result<StatusTransition, WorkflowError>>,
    progress: &DemoProgress,
) -> usize {
    let mut failed = 0;
    for (&n, result) in indices.iter().zip(results) {
        match result {
            Ok(record) => {
                orders[n].apply(&record);
                progress.recorded(1);
            }
            Err(err) => {
                failed += 1;
                progress.failure(&orders[n].id, &err);
            }
        }
    }
    failed
}

/// Push `order_count` fresh orders through the pipeline.
pub async fn run(
    config: &FramewrightConfig,
    order_count: usize,
    failure_rate: f64,
    progress: &DemoProgress,
) -> Result<DemoReport> {
    let registry = config.registry();
    let db = registry.get_or_register(ORDERS_DB, DependencyClass::Database);
    let sms = registry.get_or_register(SMS_GATEWAY, DependencyClass::Sms);

    let store = Arc::new(FlakyStore::new(failure_rate));
    let workflow = StatusWorkflow::new(store.clone(), db);
    let gateway = SmsGateway::new(failure_rate);
    let ctx = CallContext::new();

    let mut orders = random_orders(order_count);
    let mut failed_transitions = 0;
    info!(orders = order_count, failure_rate, "demo started");

    progress.stage(OrderStatus::OrderProcessed.as_str());
    let all: Vec<usize> = (0..orders.len()).collect();
    let results = join_all(all.iter().map(|&n| {
        workflow.transition(&ctx, &orders[n].id, OrderStatus::OrderProcessed, "pos-import", "order placed")
    }))
    .await;
    // Local copies start at ORDER_PROCESSED; unrecorded orders must not advance.
    let mut live: Vec<bool> = results.iter().map(Result::is_ok).collect();
    failed_transitions += settle(&mut orders, &all, results, progress);

    // Automatic advances up to COMPLETED.
    for stage in &OrderStatus::PIPELINE[1..OrderStatus::PIPELINE.len() - 1] {
        progress.stage(stage.as_str());
        let ready: Vec<usize> = (0..orders.len())
            .filter(|&n| live[n] && orders[n].status.next() == Some(*stage))
            .collect();
        let results = join_all(
            ready
                .iter()
                .map(|&n| workflow.advance(&ctx, &orders[n].id, "workshop", "station scan")),
        )
        .await;
        for (&n, result) in ready.iter().zip(&results) {
            if result.is_err() {
                live[n] = false;
            }
        }
        failed_transitions += settle(&mut orders, &ready, results, progress);
    }

    // Text customers whose frames are done, in paced batches.
    progress.stage("notifying customers");
    let completed: Vec<usize> = (0..orders.len())
        .filter(|&n| orders[n].status == OrderStatus::Completed)
        .collect();
    let ids: Vec<String> = completed.iter().map(|&n| orders[n].id.clone()).collect();
    let gateway = &gateway;
    let sends = sms
        .execute_batch(&ctx, &ids, &config.batch, move |id| {
            let id = id.clone();
            async move { gateway.send(&id).await }
        })
        .await;

    let mut notified = Vec::new();
    for (&n, send) in completed.iter().zip(sends) {
        match send {
            Ok(message_id) => {
                info!(order_id = %orders[n].id, message_id = %message_id, "customer notified");
                notified.push(n);
            }
            Err(err) => {
                warn!(order_id = %orders[n].id, error = %err, "customer not notified");
                progress.notice(&format!("no pickup notice for {}", orders[n].id));
            }
        }
    }
    let notifications_sent = notified.len();

    progress.stage(OrderStatus::PickedUp.as_str());
    let results = join_all(
        notified
            .iter()
            .map(|&n| workflow.advance(&ctx, &orders[n].id, "front-desk", "customer collected frame")),
    )
    .await;
    failed_transitions += settle(&mut orders, &notified, results, progress);

    let mut histories = Vec::with_capacity(orders.len());
    for order in &orders {
        histories.push(store.inner().history(&order.id).await?);
    }

    info!(
        picked_up = orders.iter().filter(|o| o.status == OrderStatus::PickedUp).count(),
        failed_transitions,
        notifications_sent,
        "demo finished"
    );
    Ok(DemoReport {
        orders,
        histories,
        failed_transitions,
        notifications_sent,
        metrics: registry.metrics(),
    })
}
