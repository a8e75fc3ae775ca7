use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::{OrderStatus, TransitionKind};

/// Ordered most urgent first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Rush,
    High,
    #[default]
    Normal,
    Low,
}

/// A framing order as callers see it.
///
/// Due date and priority drive scheduling on the caller's side; the status
/// workflow only reads and writes `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub status: OrderStatus,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(due_date: Option<NaiveDate>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: OrderStatus::OrderProcessed,
            due_date,
            priority,
            created_at: Utc::now(),
        }
    }

    /// Bring this copy in line with a recorded transition for the same order.
    pub fn apply(&mut self, transition: &StatusTransition) {
        debug_assert_eq!(self.id, transition.order_id);
        self.status = transition.to_status;
    }

    /// Scheduling order: higher priority first, then earliest due date.
    pub fn schedule_key(&self) -> (Priority, NaiveDate) {
        (self.priority, self.due_date.unwrap_or(NaiveDate::MAX))
    }
}

/// One immutable entry in an order's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub id: Uuid,
    pub order_id: String,
    /// `None` for the first status ever recorded.
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub kind: TransitionKind,
    /// User, system process or integration name.
    pub changed_by: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(
        order_id: &str,
        from_status: Option<OrderStatus>,
        to_status: OrderStatus,
        changed_by: &str,
        reason: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            from_status,
            to_status,
            kind: TransitionKind::classify(from_status, to_status),
            changed_by: changed_by.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// True when `history` is a contiguous chain ending at `current`.
///
/// Each record's `from_status` must equal the previous record's `to_status`,
/// the first record must start from nothing, and the last must land on the
/// order's current status.
pub fn history_is_consistent(history: &[StatusTransition], current: Option<OrderStatus>) -> bool {
    let mut expected_from = None;
    for record in history {
        if record.from_status != expected_from {
            return false;
        }
        expected_from = Some(record.to_status);
    }
    expected_from == current
}
