//! Order status tracking with an append-only audit trail.

mod order;
mod service;
mod status;
mod store;

pub use order::{Priority, StatusTransition, WorkItem, history_is_consistent};
pub use service::{StatusWorkflow, WorkflowError};
pub use status::{OrderStatus, TransitionKind, UnknownStatus};
pub use store::{InMemoryStatusStore, StatusStore, StoreError};
