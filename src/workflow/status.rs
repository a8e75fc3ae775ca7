use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Production status of a framing order.
///
/// The pipeline runs ORDER_PROCESSED → … → PICKED_UP. DELAYED and
/// MYSTERY_UNCLAIMED sit beside it and are only left by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    OrderProcessed,
    MaterialsOrdered,
    MaterialsArrived,
    FrameCut,
    MatCut,
    Prepped,
    Completed,
    PickedUp,
    Delayed,
    MysteryUnclaimed,
}

impl OrderStatus {
    /// Pipeline stages in the order they are entered.
    pub const PIPELINE: [OrderStatus; 8] = [
        OrderStatus::OrderProcessed,
        OrderStatus::MaterialsOrdered,
        OrderStatus::MaterialsArrived,
        OrderStatus::FrameCut,
        OrderStatus::MatCut,
        OrderStatus::Prepped,
        OrderStatus::Completed,
        OrderStatus::PickedUp,
    ];

    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::OrderProcessed,
        OrderStatus::MaterialsOrdered,
        OrderStatus::MaterialsArrived,
        OrderStatus::FrameCut,
        OrderStatus::MatCut,
        OrderStatus::Prepped,
        OrderStatus::Completed,
        OrderStatus::PickedUp,
        OrderStatus::Delayed,
        OrderStatus::MysteryUnclaimed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::OrderProcessed => "ORDER_PROCESSED",
            OrderStatus::MaterialsOrdered => "MATERIALS_ORDERED",
            OrderStatus::MaterialsArrived => "MATERIALS_ARRIVED",
            OrderStatus::FrameCut => "FRAME_CUT",
            OrderStatus::MatCut => "MAT_CUT",
            OrderStatus::Prepped => "PREPPED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::PickedUp => "PICKED_UP",
            OrderStatus::Delayed => "DELAYED",
            OrderStatus::MysteryUnclaimed => "MYSTERY_UNCLAIMED",
        }
    }

    /// Index within [`PIPELINE`](Self::PIPELINE); `None` for side states.
    pub fn pipeline_position(self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| *s == self)
    }

    /// The stage an automatic advance moves to.
    ///
    /// `None` from the terminal stage and from side states.
    pub fn next(self) -> Option<OrderStatus> {
        self.pipeline_position()
            .and_then(|i| Self::PIPELINE.get(i + 1))
            .copied()
    }

    pub fn is_terminal(self) -> bool {
        self == OrderStatus::PickedUp
    }

    pub fn is_side_state(self) -> bool {
        matches!(self, OrderStatus::Delayed | OrderStatus::MysteryUnclaimed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown order status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// How a recorded transition relates to the pipeline order.
///
/// Writes are never refused for being out of order; the kind is stored with
/// the record so overrides stand out in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// First status ever recorded for the order, entering the pipeline at its start.
    Initial,
    /// Exactly one stage forward.
    Advance,
    /// From a live pipeline stage into a side state. PICKED_UP is not live:
    /// moving a collected order into a side state is an `Override`.
    SideTrack,
    /// From a side state back into the pipeline.
    Resume,
    /// Anything else: skipped or repeated stages, moving backwards, leaving PICKED_UP.
    Override,
}

impl TransitionKind {
    pub fn classify(from: Option<OrderStatus>, to: OrderStatus) -> Self {
        let Some(from) = from else {
            return if to == OrderStatus::OrderProcessed {
                TransitionKind::Initial
            } else {
                TransitionKind::Override
            };
        };

        if from.next() == Some(to) {
            TransitionKind::Advance
        } else if to.is_side_state() && !from.is_side_state() && !from.is_terminal() {
            TransitionKind::SideTrack
        } else if from.is_side_state() && !to.is_side_state() {
            TransitionKind::Resume
        } else {
            TransitionKind::Override
        }
    }

    pub fn is_out_of_order(self) -> bool {
        self == TransitionKind::Override
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Initial => write!(f, "initial"),
            TransitionKind::Advance => write!(f, "advance"),
            TransitionKind::SideTrack => write!(f, "side_track"),
            TransitionKind::Resume => write!(f, "resume"),
            TransitionKind::Override => write!(f, "override"),
        }
    }
}
