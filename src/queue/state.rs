use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    New,
    Pending,
    Approved,
    Done,
    Rejected,
    Failed,
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 6] = [
        TradeStatus::New,
        TradeStatus::Pending,
        TradeStatus::Approved,
        TradeStatus::Done,
        TradeStatus::Rejected,
        TradeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::New => "NEW",
            TradeStatus::Pending => "PENDING",
            TradeStatus::Approved => "APPROVED",
            TradeStatus::Done => "DONE",
            TradeStatus::Rejected => "REJECTED",
            TradeStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Done | TradeStatus::Rejected | TradeStatus::Failed)
    }

    /// States a producer may insert with.
    pub fn is_initial(&self) -> bool {
        matches!(self, TradeStatus::New | TradeStatus::Pending)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TradeStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown trade status: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    /// Direction applied to `(price - basis) * qty` when realizing a gain.
    pub fn sign(&self) -> Decimal {
        match self {
            Action::Buy => Decimal::NEGATIVE_ONE,
            Action::Sell => Decimal::ONE,
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    Approve,
    Execute,
    Fail,
    Reject,
}

impl TradeEvent {
    pub fn target(&self) -> TradeStatus {
        match self {
            TradeEvent::Approve => TradeStatus::Approved,
            TradeEvent::Execute => TradeStatus::Done,
            TradeEvent::Fail => TradeStatus::Failed,
            TradeEvent::Reject => TradeStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Move(TradeStatus),
    /// The trade is already where the event would put it.
    Stay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: TradeStatus,
    pub event: TradeEvent,
}

/// Status transitions only move forward; terminal states accept nothing but
/// a repeat of the event that put them there.
pub fn next_status(from: TradeStatus, event: TradeEvent) -> Result<Step, TransitionError> {
    use TradeEvent::*;
    use TradeStatus::*;
    match (from, event) {
        (New, Approve) | (Pending, Approve) => Ok(Step::Move(Approved)),
        (Approved, Approve) => Ok(Step::Stay),
        (Approved, Execute) => Ok(Step::Move(Done)),
        (Approved, Fail) => Ok(Step::Move(Failed)),
        (New, Reject) | (Pending, Reject) => Ok(Step::Move(Rejected)),
        (Rejected, Reject) => Ok(Step::Stay),
        _ => Err(TransitionError { from, event }),
    }
}
