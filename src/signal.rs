//! Inbound signal envelope and the intent type C7 hands to C5.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTransition {
    FlatToLong,
    LongToFlat,
    FlatToShort,
    ShortToFlat,
    LongToShort,
    ShortToLong,
    LongToLong,
    ShortToShort,
}

impl PositionTransition {
    /// True for transitions that open or extend exposure; false for ones that reduce it.
    pub fn is_entry(&self) -> bool {
        matches!(
            self,
            PositionTransition::FlatToLong
                | PositionTransition::FlatToShort
                | PositionTransition::LongToLong
                | PositionTransition::ShortToShort
        )
    }
}

/// Raw signal as received at the webhook boundary. Immutable after ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub account_id: String,
    pub side: Side,
    pub position_transition: PositionTransition,
    pub size: Decimal,
    pub underlying: String,
    pub correlation_id: Option<String>,
    pub comment: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
    Roll,
}

impl Strategy {
    /// Default mapping from §4.4 step 1: long-entries and short-exits select calls;
    /// short-entries and long-exits select puts.
    pub fn from_transition(t: PositionTransition) -> Self {
        match t {
            PositionTransition::FlatToLong | PositionTransition::ShortToLong | PositionTransition::LongToLong => {
                Strategy::OpenLong
            }
            PositionTransition::LongToFlat => Strategy::CloseLong,
            PositionTransition::FlatToShort | PositionTransition::LongToShort | PositionTransition::ShortToShort => {
                Strategy::OpenShort
            }
            PositionTransition::ShortToFlat => Strategy::CloseShort,
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Strategy::CloseLong | Strategy::CloseShort)
    }

    pub fn as_action_str(&self) -> &'static str {
        match self {
            Strategy::OpenLong | Strategy::OpenShort => "open",
            Strategy::CloseLong | Strategy::CloseShort => "close",
            Strategy::Roll => "adjust",
        }
    }
}

/// C7 → C5 hand-off. Immutable once constructed.
///
/// Carries `tick_size` alongside the core fields so C5 never has to re-resolve the contract
/// C4 already picked just to round prices; C7 fills it in from the selected `OptionContract`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub account_id: String,
    pub instrument_id: String,
    pub side: Side,
    pub size: Decimal,
    pub tick_size: Decimal,
    pub correlation_id: String,
    pub strategy: Strategy,
    pub created_at: DateTime<Utc>,
}
