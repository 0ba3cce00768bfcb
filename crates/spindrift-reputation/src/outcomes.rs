//! Typed outcome records and their classification into score bins.

use std::collections::HashMap;

use spindrift_core::ids::{MatchId, MatchStatus, OrderId};

use crate::score::{MATCH_WINDOW, ORDER_WINDOW, PREIMAGE_WINDOW};
use crate::window::OutcomeWindow;

/// Result of one epoch preimage request. `miss` means the user failed to
/// reveal the order preimage inside the epoch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreimageOutcome {
    pub order_id: OrderId,
    pub miss: bool,
    pub time_ms: i64,
}

/// Terminal state of one match the user was party to. A non-terminal
/// `status` with `fail` set is an inactivity default attributable to the
/// user's side; `MatchComplete` is never a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub match_id: MatchId,
    pub status: MatchStatus,
    pub fail: bool,
    pub value: u64,
    pub time_ms: i64,
}

/// A completed or canceled order. `db_id` is the storage row ID, used to
/// prune persisted history as the window rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderOutcome {
    pub db_id: i64,
    pub order_id: OrderId,
    pub canceled: bool,
    pub time_ms: i64,
}

/// Storage-side outcome stream, for pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    Preimage,
    Match,
    Order,
}

/// Score bin an outcome record falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    SwapSuccess,
    PreimageMiss,
    NoSwapAsMaker,
    NoSwapAsTaker,
    NoRedeemAsMaker,
    NoRedeemAsTaker,
    OrderComplete,
    OrderCanceled,
}

impl PreimageOutcome {
    pub fn bin(&self) -> Option<Outcome> {
        self.miss.then_some(Outcome::PreimageMiss)
    }
}

impl MatchOutcome {
    /// Classify by the stall point of the swap sequence: a match stalled
    /// right after the maker's swap is the taker's missing contract; one
    /// stalled after the maker redeemed is the taker's missing redeem.
    pub fn bin(&self) -> Option<Outcome> {
        match (self.status, self.fail) {
            (MatchStatus::NewlyMatched, true) => Some(Outcome::NoSwapAsMaker),
            (MatchStatus::MakerSwapCast, true) => Some(Outcome::NoSwapAsTaker),
            (MatchStatus::TakerSwapCast, true) => Some(Outcome::NoRedeemAsMaker),
            (MatchStatus::MakerRedeemed, true) => Some(Outcome::NoRedeemAsTaker),
            // The maker's side is done once they have redeemed.
            (MatchStatus::MakerRedeemed, false) => Some(Outcome::SwapSuccess),
            (MatchStatus::MatchComplete, _) => Some(Outcome::SwapSuccess),
            _ => None,
        }
    }
}

impl OrderOutcome {
    pub fn bin(&self) -> Outcome {
        if self.canceled {
            Outcome::OrderCanceled
        } else {
            Outcome::OrderComplete
        }
    }
}

/// The live outcome windows of one user.
#[derive(Debug, Clone)]
pub struct UserOutcomes {
    pub preimages: OutcomeWindow<PreimageOutcome>,
    pub matches: OutcomeWindow<MatchOutcome>,
    pub orders: OutcomeWindow<OrderOutcome>,
}

impl Default for UserOutcomes {
    fn default() -> Self {
        Self::new()
    }
}

impl UserOutcomes {
    pub fn new() -> Self {
        Self {
            preimages: OutcomeWindow::new(PREIMAGE_WINDOW),
            matches: OutcomeWindow::new(MATCH_WINDOW),
            orders: OutcomeWindow::new(ORDER_WINDOW),
        }
    }

    /// Load from history streams, each ordered oldest to newest.
    pub fn load(
        preimages: Vec<PreimageOutcome>,
        matches: Vec<MatchOutcome>,
        orders: Vec<OrderOutcome>,
    ) -> Self {
        Self {
            preimages: OutcomeWindow::with_latest(PREIMAGE_WINDOW, preimages),
            matches: OutcomeWindow::with_latest(MATCH_WINDOW, matches),
            orders: OutcomeWindow::with_latest(ORDER_WINDOW, orders),
        }
    }

    /// Count retained outcomes per score bin across all three windows.
    pub fn bin_violations(&self) -> HashMap<Outcome, u32> {
        let mut bins = HashMap::new();
        for o in self.preimages.iter().filter_map(PreimageOutcome::bin) {
            *bins.entry(o).or_insert(0) += 1;
        }
        for o in self.matches.iter().filter_map(MatchOutcome::bin) {
            *bins.entry(o).or_insert(0) += 1;
        }
        for o in self.orders.iter().map(OrderOutcome::bin) {
            *bins.entry(o).or_insert(0) += 1;
        }
        bins
    }

    /// Clear all retained history.
    pub fn forgive(&mut self) {
        self.preimages.forgive();
        self.matches.forgive();
        self.orders.forgive();
    }
}
