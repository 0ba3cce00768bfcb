//! The scoring function: outcome bins in, signed score out, plus the
//! bonded-tier arithmetic derived from it.

use crate::outcomes::{Outcome, UserOutcomes};

/// Window capacities per outcome kind.
pub const MATCH_WINDOW: usize = 60;
pub const PREIMAGE_WINDOW: usize = 100;
pub const ORDER_WINDOW: usize = 100;

/// Score at which one tier unit is deducted.
pub const DEFAULT_PENALTY_THRESHOLD: i32 = 20;

// Violation weights. Set relative to the penalty threshold: the worst
// single offense (stranding the maker's funds for the full swap window)
// costs about half a penalty, while a completed swap claws one point back.
const SWAP_SUCCESS_SCORE: i32 = -1;
const PREIMAGE_MISS_SCORE: i32 = 2;
const NO_SWAP_AS_MAKER_SCORE: i32 = 4;
const NO_SWAP_AS_TAKER_SCORE: i32 = 11;
const NO_REDEEM_AS_MAKER_SCORE: i32 = 7;
const NO_REDEEM_AS_TAKER_SCORE: i32 = 1;
const EXCESSIVE_CANCEL_SCORE: i32 = 5;

impl Outcome {
    /// Weight of one binned outcome. Order outcomes feed the cancel-rate
    /// check instead of scoring individually.
    pub fn score(self) -> i32 {
        match self {
            Outcome::SwapSuccess => SWAP_SUCCESS_SCORE,
            Outcome::PreimageMiss => PREIMAGE_MISS_SCORE,
            Outcome::NoSwapAsMaker => NO_SWAP_AS_MAKER_SCORE,
            Outcome::NoSwapAsTaker => NO_SWAP_AS_TAKER_SCORE,
            Outcome::NoRedeemAsMaker => NO_REDEEM_AS_MAKER_SCORE,
            Outcome::NoRedeemAsTaker => NO_REDEEM_AS_TAKER_SCORE,
            Outcome::OrderComplete | Outcome::OrderCanceled => 0,
        }
    }
}

/// Maximum number of orders a new account may have before the cancel-rate
/// test applies. This is the largest `n` with `n/(n+1)` at or below the
/// threshold; the quotient is computed in floating point, so round to the
/// nearest integer rather than flooring a value that may sit a few ULPs
/// under it.
pub fn grace_limit(cancel_thresh: f64) -> i64 {
    (cancel_thresh / (1.0 - cancel_thresh)).round() as i64
}

/// Whether the retained cancel/completion counts exceed the threshold,
/// with the grace period for accounts with too few orders to judge.
pub fn cancel_rate_exceeded(cancels: u32, completes: u32, cancel_thresh: f64) -> bool {
    let total = cancels + completes;
    if i64::from(total) <= grace_limit(cancel_thresh) {
        return false;
    }
    f64::from(cancels) > cancel_thresh * f64::from(total)
}

/// Sum the user's retained outcomes into their score.
pub fn user_score(outcomes: &UserOutcomes, cancel_thresh: f64) -> i32 {
    let bins = outcomes.bin_violations();
    let mut score: i32 = bins.iter().map(|(o, n)| o.score() * *n as i32).sum();

    let cancels = bins.get(&Outcome::OrderCanceled).copied().unwrap_or(0);
    let completes = bins.get(&Outcome::OrderComplete).copied().unwrap_or(0);
    if cancel_rate_exceeded(cancels, completes, cancel_thresh) {
        score += EXCESSIVE_CANCEL_SCORE;
    }
    score
}

/// Trading tier: bonded strength less one unit per full penalty threshold
/// of accumulated score. A user is suspended at tier zero or below.
pub fn tier(bond_tier: u32, score: i32, penalty_threshold: i32) -> i64 {
    let threshold = if penalty_threshold > 0 {
        penalty_threshold
    } else {
        DEFAULT_PENALTY_THRESHOLD
    };
    let penalties = i64::from(score.max(0) / threshold);
    i64::from(bond_tier) - penalties
}
