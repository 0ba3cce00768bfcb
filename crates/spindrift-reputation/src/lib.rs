//! Reputation for spindrift users: rolling windows of recent trading
//! outcomes and a pure scoring function over them.
//!
//! Scoring is deliberately isolated from I/O so outcome combinations can
//! be enumerated in tests.

pub mod outcomes;
pub mod score;
pub mod window;

pub use outcomes::{MatchOutcome, Outcome, OrderOutcome, OutcomeClass, PreimageOutcome, UserOutcomes};
pub use score::{grace_limit, tier, user_score, DEFAULT_PENALTY_THRESHOLD};
pub use window::OutcomeWindow;
