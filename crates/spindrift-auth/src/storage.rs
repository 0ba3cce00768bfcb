//! The persistence capability the auth subsystem consumes. Implemented
//! elsewhere against the relational datastore; everything here is the
//! narrow surface the core calls into.

use anyhow::Result;

use spindrift_core::ids::{AccountId, MatchId, MatchStatus, OrderId, OrderStatus};
use spindrift_reputation::outcomes::{MatchOutcome, OutcomeClass, PreimageOutcome};

/// A registered account. Created at first confirmed bond, immutable after.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    /// Compressed secp256k1 public key.
    pub pubkey: Vec<u8>,
}

/// An on-chain time-locked bond backing an account's tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bond {
    pub asset_id: u32,
    pub coin_id: Vec<u8>,
    pub strength: u32,
    /// Unix seconds at which the commitment unlocks.
    pub lock_time: i64,
}

impl Bond {
    /// A bond stops counting toward tier once its lock time enters the
    /// expiry grace window, even though it still exists on chain.
    pub fn is_live(&self, now_secs: i64, bond_expiry_secs: i64) -> bool {
        self.lock_time > now_secs + bond_expiry_secs
    }
}

/// A match the user is party to, as stored.
#[derive(Debug, Clone)]
pub struct MatchData {
    pub id: MatchId,
    pub taker_order: OrderId,
    pub maker_order: OrderId,
    pub taker_acct: AccountId,
    pub maker_acct: AccountId,
    pub taker_addr: String,
    pub maker_addr: String,
    pub quantity: u64,
    pub rate: u64,
    pub base_rate: u64,
    pub quote_rate: u64,
    pub status: MatchStatus,
    pub active: bool,
    /// End of the match's epoch, unix milliseconds.
    pub match_time_ms: u64,
}

/// Book status of one order.
#[derive(Debug, Clone, Copy)]
pub struct OrderStatusRec {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// An executed cancel, with the epoch distance to its target order.
#[derive(Debug, Clone, Copy)]
pub struct CancelRecord {
    pub id: OrderId,
    pub target: OrderId,
    pub match_time_ms: i64,
    pub epoch_gap: i32,
}

/// Swap-progress detail for the `match_status` route.
#[derive(Debug, Clone, Default)]
pub struct MatchStatusRec {
    pub match_id: MatchId,
    pub status: Option<MatchStatus>,
    pub is_taker: bool,
    pub is_maker: bool,
    pub maker_swap: Vec<u8>,
    pub taker_swap: Vec<u8>,
    pub maker_redeem: Vec<u8>,
    pub active: bool,
    /// Asset of the maker's swap contract (quote or base per direction).
    pub maker_swap_asset: u32,
    pub taker_swap_asset: u32,
}

/// An at-fault match failure, for operator review.
#[derive(Debug, Clone, Copy)]
pub struct MatchFail {
    pub match_id: MatchId,
    pub time_ms: i64,
}

/// Capability surface of the datastore. All row IDs handed back by the
/// `add_*_outcome` methods are positive.
pub trait Storage: Send + Sync {
    /// Fetch an account and its bonds with `lock_time > lock_time_thresh`.
    fn account(&self, user: AccountId, lock_time_thresh: i64)
        -> Result<(Option<Account>, Vec<Bond>)>;
    fn create_account_with_bond(&self, acct: &Account, bond: &Bond) -> Result<()>;
    fn add_bond(&self, user: AccountId, bond: &Bond) -> Result<()>;
    fn delete_bond(&self, asset_id: u32, coin_id: &[u8]) -> Result<()>;

    /// Look up a prepaid bond token, returning `(strength, lock_time)`.
    fn fetch_prepaid_bond(&self, token: &[u8]) -> Result<(u32, i64)>;
    fn delete_prepaid_bond(&self, token: &[u8]) -> Result<()>;
    fn store_prepaid_bonds(&self, tokens: &[Vec<u8>], strength: u32, lock_time: i64)
        -> Result<()>;

    /// The most recent `last_n` match outcomes, oldest first.
    fn completed_and_at_fault_match_stats(
        &self,
        user: AccountId,
        last_n: usize,
    ) -> Result<Vec<MatchOutcome>>;
    /// The most recent `last_n` preimage results, oldest first.
    fn preimage_stats(&self, user: AccountId, last_n: usize) -> Result<Vec<PreimageOutcome>>;
    fn user_match_fails(&self, user: AccountId, last_n: usize) -> Result<Vec<MatchFail>>;
    /// Recently completed orders as `(order, completion time ms)`, oldest first.
    fn completed_user_orders(&self, user: AccountId, last_n: usize)
        -> Result<Vec<(OrderId, i64)>>;
    fn executed_cancels_for_user(&self, user: AccountId, last_n: usize)
        -> Result<Vec<CancelRecord>>;

    fn active_user_order_statuses(&self, user: AccountId) -> Result<Vec<OrderStatusRec>>;
    fn user_order_statuses(
        &self,
        user: AccountId,
        base: u32,
        quote: u32,
        oids: &[OrderId],
    ) -> Result<Vec<OrderStatusRec>>;
    fn all_active_user_matches(&self, user: AccountId) -> Result<Vec<MatchData>>;
    fn match_statuses(
        &self,
        user: AccountId,
        base: u32,
        quote: u32,
        mids: &[MatchId],
    ) -> Result<Vec<MatchStatusRec>>;

    /// Persist one outcome, returning the new row ID.
    fn add_preimage_outcome(&self, user: AccountId, oid: OrderId, miss: bool) -> Result<i64>;
    fn add_match_outcome(
        &self,
        user: AccountId,
        mid: MatchId,
        status: MatchStatus,
        fail: bool,
        value: u64,
    ) -> Result<i64>;
    fn add_order_outcome(&self, user: AccountId, oid: OrderId, canceled: bool) -> Result<i64>;
    /// Drop persisted outcomes of `class` older than row `from_db_id`.
    fn prune_outcomes(&self, user: AccountId, class: OutcomeClass, from_db_id: i64)
        -> Result<()>;
    /// Wipe the user's violation history.
    fn forgive_user(&self, user: AccountId) -> Result<()>;
}
