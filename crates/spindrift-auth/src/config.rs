//! Auth manager configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use spindrift_core::ids::AccountId;
use spindrift_crypto::Signer;

use crate::link::RouteRegistrar;
use crate::storage::Storage;

/// Result of parsing a raw bond transaction with an asset's parser.
#[derive(Debug, Clone)]
pub struct ParsedBondTx {
    pub coin_id: Vec<u8>,
    pub amount: u64,
    pub lock_time: i64,
    pub account_id: AccountId,
}

/// Parses `(asset_id, bond_version, raw_tx)` into the bond commitment it
/// encodes.
pub type BondTxParser =
    Arc<dyn Fn(u32, u16, &[u8]) -> anyhow::Result<ParsedBondTx> + Send + Sync>;

/// Reports current confirmations for a bond coin of one asset.
pub type ConfsSource = Arc<dyn Fn(&[u8]) -> anyhow::Result<u32> + Send + Sync>;

/// Fetches raw transaction data for a swap contract coin of one asset.
pub type TxDataSource = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Invoked when a user's tier drops to zero so the market can pull their
/// booked orders.
pub type UserUnbooker = Arc<dyn Fn(AccountId) + Send + Sync>;

/// Bond acceptance parameters for one asset.
#[derive(Debug, Clone)]
pub struct BondAsset {
    pub version: u16,
    pub id: u32,
    /// Confirmations required before a bond counts.
    pub confs: u32,
    /// Amount per unit of bond strength.
    pub amt: u64,
}

/// Everything the auth manager needs from its host.
pub struct Config {
    pub storage: Arc<dyn Storage>,
    pub signer: Arc<dyn Signer>,
    /// Seconds before a bond's lock time at which it stops counting.
    pub bond_expiry: u64,
    /// Minimum remaining lock time for a newly submitted bond, seconds.
    /// Zero selects twice the bond expiry.
    pub min_bond_lock_time: u64,
    /// Accepted bond assets by symbol.
    pub bond_assets: HashMap<String, BondAsset>,
    pub bond_tx_parser: Option<BondTxParser>,
    /// Confirmation sources by asset ID.
    pub bond_confs_sources: HashMap<u32, ConfsSource>,
    /// Swap tx-data sources by asset ID, for the `match_status` route.
    pub tx_data_sources: HashMap<u32, TxDataSource>,
    /// Cancel-ratio limit in (0, 1).
    pub cancel_threshold: f64,
    /// Score at which one tier unit is deducted. Zero selects the default.
    pub penalty_threshold: i32,
    /// How long to retain outcome history for disconnected users.
    pub mia_user_timeout: Duration,
    pub user_unbooker: Option<UserUnbooker>,
    /// Registers our routes with the transport.
    pub route: Option<RouteRegistrar>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cancel threshold {0} outside (0, 1)")]
    BadCancelThreshold(f64),
    #[error("bond asset {0} registered with zero amount")]
    ZeroBondIncrement(String),
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cancel_threshold > 0.0 && self.cancel_threshold < 1.0) {
            return Err(ConfigError::BadCancelThreshold(self.cancel_threshold));
        }
        for (sym, asset) in &self.bond_assets {
            if asset.amt == 0 {
                return Err(ConfigError::ZeroBondIncrement(sym.clone()));
            }
        }
        Ok(())
    }
}
