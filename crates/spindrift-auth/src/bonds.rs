//! Bond acceptance and lifetime: parsing submitted transactions, waiting
//! out confirmations, prepaid token redemption, and the expiry sweep
//! that walks live sessions as lock times approach.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use spindrift_core::ids::AccountId;
use spindrift_core::msg::{
    BondConfirmedNote, BondExpiredNote, Message, BOND_CONFIRMED_ROUTE, BOND_EXPIRED_ROUTE,
};
use spindrift_core::time::now_secs;
use spindrift_crypto::account_id;

use crate::manager::AuthManager;
use crate::session::ClientSession;
use crate::storage::{Account, Bond};

/// Sentinel asset ID for bonds redeemed from prepaid tokens; they have no
/// backing chain to watch.
pub const PREPAID_BOND_ASSET: u32 = u32::MAX;

/// Delay between confirmation checks for a pending bond.
const BOND_CONF_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BondError {
    #[error("unknown bond asset {0}")]
    UnknownAsset(u32),
    #[error("unsupported bond version {version} for asset {asset_id}")]
    UnsupportedVersion { asset_id: u32, version: u16 },
    #[error("bond transactions not accepted")]
    NoParser,
    #[error("bond transaction rejected: {0}")]
    Invalid(String),
    #[error("bond commitment pays to another account")]
    WrongAccount,
    #[error("bond lock time {lock_time} under minimum {min}")]
    LockTimeTooSoon { lock_time: i64, min: i64 },
    #[error("bond amount {amount} under one strength increment of {increment}")]
    WeakBond { amount: u64, increment: u64 },
    #[error("no confirmation source for asset {0}")]
    NoConfsSource(u32),
    #[error("prepaid bond unavailable: {0}")]
    Prepaid(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("server shutting down")]
    ShuttingDown,
}

impl AuthManager {
    /// Accept an externally verified bond directly, updating the live
    /// session if the user is connected.
    pub fn add_bond(&self, user: AccountId, bond: Bond) -> anyhow::Result<()> {
        self.storage.add_bond(user, &bond)?;
        self.register_live_bond(user, bond);
        Ok(())
    }

    /// Validate a submitted raw bond transaction, wait for it to reach
    /// the asset's confirmation requirement, then persist it and credit
    /// the account. Resolves once confirmed or rejected; the caller
    /// decides whether to run it in the background.
    pub async fn submit_bond_tx(
        &self,
        pubkey: Vec<u8>,
        asset_id: u32,
        version: u16,
        raw_tx: Vec<u8>,
    ) -> Result<Bond, BondError> {
        let asset = self
            .bond_assets
            .values()
            .find(|a| a.id == asset_id)
            .ok_or(BondError::UnknownAsset(asset_id))?
            .clone();
        if version != asset.version {
            return Err(BondError::UnsupportedVersion { asset_id, version });
        }
        let parser = self.bond_tx_parser.as_ref().ok_or(BondError::NoParser)?;
        let parsed = parser(asset_id, version, &raw_tx)
            .map_err(|err| BondError::Invalid(err.to_string()))?;

        let user = account_id(&pubkey);
        if parsed.account_id != user {
            return Err(BondError::WrongAccount);
        }
        let min = now_secs() + self.min_bond_lock_time;
        if parsed.lock_time < min {
            return Err(BondError::LockTimeTooSoon {
                lock_time: parsed.lock_time,
                min,
            });
        }
        let strength = (parsed.amount / asset.amt) as u32;
        if strength == 0 {
            return Err(BondError::WeakBond {
                amount: parsed.amount,
                increment: asset.amt,
            });
        }
        let confs_source = self
            .bond_confs_sources
            .get(&asset_id)
            .cloned()
            .ok_or(BondError::NoConfsSource(asset_id))?;

        let bond = Bond {
            asset_id,
            coin_id: parsed.coin_id,
            strength,
            lock_time: parsed.lock_time,
        };
        let mut shut = self.shutdown_signal();
        loop {
            match confs_source(&bond.coin_id) {
                Ok(confs) if confs >= asset.confs => break,
                Ok(confs) => {
                    trace!(user = %user, confs, need = asset.confs, "bond pending")
                }
                Err(err) => debug!(user = %user, %err, "bond confirmation check failed"),
            }
            // A bond that expires while waiting is abandoned.
            if !bond.is_live(now_secs(), self.bond_expiry) {
                return Err(BondError::LockTimeTooSoon {
                    lock_time: bond.lock_time,
                    min: now_secs() + self.bond_expiry,
                });
            }
            tokio::select! {
                _ = shut.changed() => return Err(BondError::ShuttingDown),
                _ = tokio::time::sleep(BOND_CONF_POLL) => {}
            }
        }
        self.persist_bond(user, &pubkey, &bond)
            .map_err(|err| BondError::Storage(err.to_string()))?;
        info!(
            user = %user,
            asset_id,
            strength,
            lock_time = bond.lock_time,
            "bond confirmed"
        );
        self.register_live_bond(user, bond.clone());
        Ok(bond)
    }

    /// Mint `n` prepaid bond tokens of the given strength, each valid
    /// for `dur_secs` from now. Returns the tokens for distribution.
    pub fn create_prepaid_bonds(
        &self,
        n: usize,
        strength: u32,
        dur_secs: i64,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let lock_time = now_secs() + dur_secs;
        let tokens: Vec<Vec<u8>> = (0..n)
            .map(|_| rand::random::<[u8; 16]>().to_vec())
            .collect();
        self.storage
            .store_prepaid_bonds(&tokens, strength, lock_time)?;
        info!(n, strength, lock_time, "prepaid bonds created");
        Ok(tokens)
    }

    /// Redeem a prepaid bond token. The token buys a fixed strength and
    /// lock time exactly once; redemption is all-or-nothing.
    pub fn redeem_prepaid_bond(
        &self,
        pubkey: &[u8],
        token: &[u8],
    ) -> Result<Bond, BondError> {
        let user = account_id(pubkey);
        let (strength, lock_time) = self
            .storage
            .fetch_prepaid_bond(token)
            .map_err(|err| BondError::Prepaid(err.to_string()))?;
        if lock_time <= now_secs() + self.bond_expiry {
            return Err(BondError::LockTimeTooSoon {
                lock_time,
                min: now_secs() + self.bond_expiry,
            });
        }
        let bond = Bond {
            asset_id: PREPAID_BOND_ASSET,
            coin_id: token.to_vec(),
            strength,
            lock_time,
        };
        self.persist_bond(user, pubkey, &bond)
            .map_err(|err| BondError::Storage(err.to_string()))?;
        if let Err(err) = self.storage.delete_prepaid_bond(token) {
            // Unwind so the token cannot be double-counted later.
            if let Err(undo) = self.storage.delete_bond(bond.asset_id, &bond.coin_id) {
                warn!(user = %user, %undo, "prepaid redemption unwind failed");
            }
            return Err(BondError::Storage(err.to_string()));
        }
        info!(user = %user, strength, lock_time, "prepaid bond redeemed");
        self.register_live_bond(user, bond.clone());
        Ok(bond)
    }

    /// First confirmed bond creates the account record.
    fn persist_bond(
        &self,
        user: AccountId,
        pubkey: &[u8],
        bond: &Bond,
    ) -> anyhow::Result<()> {
        let (acct, _) = self.storage.account(user, now_secs() + self.bond_expiry)?;
        match acct {
            Some(_) => self.storage.add_bond(user, bond),
            None => self.storage.create_account_with_bond(
                &Account {
                    id: user,
                    pubkey: pubkey.to_vec(),
                },
                bond,
            ),
        }
    }

    /// Fold a freshly confirmed bond into the user's live session.
    fn register_live_bond(&self, user: AccountId, bond: Bond) {
        let Some(session) = self.user(user) else {
            return;
        };
        let (asset_id, coin_id, strength) = (bond.asset_id, bond.coin_id.clone(), bond.strength);
        session.add_bond(bond);
        self.recompute_reputation(user);
        let note = BondConfirmedNote {
            asset_id,
            coin_id,
            strength,
            tier: session.tier(),
        };
        match Message::notification(BOND_CONFIRMED_ROUTE, &note) {
            Ok(message) => {
                if let Err(err) = session.send(&message) {
                    debug!(user = %user, %err, "bond confirmation note undelivered");
                }
            }
            Err(err) => warn!(%err, "bond confirmation note encoding failed"),
        }
    }

    /// Drop bonds whose lock times have entered the expiry window from
    /// every live session, recomputing tiers and telling the affected
    /// clients so they can renew. The bonds stay in storage.
    pub fn expire_bonds_at(&self, now: i64) {
        let sessions: Vec<Arc<ClientSession>> = self.sessions();
        for session in sessions {
            let bonds = session.bonds();
            let (live, expired): (Vec<Bond>, Vec<Bond>) = bonds
                .into_iter()
                .partition(|b| b.is_live(now, self.bond_expiry));
            if expired.is_empty() {
                continue;
            }
            session.set_bonds(live);
            self.recompute_reputation(session.acct);
            let tier = session.tier();
            for bond in expired {
                info!(
                    user = %session.acct,
                    asset_id = bond.asset_id,
                    lock_time = bond.lock_time,
                    "bond expired"
                );
                let note = BondExpiredNote {
                    asset_id: bond.asset_id,
                    coin_id: bond.coin_id,
                    tier,
                };
                match Message::notification(BOND_EXPIRED_ROUTE, &note) {
                    Ok(message) => {
                        if let Err(err) = session.send(&message) {
                            debug!(user = %session.acct, %err, "bond expiry note undelivered");
                        }
                    }
                    Err(err) => warn!(%err, "bond expiry note encoding failed"),
                }
            }
        }
    }
}
