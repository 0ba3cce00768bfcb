//! The `connect` handshake: prove key ownership, bind the link to the
//! account, and hand back the user's standing.

use std::sync::{Arc, PoisonError};

use tracing::{debug, info, warn};

use spindrift_core::ids::{AccountId, MatchSide};
use spindrift_core::msg::{
    self, BondNote, Connect, ConnectResult, MatchSnapshot, Message, OrderStatusNote, Signable,
};
use spindrift_core::time::{now_ms, now_secs};
use spindrift_crypto::verify_sig;
use spindrift_reputation::{tier, user_score};

use crate::link::Link;
use crate::manager::{server_error, AuthManager};
use crate::session::ClientSession;
use crate::storage::MatchData;

impl AuthManager {
    /// Handle a `connect` request. On success the new session is swapped
    /// into the registry atomically, displacing (and disconnecting) any
    /// prior session for the account.
    pub fn handle_connect(
        self: &Arc<Self>,
        link: Arc<dyn Link>,
        message: &Message,
    ) -> Option<msg::Error> {
        let connect: Connect = match message.parse_payload() {
            Ok(c) => c,
            Err(err) => {
                debug!(link = link.id(), %err, "malformed connect payload");
                return Some(msg::Error::new(
                    msg::RPC_PARSE_ERROR,
                    "error parsing connect request",
                ));
            }
        };

        let Some(user) = AccountId::from_slice(&connect.account_id) else {
            return Some(msg::Error::new(
                msg::AUTHENTICATION_ERROR,
                "malformed account ID",
            ));
        };

        let now_s = now_secs();
        let (acct, bonds) = match self.storage.account(user, now_s + self.bond_expiry) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(user = %user, %err, "account lookup failed");
                return Some(server_error());
            }
        };
        let Some(acct) = acct else {
            return Some(msg::Error::new(
                msg::ACCOUNT_NOT_FOUND_ERROR,
                "no account found",
            ));
        };

        if !verify_sig(&acct.pubkey, &connect.signing_bytes(), connect.sig()) {
            return Some(msg::Error::new(
                msg::SIGNATURE_ERROR,
                "signature validation failed",
            ));
        }

        // Bonds from storage are filtered by lock time already; the tier
        // sum applies the expiry window on top.
        let live_bonds: Vec<_> = bonds
            .into_iter()
            .filter(|b| b.is_live(now_s, self.bond_expiry))
            .collect();
        let bond_tier = self.bond_tier(&live_bonds, now_s);

        let outcomes = match self.load_outcomes(user) {
            Ok(oc) => oc,
            Err(err) => {
                warn!(user = %user, %err, "outcome history load failed");
                return Some(server_error());
            }
        };
        let score = {
            let oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            user_score(&oc, self.cancel_thresh)
        };
        let user_tier = tier(bond_tier, score, self.penalty_threshold);

        let active_matches = match self.storage.all_active_user_matches(user) {
            Ok(matches) => matches
                .iter()
                .map(|m| match_snapshot(user, m))
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(user = %user, %err, "active match lookup failed");
                return Some(server_error());
            }
        };
        let active_order_statuses = match self.storage.active_user_order_statuses(user) {
            Ok(statuses) => statuses
                .iter()
                .map(|o| OrderStatusNote {
                    id: o.order_id.as_bytes().to_vec(),
                    status: o.status.as_u16(),
                })
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(user = %user, %err, "active order lookup failed");
                return Some(server_error());
            }
        };

        let mut result = ConnectResult {
            sig: vec![],
            active_matches,
            active_order_statuses,
            score,
            tier: user_tier,
            bonds: live_bonds
                .iter()
                .map(|b| BondNote {
                    asset_id: b.asset_id,
                    coin_id: b.coin_id.clone(),
                    strength: b.strength,
                    lock_time: b.lock_time,
                })
                .collect(),
            server_time: now_ms(),
        };
        let mut signables: [&mut dyn Signable; 1] = [&mut result];
        self.sign(&mut signables);

        let resp = match Message::response(message.id, Some(&result), None) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%err, "connect result encoding failed");
                return Some(server_error());
            }
        };

        // Deliver before installing: a reconnect whose response cannot be
        // sent must not evict the session that still works.
        if let Err(err) = link.send(&resp) {
            debug!(user = %user, link = link.id(), %err, "connect response undelivered");
            return None;
        }

        let session = ClientSession::new(
            user,
            acct.pubkey,
            Arc::clone(&link),
            outcomes,
            score,
            user_tier,
            live_bonds,
        );
        if let Some(prior) = self.install_session(session) {
            debug!(user = %user, old_link = prior.link_id(), "displacing prior session");
            prior.close();
        }

        info!(
            user = %user,
            addr = %link.addr(),
            tier = user_tier,
            score,
            bond_tier,
            "user authenticated"
        );
        None
    }
}

/// Project stored match data onto the connecting user's view of it.
fn match_snapshot(user: AccountId, m: &MatchData) -> MatchSnapshot {
    let (side, order_id, address) = if m.taker_acct == user {
        (MatchSide::Taker, m.taker_order, m.maker_addr.clone())
    } else {
        (MatchSide::Maker, m.maker_order, m.taker_addr.clone())
    };
    MatchSnapshot {
        order_id: order_id.as_bytes().to_vec(),
        match_id: m.id.as_bytes().to_vec(),
        quantity: m.quantity,
        rate: m.rate,
        address,
        status: m.status.as_u8(),
        side: side.as_u8(),
        fee_rate_base: m.base_rate,
        fee_rate_quote: m.quote_rate,
        server_time: m.match_time_ms,
    }
}
