//! Authenticated `match_status` and `order_status` routes: reconnecting
//! clients use these to resynchronize in-flight swaps and orders.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use spindrift_core::ids::{MatchId, MatchStatus, OrderId};
use spindrift_core::msg::{
    self, MatchRequest, MatchStatusResult, Message, OrderStatusNote, OrderStatusRequest,
};

use crate::link::Link;
use crate::manager::{server_error, AuthManager};
use crate::storage::MatchStatusRec;

impl AuthManager {
    /// Report swap progress for the requested matches. Counterparty
    /// contract data is attached only for the side that must audit it:
    /// the taker while the match sits at `MakerSwapCast`, the maker at
    /// `TakerSwapCast`.
    pub fn handle_match_status(
        &self,
        link: Arc<dyn Link>,
        message: &Message,
    ) -> Option<msg::Error> {
        let Some(session) = self.conn_session(link.id()) else {
            return Some(unauthorized());
        };
        let reqs: Vec<MatchRequest> = match message.parse_payload() {
            Ok(reqs) => reqs,
            Err(err) => {
                debug!(user = %session.acct, %err, "bad match_status payload");
                return Some(parse_error("error parsing match_status request"));
            }
        };

        // Group by market so storage is consulted once per pair.
        let mut markets: HashMap<(u32, u32), Vec<MatchId>> = HashMap::new();
        for req in &reqs {
            let Some(mid) = MatchId::from_slice(&req.match_id) else {
                return Some(parse_error("invalid match ID"));
            };
            markets.entry((req.base, req.quote)).or_default().push(mid);
        }

        let mut results: Vec<MatchStatusResult> = Vec::with_capacity(reqs.len());
        for ((base, quote), mids) in markets {
            let recs = match self.storage.match_statuses(session.acct, base, quote, &mids) {
                Ok(recs) => recs,
                Err(err) => {
                    warn!(user = %session.acct, %err, "match status lookup failed");
                    return Some(server_error());
                }
            };
            for rec in recs {
                results.push(self.match_status_result(&rec));
            }
        }

        let resp = match Message::response(message.id, Some(&results), None) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%err, "match_status result encoding failed");
                return Some(server_error());
            }
        };
        if let Err(err) = session.send(&resp) {
            debug!(user = %session.acct, %err, "match_status response undelivered");
        }
        None
    }

    fn match_status_result(&self, rec: &MatchStatusRec) -> MatchStatusResult {
        let mut result = MatchStatusResult {
            match_id: rec.match_id.as_bytes().to_vec(),
            status: rec.status.map(MatchStatus::as_u8).unwrap_or_default(),
            active: rec.active,
            maker_swap: rec.maker_swap.clone(),
            taker_swap: rec.taker_swap.clone(),
            maker_redeem: rec.maker_redeem.clone(),
            ..MatchStatusResult::default()
        };
        match rec.status {
            Some(MatchStatus::MakerSwapCast) if rec.is_taker && !rec.maker_swap.is_empty() => {
                result.maker_tx_data = self.swap_tx_data(rec.maker_swap_asset, &rec.maker_swap);
            }
            Some(MatchStatus::TakerSwapCast) if rec.is_maker && !rec.taker_swap.is_empty() => {
                result.taker_tx_data = self.swap_tx_data(rec.taker_swap_asset, &rec.taker_swap);
            }
            _ => {}
        }
        result
    }

    fn swap_tx_data(&self, asset_id: u32, coin_id: &[u8]) -> Vec<u8> {
        let Some(source) = self.tx_data_sources.get(&asset_id) else {
            debug!(asset_id, "no tx data source");
            return vec![];
        };
        match source(coin_id) {
            Ok(data) => data,
            Err(err) => {
                warn!(asset_id, %err, "swap tx data lookup failed");
                vec![]
            }
        }
    }

    /// Report book status for the requested orders.
    pub fn handle_order_status(
        &self,
        link: Arc<dyn Link>,
        message: &Message,
    ) -> Option<msg::Error> {
        let Some(session) = self.conn_session(link.id()) else {
            return Some(unauthorized());
        };
        let reqs: Vec<OrderStatusRequest> = match message.parse_payload() {
            Ok(reqs) => reqs,
            Err(err) => {
                debug!(user = %session.acct, %err, "bad order_status payload");
                return Some(parse_error("error parsing order_status request"));
            }
        };

        let mut markets: HashMap<(u32, u32), Vec<OrderId>> = HashMap::new();
        for req in &reqs {
            let Some(oid) = OrderId::from_slice(&req.order_id) else {
                return Some(parse_error("invalid order ID"));
            };
            markets.entry((req.base, req.quote)).or_default().push(oid);
        }

        let mut results: Vec<OrderStatusNote> = Vec::with_capacity(reqs.len());
        for ((base, quote), oids) in markets {
            let recs = match self
                .storage
                .user_order_statuses(session.acct, base, quote, &oids)
            {
                Ok(recs) => recs,
                Err(err) => {
                    warn!(user = %session.acct, %err, "order status lookup failed");
                    return Some(server_error());
                }
            };
            results.extend(recs.iter().map(|rec| OrderStatusNote {
                id: rec.order_id.as_bytes().to_vec(),
                status: rec.status.as_u16(),
            }));
        }

        let resp = match Message::response(message.id, Some(&results), None) {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%err, "order_status result encoding failed");
                return Some(server_error());
            }
        };
        if let Err(err) = session.send(&resp) {
            debug!(user = %session.acct, %err, "order_status response undelivered");
        }
        None
    }
}

fn unauthorized() -> msg::Error {
    msg::Error::new(
        msg::UNAUTHORIZED_CONNECTION,
        "cannot use route before authenticating",
    )
}

fn parse_error(detail: &str) -> msg::Error {
    msg::Error::new(msg::RPC_PARSE_ERROR, detail)
}
