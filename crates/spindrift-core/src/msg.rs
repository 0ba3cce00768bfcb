//! The JSON message envelope and the payload types the auth subsystem
//! speaks: `connect`, `match_status`, `order_status`, and the bond/tier
//! notifications.
//!
//! Field names are part of the wire contract and must not change.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ID_SIZE;

// ─── Routes ──────────────────────────────────────────────────────────

pub const CONNECT_ROUTE: &str = "connect";
pub const MATCH_STATUS_ROUTE: &str = "match_status";
pub const ORDER_STATUS_ROUTE: &str = "order_status";
pub const BOND_EXPIRED_ROUTE: &str = "bondexpired";
pub const BOND_CONFIRMED_ROUTE: &str = "bondconfirmed";
pub const TIER_CHANGE_ROUTE: &str = "tierchange";

// ─── Message-level error codes ───────────────────────────────────────

pub const RPC_PARSE_ERROR: u16 = 1;
pub const SIGNATURE_ERROR: u16 = 2;
pub const AUTHENTICATION_ERROR: u16 = 3;
pub const ACCOUNT_NOT_FOUND_ERROR: u16 = 4;
pub const UNAUTHORIZED_CONNECTION: u16 = 5;
pub const UNKNOWN_RESPONSE_ID: u16 = 6;
pub const SERVER_ERROR: u16 = 7;
pub const BOND_ERROR: u16 = 8;
pub const UNKNOWN_MARKET_ERROR: u16 = 9;

/// A message-level error, delivered inside a response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("code {code}: {message}")]
pub struct Error {
    pub code: u16,
    pub message: String,
}

impl Error {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// ─── Envelope ────────────────────────────────────────────────────────

/// Kind discriminant of a [`Message`]. Encoded as a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    Notification = 3,
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Notification),
            other => Err(serde::de::Error::custom(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// The framed message envelope. Requests and notifications carry their
/// payload directly; responses wrap theirs in a [`ResponsePayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(default)]
    pub id: u64,
    pub payload: Value,
}

/// Result-or-error body of a response message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Message {
    pub fn request<T: Serialize>(id: u64, route: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: MessageKind::Request,
            route: route.into(),
            id,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn response<T: Serialize>(
        id: u64,
        result: Option<&T>,
        error: Option<Error>,
    ) -> serde_json::Result<Self> {
        let body = ResponsePayload {
            result: result.map(serde_json::to_value).transpose()?,
            error,
        };
        Ok(Self {
            kind: MessageKind::Response,
            route: String::new(),
            id,
            payload: serde_json::to_value(&body)?,
        })
    }

    pub fn notification<T: Serialize>(route: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind: MessageKind::Notification,
            route: route.into(),
            id: 0,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode a request/notification payload.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }

    /// Decode the response body. Fails on non-response messages.
    pub fn response_payload(&self) -> serde_json::Result<ResponsePayload> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Process-unique, monotonically increasing message ID source.
pub fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

// ─── Signables ───────────────────────────────────────────────────────

/// A payload that carries a signature over a canonical byte serialization.
pub trait Signable {
    /// The bytes the signature covers.
    fn signing_bytes(&self) -> Vec<u8>;
    fn set_sig(&mut self, sig: Vec<u8>);
    fn sig(&self) -> &[u8];
}

// ─── Hex bridge for binary fields ────────────────────────────────────

/// Serde bridge: `Vec<u8>` as a lowercase hex string.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ─── connect ─────────────────────────────────────────────────────────

/// The `connect` request payload. The account ID is kept as raw bytes so
/// that a wrong-length ID parses and is rejected by the handshake with
/// the proper code rather than a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connect {
    #[serde(rename = "accountid", with = "hex_bytes")]
    pub account_id: Vec<u8>,
    #[serde(rename = "apiver")]
    pub api_version: u16,
    /// Client time, unix milliseconds.
    pub time: u64,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub sig: Vec<u8>,
}

impl Signable for Connect {
    /// accountID || be64(time) || be16(apiver)
    fn signing_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(ID_SIZE + 8 + 2);
        b.extend_from_slice(&self.account_id);
        b.extend_from_slice(&self.time.to_be_bytes());
        b.extend_from_slice(&self.api_version.to_be_bytes());
        b
    }

    fn set_sig(&mut self, sig: Vec<u8>) {
        self.sig = sig;
    }

    fn sig(&self) -> &[u8] {
        &self.sig
    }
}

/// An active match delivered in the `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    #[serde(rename = "orderid", with = "hex_bytes")]
    pub order_id: Vec<u8>,
    #[serde(rename = "matchid", with = "hex_bytes")]
    pub match_id: Vec<u8>,
    pub quantity: u64,
    pub rate: u64,
    /// Counterparty swap address.
    pub address: String,
    pub status: u8,
    pub side: u8,
    #[serde(rename = "feeratebase")]
    pub fee_rate_base: u64,
    #[serde(rename = "feeratequote")]
    pub fee_rate_quote: u64,
    /// Match time, unix milliseconds.
    #[serde(rename = "servertime")]
    pub server_time: u64,
}

/// An active order status delivered in the `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusNote {
    #[serde(with = "hex_bytes")]
    pub id: Vec<u8>,
    pub status: u16,
}

/// A live bond summarized in the `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondNote {
    #[serde(rename = "assetid")]
    pub asset_id: u32,
    #[serde(rename = "coinid", with = "hex_bytes")]
    pub coin_id: Vec<u8>,
    pub strength: u32,
    #[serde(rename = "locktime")]
    pub lock_time: i64,
}

/// The `connect` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub sig: Vec<u8>,
    #[serde(rename = "activeMatches")]
    pub active_matches: Vec<MatchSnapshot>,
    #[serde(rename = "activeOrderStatuses")]
    pub active_order_statuses: Vec<OrderStatusNote>,
    pub score: i32,
    pub tier: i64,
    pub bonds: Vec<BondNote>,
    #[serde(rename = "serverTime")]
    pub server_time: u64,
}

impl Signable for ConnectResult {
    /// serverTime and the account-independent reputation fields; the
    /// signature binds the response to this server's key.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(8 + 4 + 8);
        b.extend_from_slice(&self.server_time.to_be_bytes());
        b.extend_from_slice(&self.score.to_be_bytes());
        b.extend_from_slice(&self.tier.to_be_bytes());
        b
    }

    fn set_sig(&mut self, sig: Vec<u8>) {
        self.sig = sig;
    }

    fn sig(&self) -> &[u8] {
        &self.sig
    }
}

// ─── match_status / order_status ─────────────────────────────────────

/// One entry of a `match_status` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(default)]
    pub base: u32,
    #[serde(default)]
    pub quote: u32,
    #[serde(rename = "matchid", with = "hex_bytes")]
    pub match_id: Vec<u8>,
}

/// One entry of a `match_status` response payload. Contract and tx-data
/// fields are populated only for the side that needs them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchStatusResult {
    #[serde(rename = "matchid", with = "hex_bytes")]
    pub match_id: Vec<u8>,
    pub status: u8,
    pub active: bool,
    #[serde(
        rename = "makerswap",
        default,
        with = "hex_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub maker_swap: Vec<u8>,
    #[serde(
        rename = "takerswap",
        default,
        with = "hex_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub taker_swap: Vec<u8>,
    #[serde(
        rename = "makerredeem",
        default,
        with = "hex_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub maker_redeem: Vec<u8>,
    #[serde(
        rename = "makertxdata",
        default,
        with = "hex_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub maker_tx_data: Vec<u8>,
    #[serde(
        rename = "takertxdata",
        default,
        with = "hex_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub taker_tx_data: Vec<u8>,
}

/// One entry of an `order_status` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusRequest {
    #[serde(default)]
    pub base: u32,
    #[serde(default)]
    pub quote: u32,
    #[serde(rename = "orderid", with = "hex_bytes")]
    pub order_id: Vec<u8>,
}

// ─── Notifications ───────────────────────────────────────────────────

/// Sent when a bond leaves the tier calculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondExpiredNote {
    #[serde(rename = "assetid")]
    pub asset_id: u32,
    #[serde(rename = "coinid", with = "hex_bytes")]
    pub coin_id: Vec<u8>,
    pub tier: i64,
}

/// Sent when a submitted bond reaches its confirmation requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondConfirmedNote {
    #[serde(rename = "assetid")]
    pub asset_id: u32,
    #[serde(rename = "coinid", with = "hex_bytes")]
    pub coin_id: Vec<u8>,
    pub strength: u32,
    pub tier: i64,
}

/// Sent when a user's tier changes for any reason other than connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierChangedNote {
    pub tier: i64,
    pub score: i32,
}
