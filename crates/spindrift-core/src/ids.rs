//! Fixed-size identifiers shared across the wire protocol and storage.

use serde::{Deserialize, Serialize};

/// Byte length of every 32-byte identifier type below.
pub const ID_SIZE: usize = 32;

macro_rules! id32 {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; ID_SIZE]);

        impl $name {
            /// Build from a byte slice, rejecting anything but exactly 32 bytes.
            pub fn from_slice(b: &[u8]) -> Option<Self> {
                let arr: [u8; ID_SIZE] = b.try_into().ok()?;
                Some(Self(arr))
            }

            /// Parse from a hex string.
            pub fn from_hex(s: &str) -> Option<Self> {
                Self::from_slice(&hex::decode(s).ok()?)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                Self::from_hex(&s)
                    .ok_or_else(|| serde::de::Error::custom(concat!("bad ", stringify!($name))))
            }
        }
    };
}

id32! {
    /// Account identifier: a hash of the account's compressed public key.
    /// Uniquely names an account forever.
    AccountId
}

id32! {
    /// Order identifier.
    OrderId
}

id32! {
    /// Match identifier.
    MatchId
}

/// Which side of a match the user is on. The numeric values are wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MatchSide {
    Maker = 0,
    Taker = 1,
}

impl MatchSide {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Swap negotiation status. The numeric values are wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MatchStatus {
    NewlyMatched = 0,
    MakerSwapCast = 1,
    TakerSwapCast = 2,
    MakerRedeemed = 3,
    MatchComplete = 4,
}

impl MatchStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Order book status. The numeric values are wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OrderStatus {
    Unknown = 0,
    Epoch = 1,
    Booked = 2,
    Executed = 3,
    Canceled = 4,
    Revoked = 5,
}

impl OrderStatus {
    /// Epoch and booked orders are the ones a reconnecting client must
    /// still track.
    pub fn is_active(self) -> bool {
        matches!(self, OrderStatus::Epoch | OrderStatus::Booked)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}
