//! Session authentication and reputation for the spindrift DEX server.
//!
//! The [`AuthManager`] owns the lifecycle of every authenticated session:
//! it proves key ownership during the `connect` handshake, binds the live
//! connection to its account, correlates outbound requests with inbound
//! responses, scores recent trading behavior, and derives each user's
//! tier from posted bonds and accumulated violations.
//!
//! Persistence and transport stay outside: storage is consumed through
//! the [`storage::Storage`] capability, connections through
//! [`link::Link`].

pub mod bonds;
pub mod config;
pub mod connect;
pub mod link;
pub mod manager;
pub mod session;
pub mod status;
pub mod storage;

pub use bonds::{BondError, PREPAID_BOND_ASSET};
pub use config::{BondAsset, Config, ConfigError, ParsedBondTx};
pub use link::{AuthRouteHandler, Link, MsgHandler, RouteRegistrar};
pub use manager::{AuthError, AuthManager, RequestError};
pub use session::{ClientSession, DEFAULT_REQUEST_TIMEOUT};
pub use storage::{Account, Bond, Storage};
