//! The auth manager: the process-wide coordinator that binds links to
//! accounts, correlates requests with responses, and keeps every
//! connected user's reputation and tier current.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use spindrift_core::ids::{AccountId, MatchId, MatchStatus, OrderId};
use spindrift_core::msg::{self, Message, TierChangedNote, TIER_CHANGE_ROUTE};
use spindrift_core::time::now_secs;
use spindrift_crypto::{verify_sig, Signer};
use spindrift_reputation::outcomes::{
    MatchOutcome, Outcome, OrderOutcome, OutcomeClass, PreimageOutcome, UserOutcomes,
};
use spindrift_reputation::score::{MATCH_WINDOW, ORDER_WINDOW, PREIMAGE_WINDOW};
use spindrift_reputation::{grace_limit, tier, user_score};

use crate::config::{
    BondAsset, BondTxParser, Config, ConfigError, ConfsSource, TxDataSource, UserUnbooker,
};
use crate::link::{AuthRouteHandler, Link, MsgHandler, RouteRegistrar};
use crate::session::{ClientSession, ExpireHandler, ResponseHandler, DEFAULT_REQUEST_TIMEOUT};
use crate::storage::{Bond, Storage};

/// How often the bond-expiry sweep runs.
const BOND_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user not connected")]
    NotConnected,
    #[error("signature validation failed")]
    BadSignature,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("user not connected")]
    NotConnected,
    #[error("request send failed: {0}")]
    Send(String),
}

#[derive(Default)]
struct Registry {
    users: HashMap<AccountId, Arc<ClientSession>>,
    links: HashMap<u64, Arc<ClientSession>>,
}

struct OutcomeEntry {
    data: Arc<Mutex<UserOutcomes>>,
    /// When the user disconnected, for MIA eviction. `None` while online.
    mia_since: Option<Instant>,
}

pub struct AuthManager {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) bond_expiry: i64,
    pub(crate) min_bond_lock_time: i64,
    pub(crate) bond_assets: HashMap<String, BondAsset>,
    pub(crate) bond_tx_parser: Option<BondTxParser>,
    pub(crate) bond_confs_sources: HashMap<u32, ConfsSource>,
    pub(crate) tx_data_sources: HashMap<u32, TxDataSource>,
    pub(crate) cancel_thresh: f64,
    pub(crate) penalty_threshold: i32,
    mia_timeout: Duration,
    unbooker: Option<UserUnbooker>,
    registrar: Option<RouteRegistrar>,

    registry: Mutex<Registry>,
    outcomes: Mutex<HashMap<AccountId, OutcomeEntry>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuthManager {
    pub fn new(cfg: Config) -> Result<Arc<Self>, ConfigError> {
        cfg.validate()?;
        let min_bond_lock_time = if cfg.min_bond_lock_time == 0 {
            2 * cfg.bond_expiry
        } else {
            cfg.min_bond_lock_time
        };
        let penalty_threshold = if cfg.penalty_threshold > 0 {
            cfg.penalty_threshold
        } else {
            spindrift_reputation::DEFAULT_PENALTY_THRESHOLD
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            storage: cfg.storage,
            signer: cfg.signer,
            bond_expiry: cfg.bond_expiry as i64,
            min_bond_lock_time: min_bond_lock_time as i64,
            bond_assets: cfg.bond_assets,
            bond_tx_parser: cfg.bond_tx_parser,
            bond_confs_sources: cfg.bond_confs_sources,
            tx_data_sources: cfg.tx_data_sources,
            cancel_thresh: cfg.cancel_threshold,
            penalty_threshold,
            mia_timeout: cfg.mia_user_timeout,
            unbooker: cfg.user_unbooker,
            registrar: cfg.route,
            registry: Mutex::new(Registry::default()),
            outcomes: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Register our routes with the transport and start the background
    /// sweeps. Call once, from within the runtime.
    pub fn start(self: &Arc<Self>) {
        if let Some(registrar) = &self.registrar {
            let mgr = Arc::clone(self);
            let connect: MsgHandler = Arc::new(move |link: Arc<dyn Link>, message: &Message| {
                mgr.handle_connect(link, message)
            });
            registrar(msg::CONNECT_ROUTE, connect);

            let mgr = Arc::clone(self);
            let match_status: MsgHandler =
                Arc::new(move |link: Arc<dyn Link>, message: &Message| {
                    mgr.handle_match_status(link, message)
                });
            registrar(msg::MATCH_STATUS_ROUTE, match_status);

            let mgr = Arc::clone(self);
            let order_status: MsgHandler =
                Arc::new(move |link: Arc<dyn Link>, message: &Message| {
                    mgr.handle_order_status(link, message)
                });
            registrar(msg::ORDER_STATUS_ROUTE, order_status);
        }

        let mia_interval = (self.mia_timeout / 4).max(Duration::from_secs(1));
        self.spawn_sweep(mia_interval, |mgr| mgr.sweep_mia());
        self.spawn_sweep(BOND_SWEEP_INTERVAL, |mgr| {
            mgr.expire_bonds_at(now_secs());
        });
    }

    fn spawn_sweep(
        self: &Arc<Self>,
        interval: Duration,
        body: impl Fn(&AuthManager) + Send + 'static,
    ) {
        let mgr = Arc::clone(self);
        let mut shut = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shut.changed() => break,
                    _ = tokio::time::sleep(interval) => body(&mgr),
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Stop background work. Connected sessions stay up; the transport
    /// owns their lifetime.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // ─── Registry ────────────────────────────────────────────────────

    fn reg(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live session for an account, if connected.
    pub fn user(&self, user: AccountId) -> Option<Arc<ClientSession>> {
        self.reg().users.get(&user).cloned()
    }

    /// The session bound to a connection.
    pub(crate) fn conn_session(&self, link_id: u64) -> Option<Arc<ClientSession>> {
        self.reg().links.get(&link_id).cloned()
    }

    /// Snapshot of every live session.
    pub(crate) fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.reg().users.values().cloned().collect()
    }

    /// `(connected, tier)` for an account; tier is zero for users we hold
    /// no session for.
    pub fn acct_status(&self, user: AccountId) -> (bool, i64) {
        match self.user(user) {
            Some(session) => (true, session.tier()),
            None => (false, 0),
        }
    }

    /// Swap `session` into the registry, returning any session it
    /// displaced. The registry lock covers both the removal and the
    /// insert so concurrent connects for one account serialize.
    pub(crate) fn install_session(
        &self,
        session: Arc<ClientSession>,
    ) -> Option<Arc<ClientSession>> {
        let mut reg = self.reg();
        let prior = reg.users.remove(&session.acct);
        if let Some(prior) = &prior {
            reg.links.remove(&prior.link_id());
        }
        reg.links.insert(session.link_id(), Arc::clone(&session));
        reg.users.insert(session.acct, session);
        prior
    }

    /// Remove a session from the registry and close it. The removal is
    /// guarded against racing a reconnect: a registry entry that no
    /// longer points at `session` is left alone.
    pub fn remove_client(&self, session: &Arc<ClientSession>) {
        {
            let mut reg = self.reg();
            if reg
                .users
                .get(&session.acct)
                .is_some_and(|cur| Arc::ptr_eq(cur, session))
            {
                reg.users.remove(&session.acct);
            }
            if reg
                .links
                .get(&session.link_id())
                .is_some_and(|cur| Arc::ptr_eq(cur, session))
            {
                reg.links.remove(&session.link_id());
            }
        }
        self.mark_mia(session.acct);
        session.close();
        debug!(user = %session.acct, "session removed");
    }

    /// Transport notification that a connection dropped.
    pub fn link_disconnected(&self, link_id: u64) {
        if let Some(session) = self.conn_session(link_id) {
            self.remove_client(&session);
        }
    }

    // ─── Outcome retention ───────────────────────────────────────────

    fn outcome_map(&self) -> MutexGuard<'_, HashMap<AccountId, OutcomeEntry>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The user's live windows, creating empty ones if none are retained.
    fn live_outcomes(&self, user: AccountId) -> Arc<Mutex<UserOutcomes>> {
        let mut map = self.outcome_map();
        let entry = map.entry(user).or_insert_with(|| OutcomeEntry {
            data: Arc::new(Mutex::new(UserOutcomes::new())),
            mia_since: None,
        });
        entry.mia_since = None;
        Arc::clone(&entry.data)
    }

    /// The user's live windows, loading history from storage when nothing
    /// is retained in memory.
    pub(crate) fn load_outcomes(
        &self,
        user: AccountId,
    ) -> anyhow::Result<Arc<Mutex<UserOutcomes>>> {
        if let Some(entry) = self.outcome_map().get_mut(&user) {
            entry.mia_since = None;
            return Ok(Arc::clone(&entry.data));
        }

        let preimages = self.storage.preimage_stats(user, PREIMAGE_WINDOW)?;
        let matches = self
            .storage
            .completed_and_at_fault_match_stats(user, MATCH_WINDOW)?;

        // Merge completions and counted cancels into one order stream,
        // oldest first. Cancels targeting an order more than one epoch
        // back are free and never recorded.
        let mut orders: Vec<OrderOutcome> = Vec::new();
        for (oid, time_ms) in self.storage.completed_user_orders(user, ORDER_WINDOW)? {
            orders.push(OrderOutcome {
                db_id: 0,
                order_id: oid,
                canceled: false,
                time_ms,
            });
        }
        for cancel in self.storage.executed_cancels_for_user(user, ORDER_WINDOW)? {
            if cancel.epoch_gap > 1 {
                continue;
            }
            orders.push(OrderOutcome {
                db_id: 0,
                order_id: cancel.id,
                canceled: true,
                time_ms: cancel.match_time_ms,
            });
        }
        orders.sort_by_key(|o| o.time_ms);

        let loaded = Arc::new(Mutex::new(UserOutcomes::load(preimages, matches, orders)));
        let mut map = self.outcome_map();
        let entry = map.entry(user).or_insert_with(|| OutcomeEntry {
            data: loaded,
            mia_since: None,
        });
        entry.mia_since = None;
        Ok(Arc::clone(&entry.data))
    }

    fn mark_mia(&self, user: AccountId) {
        if let Some(entry) = self.outcome_map().get_mut(&user) {
            entry.mia_since = Some(Instant::now());
        }
    }

    /// Evict outcome history of users who have been gone longer than the
    /// MIA timeout.
    pub(crate) fn sweep_mia(&self) {
        let timeout = self.mia_timeout;
        let mut map = self.outcome_map();
        let before = map.len();
        map.retain(|_, entry| match entry.mia_since {
            Some(since) => since.elapsed() < timeout,
            None => true,
        });
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, "evicted MIA outcome history");
        }
    }

    // ─── Reputation maintenance ──────────────────────────────────────

    pub(crate) fn bond_tier(&self, bonds: &[Bond], now: i64) -> u32 {
        bonds
            .iter()
            .filter(|b| b.is_live(now, self.bond_expiry))
            .map(|b| b.strength)
            .sum()
    }

    /// Compute the user's score from their retained history in storage.
    pub fn load_user_score(&self, user: AccountId) -> anyhow::Result<i32> {
        let outcomes = self.load_outcomes(user)?;
        let score = {
            let oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            user_score(&oc, self.cancel_thresh)
        };
        Ok(score)
    }

    /// Outcome bins of the user's live windows, for operator inspection.
    pub fn user_outcome_bins(&self, user: AccountId) -> HashMap<Outcome, u32> {
        let Some(entry) = self.outcome_map().get(&user).map(|e| Arc::clone(&e.data)) else {
            return HashMap::new();
        };
        let oc = entry.lock().unwrap_or_else(PoisonError::into_inner);
        oc.bin_violations()
    }

    /// Recompute score and tier for a connected user and react to tier
    /// movement: notify the client, and unbook on suspension.
    pub(crate) fn recompute_reputation(&self, user: AccountId) {
        let Some(session) = self.user(user) else {
            return;
        };
        let outcomes = session.outcomes();
        let score = {
            let oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            user_score(&oc, self.cancel_thresh)
        };
        let bond_tier = self.bond_tier(&session.bonds(), now_secs());
        let new_tier = tier(bond_tier, score, self.penalty_threshold);
        let old_tier = session.tier();
        session.set_reputation(score, new_tier);

        if new_tier == old_tier {
            return;
        }
        info!(user = %user, old_tier, new_tier, score, "tier changed");
        let note = TierChangedNote {
            tier: new_tier,
            score,
        };
        match Message::notification(TIER_CHANGE_ROUTE, &note) {
            Ok(note) => {
                if let Err(err) = session.send(&note) {
                    debug!(user = %user, %err, "tier change note undelivered");
                }
            }
            Err(err) => warn!(%err, "tier change note encoding failed"),
        }
        if old_tier > 0 && new_tier <= 0 {
            warn!(user = %user, score, "user suspended");
            if let Some(unbooker) = &self.unbooker {
                unbooker(user);
            }
        }
    }

    // ─── Facade operations ───────────────────────────────────────────

    /// Sign each signable with the server key and attach the signature.
    pub fn sign(&self, signables: &mut [&mut dyn msg::Signable]) {
        for signable in signables.iter_mut() {
            let sig = self.signer.sign(&signable.signing_bytes());
            signable.set_sig(sig);
        }
    }

    /// Verify a client signature over `message` under the connected
    /// account's public key.
    pub fn auth(&self, user: AccountId, message: &[u8], sig: &[u8]) -> Result<(), AuthError> {
        let session = self.user(user).ok_or(AuthError::NotConnected)?;
        if verify_sig(session.pubkey(), message, sig) {
            Ok(())
        } else {
            Err(AuthError::BadSignature)
        }
    }

    /// Deliver a notification; a no-op when the user is not connected.
    pub fn send(&self, user: AccountId, message: &Message) {
        let Some(session) = self.user(user) else {
            trace!(user = %user, "send to unconnected user dropped");
            return;
        };
        if let Err(err) = session.send(message) {
            debug!(user = %user, %err, "send failed");
        }
    }

    /// Send a request and register `respond` for its reply, with the
    /// default timeout and no expiry action.
    pub fn request(
        &self,
        user: AccountId,
        message: &Message,
        respond: impl FnOnce(Arc<dyn Link>, &Message) + Send + 'static,
    ) -> Result<(), RequestError> {
        self.request_with_timeout(user, message, respond, DEFAULT_REQUEST_TIMEOUT, || {})
    }

    /// Send a request; exactly one of `respond` and `expire` will run.
    pub fn request_with_timeout(
        &self,
        user: AccountId,
        message: &Message,
        respond: impl FnOnce(Arc<dyn Link>, &Message) + Send + 'static,
        ttl: Duration,
        expire: impl FnOnce() + Send + 'static,
    ) -> Result<(), RequestError> {
        let session = self.user(user).ok_or(RequestError::NotConnected)?;
        let respond: ResponseHandler = Box::new(respond);
        let expire: ExpireHandler = Box::new(expire);
        session
            .request(message, respond, ttl, expire)
            .map_err(|err| RequestError::Send(err.to_string()))
    }

    /// Register an authenticated route. Inbound dispatch resolves the
    /// connection to its account first and rejects unbound links.
    pub fn route(self: &Arc<Self>, name: &str, handler: AuthRouteHandler) {
        let Some(registrar) = &self.registrar else {
            warn!(route = name, "no route registrar configured");
            return;
        };
        let mgr = Arc::clone(self);
        let wrapped: MsgHandler = Arc::new(move |link: Arc<dyn Link>, message: &Message| {
            let Some(session) = mgr.conn_session(link.id()) else {
                return Some(msg::Error::new(
                    msg::UNAUTHORIZED_CONNECTION,
                    "cannot use route before authenticating",
                ));
            };
            handler(session.acct, message)
        });
        registrar(name, wrapped);
    }

    /// Match an inbound response against the pending handler registered
    /// on the connection's session. Duplicates and strays get an
    /// unknown-response-ID error; unauthenticated links get nothing.
    pub fn handle_response(&self, link: Arc<dyn Link>, message: &Message) {
        let Some(session) = self.conn_session(link.id()) else {
            trace!(link = link.id(), "response on unauthenticated link dropped");
            return;
        };
        match session.take_handler(message.id) {
            Some(entry) => (entry.respond)(link, message),
            None => {
                debug!(user = %session.acct, id = message.id, "unknown response ID");
                let err = msg::Error::new(msg::UNKNOWN_RESPONSE_ID, "unknown response ID");
                match Message::response(message.id, None::<&()>, Some(err)) {
                    Ok(resp) => {
                        if let Err(err) = session.send(&resp) {
                            debug!(user = %session.acct, %err, "error response undelivered");
                        }
                    }
                    Err(err) => warn!(%err, "error response encoding failed"),
                }
            }
        }
    }

    /// The configured grace count, for clients to display.
    pub fn grace_limit(&self) -> i64 {
        grace_limit(self.cancel_thresh)
    }

    // ─── Outcome recording ───────────────────────────────────────────

    /// Record a completed order toward the user's cancel ratio.
    pub fn record_completed_order(&self, user: AccountId, oid: OrderId, time_ms: i64) {
        self.record_order_outcome(user, oid, false, time_ms);
    }

    /// Record an executed cancel. A cancel whose target sat more than one
    /// epoch back is free: no counterparty could have appeared, so it is
    /// not held against the user.
    pub fn record_cancel(
        &self,
        user: AccountId,
        oid: OrderId,
        target: OrderId,
        epoch_gap: i32,
        time_ms: i64,
    ) {
        if epoch_gap > 1 {
            debug!(user = %user, %oid, %target, epoch_gap, "free cancel not counted");
            return;
        }
        self.record_order_outcome(user, oid, true, time_ms);
    }

    fn record_order_outcome(&self, user: AccountId, oid: OrderId, canceled: bool, time_ms: i64) {
        let db_id = match self.storage.add_order_outcome(user, oid, canceled) {
            Ok(id) => id,
            Err(err) => {
                warn!(user = %user, %err, "order outcome not persisted");
                return;
            }
        };
        let outcomes = self.live_outcomes(user);
        let prune_from = {
            let mut oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = oc.orders.add(OrderOutcome {
                db_id,
                order_id: oid,
                canceled,
                time_ms,
            });
            evicted
                .and(oc.orders.oldest().map(|o| o.db_id))
                .filter(|id| *id > 0)
        };
        if let Some(from_db_id) = prune_from {
            if let Err(err) = self
                .storage
                .prune_outcomes(user, OutcomeClass::Order, from_db_id)
            {
                warn!(user = %user, %err, "order outcome prune failed");
            }
        }
        self.recompute_reputation(user);
    }

    /// Record the result of an epoch preimage request.
    pub fn record_preimage_outcome(&self, user: AccountId, oid: OrderId, miss: bool, time_ms: i64) {
        if let Err(err) = self.storage.add_preimage_outcome(user, oid, miss) {
            warn!(user = %user, %err, "preimage outcome not persisted");
            return;
        }
        let outcomes = self.live_outcomes(user);
        {
            let mut oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            oc.preimages.add(PreimageOutcome {
                order_id: oid,
                miss,
                time_ms,
            });
        }
        self.recompute_reputation(user);
    }

    /// Record a terminal match outcome. `fail` on a non-terminal status
    /// marks an inactivity default by this user's side.
    pub fn record_match_outcome(
        &self,
        user: AccountId,
        mid: MatchId,
        status: MatchStatus,
        fail: bool,
        value: u64,
        time_ms: i64,
    ) {
        if status == MatchStatus::MatchComplete && fail {
            warn!(user = %user, %mid, "completed match reported as failure; ignored");
            return;
        }
        if let Err(err) = self.storage.add_match_outcome(user, mid, status, fail, value) {
            warn!(user = %user, %err, "match outcome not persisted");
            return;
        }
        let outcomes = self.live_outcomes(user);
        {
            let mut oc = outcomes.lock().unwrap_or_else(PoisonError::into_inner);
            oc.matches.add(MatchOutcome {
                match_id: mid,
                status,
                fail,
                value,
                time_ms,
            });
        }
        self.recompute_reputation(user);
    }

    /// Wipe the user's violation history, in storage and in memory, and
    /// restore their tier.
    pub fn forgive_user(&self, user: AccountId) -> anyhow::Result<()> {
        let fails = self
            .storage
            .user_match_fails(user, MATCH_WINDOW)
            .map(|f| f.len())
            .unwrap_or(0);
        self.storage.forgive_user(user)?;
        if let Some(entry) = self.outcome_map().get(&user).map(|e| Arc::clone(&e.data)) {
            entry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .forgive();
        }
        info!(user = %user, forgiven_fails = fails, "user forgiven");
        self.recompute_reputation(user);
        Ok(())
    }
}

pub(crate) fn server_error() -> msg::Error {
    msg::Error::new(msg::SERVER_ERROR, "internal server error")
}
