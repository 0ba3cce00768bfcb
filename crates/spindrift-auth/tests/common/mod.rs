//! Shared test rig: an in-memory storage double, a recording link, and
//! helpers to mint users and drive the connect handshake.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spindrift_auth::config::{BondTxParser, Config, ConfsSource, TxDataSource};
use spindrift_auth::link::{Link, MsgHandler};
use spindrift_auth::storage::{
    Account, Bond, CancelRecord, MatchData, MatchFail, MatchStatusRec, OrderStatusRec, Storage,
};
use spindrift_auth::{AuthManager, BondAsset};
use spindrift_core::ids::{AccountId, MatchId, MatchStatus, OrderId};
use spindrift_core::msg::{self, Connect, Message, Signable};
use spindrift_core::time::now_ms;
use spindrift_crypto::{account_id, KeySigner, Signer};
use spindrift_reputation::outcomes::{MatchOutcome, OutcomeClass, PreimageOutcome};

pub const BOND_EXPIRY: u64 = 86_400;
pub const BOND_ASSET_ID: u32 = 42;
pub const BOND_CONFS: u32 = 2;
pub const BOND_INCREMENT: u64 = 500_000_000;

// ─── Link double ─────────────────────────────────────────────────────

pub struct TLink {
    id: u64,
    pub fail_send: AtomicBool,
    pub closed: AtomicBool,
    sends: Mutex<Vec<Message>>,
}

impl TLink {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            fail_send: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sends: Mutex::new(Vec::new()),
        })
    }

    /// Oldest undelivered message, if any.
    pub fn pop_send(&self) -> Option<Message> {
        let mut sends = self.sends.lock().unwrap();
        if sends.is_empty() {
            None
        } else {
            Some(sends.remove(0))
        }
    }

    pub fn drain(&self) -> Vec<Message> {
        self.sends.lock().unwrap().drain(..).collect()
    }
}

impl Link for TLink {
    fn id(&self) -> u64 {
        self.id
    }

    fn addr(&self) -> String {
        "123.123.123.123:0".into()
    }

    fn send(&self, msg: &Message) -> anyhow::Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("test send error");
        }
        self.sends.lock().unwrap().push(msg.clone());
        Ok(())
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ─── Storage double ──────────────────────────────────────────────────

#[derive(Default)]
pub struct StorageInner {
    pub acct: Option<Account>,
    pub fail_account: bool,
    pub bonds: Vec<Bond>,
    pub matches: Vec<MatchData>,
    pub match_statuses: Vec<MatchStatusRec>,
    pub order_statuses: Vec<OrderStatusRec>,
    pub match_outcomes: Vec<MatchOutcome>,
    pub preimage_results: Vec<PreimageOutcome>,
    pub completed: Vec<(OrderId, i64)>,
    pub cancels: Vec<CancelRecord>,
    pub prepaid: HashMap<Vec<u8>, (u32, i64)>,
    pub deleted_prepaid: Vec<Vec<u8>>,
    pub added_bonds: Vec<(AccountId, Bond)>,
    pub created_accounts: Vec<Account>,
    pub order_outcomes_added: Vec<(AccountId, OrderId, bool)>,
    pub pruned: Vec<(AccountId, OutcomeClass, i64)>,
    pub forgiven: Vec<AccountId>,
    pub next_db_id: i64,
}

#[derive(Default)]
pub struct TStorage {
    pub inner: Mutex<StorageInner>,
}

impl TStorage {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, StorageInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_account(&self, acct: Account) {
        self.lock().acct = Some(acct);
    }

    /// One live bond of the given strength, locked far in the future.
    pub fn set_bond_tier(&self, strength: u32) {
        let lock_time = spindrift_core::time::now_secs() * 2;
        self.lock().bonds = vec![Bond {
            asset_id: BOND_ASSET_ID,
            coin_id: vec![0xbb; 4],
            strength,
            lock_time,
        }];
    }
}

impl Storage for TStorage {
    fn account(
        &self,
        _user: AccountId,
        lock_time_thresh: i64,
    ) -> anyhow::Result<(Option<Account>, Vec<Bond>)> {
        let inner = self.lock();
        if inner.fail_account {
            anyhow::bail!("test storage failure");
        }
        let bonds = inner
            .bonds
            .iter()
            .filter(|b| b.lock_time > lock_time_thresh)
            .cloned()
            .collect();
        Ok((inner.acct.clone(), bonds))
    }

    fn create_account_with_bond(&self, acct: &Account, bond: &Bond) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.created_accounts.push(acct.clone());
        inner.added_bonds.push((acct.id, bond.clone()));
        Ok(())
    }

    fn add_bond(&self, user: AccountId, bond: &Bond) -> anyhow::Result<()> {
        self.lock().added_bonds.push((user, bond.clone()));
        Ok(())
    }

    fn delete_bond(&self, asset_id: u32, coin_id: &[u8]) -> anyhow::Result<()> {
        self.lock()
            .added_bonds
            .retain(|(_, b)| !(b.asset_id == asset_id && b.coin_id == coin_id));
        Ok(())
    }

    fn fetch_prepaid_bond(&self, token: &[u8]) -> anyhow::Result<(u32, i64)> {
        self.lock()
            .prepaid
            .get(token)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no such prepaid bond"))
    }

    fn delete_prepaid_bond(&self, token: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.prepaid.remove(token);
        inner.deleted_prepaid.push(token.to_vec());
        Ok(())
    }

    fn store_prepaid_bonds(
        &self,
        tokens: &[Vec<u8>],
        strength: u32,
        lock_time: i64,
    ) -> anyhow::Result<()> {
        let mut inner = self.lock();
        for token in tokens {
            inner.prepaid.insert(token.clone(), (strength, lock_time));
        }
        Ok(())
    }

    fn completed_and_at_fault_match_stats(
        &self,
        _user: AccountId,
        _last_n: usize,
    ) -> anyhow::Result<Vec<MatchOutcome>> {
        Ok(self.lock().match_outcomes.clone())
    }

    fn preimage_stats(
        &self,
        _user: AccountId,
        _last_n: usize,
    ) -> anyhow::Result<Vec<PreimageOutcome>> {
        Ok(self.lock().preimage_results.clone())
    }

    fn user_match_fails(
        &self,
        _user: AccountId,
        _last_n: usize,
    ) -> anyhow::Result<Vec<MatchFail>> {
        Ok(vec![])
    }

    fn completed_user_orders(
        &self,
        _user: AccountId,
        _last_n: usize,
    ) -> anyhow::Result<Vec<(OrderId, i64)>> {
        Ok(self.lock().completed.clone())
    }

    fn executed_cancels_for_user(
        &self,
        _user: AccountId,
        _last_n: usize,
    ) -> anyhow::Result<Vec<CancelRecord>> {
        Ok(self.lock().cancels.clone())
    }

    fn active_user_order_statuses(&self, _user: AccountId) -> anyhow::Result<Vec<OrderStatusRec>> {
        Ok(self
            .lock()
            .order_statuses
            .iter()
            .filter(|o| o.status.is_active())
            .copied()
            .collect())
    }

    fn user_order_statuses(
        &self,
        _user: AccountId,
        _base: u32,
        _quote: u32,
        oids: &[OrderId],
    ) -> anyhow::Result<Vec<OrderStatusRec>> {
        Ok(self
            .lock()
            .order_statuses
            .iter()
            .filter(|o| oids.contains(&o.order_id))
            .copied()
            .collect())
    }

    fn all_active_user_matches(&self, _user: AccountId) -> anyhow::Result<Vec<MatchData>> {
        Ok(self.lock().matches.clone())
    }

    fn match_statuses(
        &self,
        _user: AccountId,
        _base: u32,
        _quote: u32,
        _mids: &[MatchId],
    ) -> anyhow::Result<Vec<MatchStatusRec>> {
        Ok(self.lock().match_statuses.clone())
    }

    fn add_preimage_outcome(
        &self,
        _user: AccountId,
        _oid: OrderId,
        _miss: bool,
    ) -> anyhow::Result<i64> {
        let mut inner = self.lock();
        inner.next_db_id += 1;
        Ok(inner.next_db_id)
    }

    fn add_match_outcome(
        &self,
        _user: AccountId,
        _mid: MatchId,
        _status: MatchStatus,
        _fail: bool,
        _value: u64,
    ) -> anyhow::Result<i64> {
        let mut inner = self.lock();
        inner.next_db_id += 1;
        Ok(inner.next_db_id)
    }

    fn add_order_outcome(
        &self,
        user: AccountId,
        oid: OrderId,
        canceled: bool,
    ) -> anyhow::Result<i64> {
        let mut inner = self.lock();
        inner.next_db_id += 1;
        inner.order_outcomes_added.push((user, oid, canceled));
        Ok(inner.next_db_id)
    }

    fn prune_outcomes(
        &self,
        user: AccountId,
        class: OutcomeClass,
        from_db_id: i64,
    ) -> anyhow::Result<()> {
        self.lock().pruned.push((user, class, from_db_id));
        Ok(())
    }

    fn forgive_user(&self, user: AccountId) -> anyhow::Result<()> {
        self.lock().forgiven.push(user);
        Ok(())
    }
}

// ─── Rig ─────────────────────────────────────────────────────────────

pub struct Rig {
    pub mgr: Arc<AuthManager>,
    pub storage: Arc<TStorage>,
    pub server: Arc<KeySigner>,
    pub routes: Arc<Mutex<HashMap<String, MsgHandler>>>,
    pub unbooked: Arc<Mutex<Vec<AccountId>>>,
}

pub struct RigOptions {
    pub cancel_threshold: f64,
    pub penalty_threshold: i32,
    pub bond_tx_parser: Option<BondTxParser>,
    pub bond_confs_sources: HashMap<u32, ConfsSource>,
    pub tx_data_sources: HashMap<u32, TxDataSource>,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            cancel_threshold: 0.9,
            penalty_threshold: 0,
            bond_tx_parser: None,
            bond_confs_sources: HashMap::new(),
            tx_data_sources: HashMap::new(),
        }
    }
}

pub fn new_rig(opts: RigOptions) -> Rig {
    let storage = Arc::new(TStorage::default());
    let server = Arc::new(KeySigner::generate());
    let routes: Arc<Mutex<HashMap<String, MsgHandler>>> = Arc::new(Mutex::new(HashMap::new()));
    let unbooked: Arc<Mutex<Vec<AccountId>>> = Arc::new(Mutex::new(Vec::new()));

    let routes2 = Arc::clone(&routes);
    let unbooked2 = Arc::clone(&unbooked);

    let cfg = Config {
        storage: Arc::clone(&storage) as Arc<dyn Storage>,
        signer: Arc::clone(&server) as Arc<dyn Signer>,
        bond_expiry: BOND_EXPIRY,
        min_bond_lock_time: 0,
        bond_assets: HashMap::from([(
            "dcr".to_string(),
            BondAsset {
                version: 0,
                id: BOND_ASSET_ID,
                confs: BOND_CONFS,
                amt: BOND_INCREMENT,
            },
        )]),
        bond_tx_parser: opts.bond_tx_parser,
        bond_confs_sources: opts.bond_confs_sources,
        tx_data_sources: opts.tx_data_sources,
        cancel_threshold: opts.cancel_threshold,
        penalty_threshold: opts.penalty_threshold,
        mia_user_timeout: Duration::from_secs(90),
        user_unbooker: Some(Arc::new(move |user| {
            unbooked2.lock().unwrap().push(user);
        })),
        route: Some(Arc::new(move |name: &str, handler: MsgHandler| {
            routes2.lock().unwrap().insert(name.to_string(), handler);
        })),
    };

    let mgr = AuthManager::new(cfg).expect("config");
    mgr.start();
    Rig {
        mgr,
        storage,
        server,
        routes,
        unbooked,
    }
}

// ─── Users ───────────────────────────────────────────────────────────

pub struct TUser {
    pub key: KeySigner,
    pub pubkey: Vec<u8>,
    pub acct: AccountId,
    pub link: Arc<TLink>,
}

impl TUser {
    pub fn new(link_id: u64) -> Self {
        let key = KeySigner::generate();
        let pubkey = key.pubkey();
        let acct = account_id(&pubkey);
        Self {
            key,
            pubkey,
            acct,
            link: TLink::new(link_id),
        }
    }

    pub fn account(&self) -> Account {
        Account {
            id: self.acct,
            pubkey: self.pubkey.clone(),
        }
    }

    pub fn dyn_link(&self) -> Arc<dyn Link> {
        Arc::clone(&self.link) as Arc<dyn Link>
    }

    pub fn signed_connect(&self) -> Message {
        let mut connect = Connect {
            account_id: self.acct.as_bytes().to_vec(),
            api_version: 0,
            time: now_ms(),
            sig: vec![],
        };
        let sig = self.key.sign(&connect.signing_bytes());
        connect.set_sig(sig);
        Message::request(msg::next_id(), msg::CONNECT_ROUTE, &connect).expect("connect encode")
    }

    /// Register the account with storage and complete a handshake,
    /// returning the response message.
    pub fn connect(&self, rig: &Rig) -> Message {
        rig.storage.set_account(self.account());
        let request = self.signed_connect();
        let rpc_err = rig.mgr.handle_connect(self.dyn_link(), &request);
        assert!(rpc_err.is_none(), "connect rejected: {rpc_err:?}");
        let resp = self.link.pop_send().expect("no connect response");
        assert_eq!(resp.id, request.id, "connect response has wrong ID");
        resp
    }
}

/// Decode the `ConnectResult` out of a connect response message.
pub fn connect_result(resp: &Message) -> msg::ConnectResult {
    let body = resp.response_payload().expect("response body");
    assert!(body.error.is_none(), "connect error: {:?}", body.error);
    serde_json::from_value(body.result.expect("connect result")).expect("decode connect result")
}

pub fn rand_order_id() -> OrderId {
    let mut b = [0u8; 32];
    for chunk in b.chunks_mut(8) {
        chunk.copy_from_slice(&rand::random::<u64>().to_be_bytes());
    }
    OrderId(b)
}

pub fn rand_match_id() -> MatchId {
    let mut b = [0u8; 32];
    for chunk in b.chunks_mut(8) {
        chunk.copy_from_slice(&rand::random::<u64>().to_be_bytes());
    }
    MatchId(b)
}
