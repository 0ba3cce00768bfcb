//! Per-connected-user state: the link, pending response handlers with
//! their expiry timers, and the live reputation numbers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use spindrift_core::ids::AccountId;
use spindrift_core::msg::Message;
use spindrift_reputation::outcomes::UserOutcomes;

use crate::link::Link;
use crate::storage::Bond;

/// Applied when a caller does not specify a request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Applied when a caller passes a zero TTL.
const MIN_RESPONSE_TTL: Duration = Duration::from_secs(1);

/// Consumes the matched response.
pub type ResponseHandler = Box<dyn FnOnce(Arc<dyn Link>, &Message) + Send>;
/// Runs when no response arrived in time.
pub type ExpireHandler = Box<dyn FnOnce() + Send>;

pub(crate) struct HandlerEntry {
    pub respond: ResponseHandler,
    pub expire: ExpireHandler,
    timer: JoinHandle<()>,
}

struct SessionState {
    score: i32,
    tier: i64,
    /// Bonds currently counting toward tier.
    bonds: Vec<Bond>,
    resp_handlers: HashMap<u64, HandlerEntry>,
    closed: bool,
}

/// One authenticated connection. Created by a successful `connect`,
/// destroyed by disconnect without reconnect. Every mutable field lives
/// behind the session mutex; expiry timers re-acquire it before touching
/// the handler map.
pub struct ClientSession {
    pub acct: AccountId,
    pubkey: Vec<u8>,
    link: Arc<dyn Link>,
    outcomes: Arc<Mutex<UserOutcomes>>,
    state: Mutex<SessionState>,
}

impl ClientSession {
    pub fn new(
        acct: AccountId,
        pubkey: Vec<u8>,
        link: Arc<dyn Link>,
        outcomes: Arc<Mutex<UserOutcomes>>,
        score: i32,
        tier: i64,
        bonds: Vec<Bond>,
    ) -> Arc<Self> {
        Arc::new(Self {
            acct,
            pubkey,
            link,
            outcomes,
            state: Mutex::new(SessionState {
                score,
                tier,
                bonds,
                resp_handlers: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn locked(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link(&self) -> Arc<dyn Link> {
        Arc::clone(&self.link)
    }

    pub fn link_id(&self) -> u64 {
        self.link.id()
    }

    pub fn pubkey(&self) -> &[u8] {
        &self.pubkey
    }

    pub fn outcomes(&self) -> Arc<Mutex<UserOutcomes>> {
        Arc::clone(&self.outcomes)
    }

    pub fn score(&self) -> i32 {
        self.locked().score
    }

    pub fn tier(&self) -> i64 {
        self.locked().tier
    }

    pub fn bonds(&self) -> Vec<Bond> {
        self.locked().bonds.clone()
    }

    pub fn set_reputation(&self, score: i32, tier: i64) {
        let mut st = self.locked();
        st.score = score;
        st.tier = tier;
    }

    pub fn add_bond(&self, bond: Bond) {
        self.locked().bonds.push(bond);
    }

    pub fn set_bonds(&self, bonds: Vec<Bond>) {
        self.locked().bonds = bonds;
    }

    pub fn is_closed(&self) -> bool {
        self.locked().closed
    }

    #[cfg(test)]
    pub(crate) fn pending_handlers(&self) -> usize {
        self.locked().resp_handlers.len()
    }

    /// Serialize and hand a message to the link.
    pub fn send(&self, msg: &Message) -> anyhow::Result<()> {
        self.link.send(msg)
    }

    /// Register a response handler for request ID `id` and schedule its
    /// expiry. Exactly one of `respond` and `expire` will eventually run.
    pub fn log_req(
        self: &Arc<Self>,
        id: u64,
        respond: ResponseHandler,
        ttl: Duration,
        expire: ExpireHandler,
    ) {
        let ttl = if ttl.is_zero() { MIN_RESPONSE_TTL } else { ttl };
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            // Whoever removes the entry first owns its callbacks; a
            // response racing in here simply finds nothing to claim.
            if let Some(entry) = session.take_handler(id) {
                trace!(user = %session.acct, id, "response handler expired");
                (entry.expire)();
            }
        });

        let stale = {
            let mut st = self.locked();
            if st.closed {
                Some(HandlerEntry {
                    respond,
                    expire,
                    timer,
                })
            } else {
                st.resp_handlers.insert(
                    id,
                    HandlerEntry {
                        respond,
                        expire,
                        timer,
                    },
                );
                None
            }
        };
        // Session already torn down: report expiry immediately.
        if let Some(entry) = stale {
            entry.timer.abort();
            (entry.expire)();
        }
    }

    /// Consume the handler registered for `id`, cancelling its expiry
    /// timer. Returns `None` if it already fired or never existed.
    pub(crate) fn take_handler(&self, id: u64) -> Option<HandlerEntry> {
        let entry = self.locked().resp_handlers.remove(&id)?;
        entry.timer.abort();
        Some(entry)
    }

    /// Register the handler, then send. A send failure unregisters the
    /// handler again so neither callback ever runs; retrying is the
    /// caller's decision.
    pub fn request(
        self: &Arc<Self>,
        msg: &Message,
        respond: ResponseHandler,
        ttl: Duration,
        expire: ExpireHandler,
    ) -> anyhow::Result<()> {
        self.log_req(msg.id, respond, ttl, expire);
        if let Err(err) = self.link.send(msg) {
            drop(self.take_handler(msg.id));
            return Err(err);
        }
        Ok(())
    }

    /// Cancel all pending expiry timers, fire their expire callbacks, and
    /// disconnect the link. Idempotent.
    pub fn close(&self) {
        let entries: Vec<HandlerEntry> = {
            let mut st = self.locked();
            if st.closed {
                return;
            }
            st.closed = true;
            st.resp_handlers.drain().map(|(_, e)| e).collect()
        };
        if !entries.is_empty() {
            debug!(user = %self.acct, pending = entries.len(), "closing session with pending requests");
        }
        for entry in entries {
            entry.timer.abort();
            (entry.expire)();
        }
        self.link.disconnect();
    }
}
