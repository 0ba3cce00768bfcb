//! Bond acceptance, prepaid redemption, and expiry across live sessions.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::{
    connect_result, new_rig, RigOptions, TUser, BOND_ASSET_ID, BOND_EXPIRY, BOND_INCREMENT,
};
use spindrift_auth::config::ParsedBondTx;
use spindrift_auth::storage::Bond;
use spindrift_auth::{BondError, PREPAID_BOND_ASSET};
use spindrift_core::ids::AccountId;
use spindrift_core::msg::{self, MessageKind};
use spindrift_core::time::now_secs;

/// A parser whose reported account is set per test, like the asset
/// backend reporting the bond's committed account.
fn parser_opts(
    amount: u64,
    confs: Arc<AtomicU32>,
) -> (RigOptions, Arc<Mutex<AccountId>>) {
    let parse_acct = Arc::new(Mutex::new(AccountId::default()));
    let parse_acct2 = Arc::clone(&parse_acct);
    let mut opts = RigOptions::default();
    opts.bond_tx_parser = Some(Arc::new(move |_asset: u32, _ver: u16, _raw: &[u8]| {
        Ok(ParsedBondTx {
            coin_id: vec![0x07; 4],
            amount,
            lock_time: now_secs() + 3 * BOND_EXPIRY as i64,
            account_id: *parse_acct2.lock().unwrap(),
        })
    }));
    opts.bond_confs_sources.insert(
        BOND_ASSET_ID,
        Arc::new(move |_coin: &[u8]| Ok(confs.load(Ordering::SeqCst))),
    );
    (opts, parse_acct)
}

#[tokio::test]
async fn confirmed_bond_credits_connected_user() {
    let confs = Arc::new(AtomicU32::new(5));
    let (opts, parse_acct) = parser_opts(2 * BOND_INCREMENT, confs);
    let rig = new_rig(opts);

    let user = TUser::new(1);
    let resp = user.connect(&rig);
    assert_eq!(connect_result(&resp).tier, 0);

    *parse_acct.lock().unwrap() = user.acct;
    let bond = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 0, vec![0x01])
        .await
        .expect("bond rejected");
    assert_eq!(bond.strength, 2);
    assert_eq!(bond.asset_id, BOND_ASSET_ID);

    // Persisted against the existing account.
    {
        let inner = rig.storage.lock();
        assert!(inner.created_accounts.is_empty());
        assert_eq!(inner.added_bonds.len(), 1);
        assert_eq!(inner.added_bonds[0].0, user.acct);
    }

    // The live session was credited and notified.
    let session = rig.mgr.user(user.acct).expect("session");
    assert_eq!(session.tier(), 2);
    let notes = user.link.drain();
    assert!(notes
        .iter()
        .any(|n| n.kind == MessageKind::Notification && n.route == msg::BOND_CONFIRMED_ROUTE));
    assert!(notes
        .iter()
        .any(|n| n.kind == MessageKind::Notification && n.route == msg::TIER_CHANGE_ROUTE));
}

#[tokio::test]
async fn first_bond_creates_the_account() {
    let confs = Arc::new(AtomicU32::new(5));
    let (opts, parse_acct) = parser_opts(BOND_INCREMENT, confs);
    let rig = new_rig(opts);

    let user = TUser::new(1);
    *parse_acct.lock().unwrap() = user.acct;
    rig.mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 0, vec![0x01])
        .await
        .expect("bond rejected");

    let inner = rig.storage.lock();
    assert_eq!(inner.created_accounts.len(), 1);
    assert_eq!(inner.created_accounts[0].id, user.acct);
    assert_eq!(inner.created_accounts[0].pubkey, user.pubkey);
}

#[tokio::test]
async fn bond_waits_for_confirmations() {
    let confs = Arc::new(AtomicU32::new(0));
    let (opts, parse_acct) = parser_opts(BOND_INCREMENT, Arc::clone(&confs));
    let rig = new_rig(opts);

    let user = TUser::new(1);
    user.connect(&rig);
    *parse_acct.lock().unwrap() = user.acct;

    let pending = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 0, vec![0x01]);
    // Confirm the coin while the submission is waiting.
    let confirm = async {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        confs.store(5, Ordering::SeqCst);
    };
    let (result, ()) = tokio::join!(pending, confirm);
    assert_eq!(result.expect("bond rejected").strength, 1);
    assert_eq!(rig.mgr.user(user.acct).expect("session").tier(), 1);
}

#[tokio::test]
async fn bond_submission_rejections() {
    let confs = Arc::new(AtomicU32::new(5));
    let (opts, parse_acct) = parser_opts(BOND_INCREMENT / 2, confs);
    let rig = new_rig(opts);
    let user = TUser::new(1);

    // Unknown asset.
    let err = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), 999, 0, vec![0x01])
        .await
        .expect_err("unknown asset accepted");
    assert!(matches!(err, BondError::UnknownAsset(999)));

    // Wrong bond version for the asset.
    let err = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 9, vec![0x01])
        .await
        .expect_err("bad version accepted");
    assert!(matches!(err, BondError::UnsupportedVersion { .. }));

    // Commitment pays another account.
    *parse_acct.lock().unwrap() = AccountId([0x55; 32]);
    let err = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 0, vec![0x01])
        .await
        .expect_err("wrong account accepted");
    assert!(matches!(err, BondError::WrongAccount));

    // Amount under one strength increment.
    *parse_acct.lock().unwrap() = user.acct;
    let err = rig
        .mgr
        .submit_bond_tx(user.pubkey.clone(), BOND_ASSET_ID, 0, vec![0x01])
        .await
        .expect_err("dust bond accepted");
    assert!(matches!(err, BondError::WeakBond { .. }));
}

#[tokio::test]
async fn prepaid_bond_redeems_exactly_once() {
    let rig = new_rig(RigOptions::default());
    let user = TUser::new(1);
    user.connect(&rig);

    let tokens = rig
        .mgr
        .create_prepaid_bonds(2, 1, 48 * 3600)
        .expect("minting failed");
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
    let token = tokens[0].clone();

    let bond = rig
        .mgr
        .redeem_prepaid_bond(&user.pubkey, &token)
        .expect("redemption failed");
    assert_eq!(bond.asset_id, PREPAID_BOND_ASSET);
    assert_eq!(bond.coin_id, token);
    assert_eq!(bond.strength, 1);

    {
        let inner = rig.storage.lock();
        assert_eq!(inner.deleted_prepaid.as_slice(), &[token.clone()]);
        assert_eq!(inner.added_bonds.len(), 1);
    }
    assert_eq!(rig.mgr.user(user.acct).expect("session").tier(), 1);

    // The token is spent.
    let err = rig
        .mgr
        .redeem_prepaid_bond(&user.pubkey, &token)
        .expect_err("token redeemed twice");
    assert!(matches!(err, BondError::Prepaid(_)));
}

#[tokio::test]
async fn expiring_bonds_drop_tier_and_notify() {
    let rig = new_rig(RigOptions::default());
    let user = TUser::new(1);

    let now = now_secs();
    let near_coin = vec![0x01; 4];
    rig.storage.lock().bonds = vec![
        Bond {
            asset_id: BOND_ASSET_ID,
            coin_id: near_coin.clone(),
            strength: 1,
            lock_time: now + BOND_EXPIRY as i64 + 1_000,
        },
        Bond {
            asset_id: BOND_ASSET_ID,
            coin_id: vec![0x02; 4],
            strength: 1,
            lock_time: now + 10 * BOND_EXPIRY as i64,
        },
    ];

    let resp = user.connect(&rig);
    assert_eq!(connect_result(&resp).tier, 2);

    // Sweep at a point where only the near bond has entered the expiry
    // window. Nothing is deleted from storage; only tier changes.
    rig.mgr.expire_bonds_at(now + 2 * BOND_EXPIRY as i64);

    let session = rig.mgr.user(user.acct).expect("session");
    assert_eq!(session.tier(), 1);
    assert_eq!(session.bonds().len(), 1);

    let notes = user.link.drain();
    let expired: Vec<_> = notes
        .iter()
        .filter(|n| n.route == msg::BOND_EXPIRED_ROUTE)
        .collect();
    assert_eq!(expired.len(), 1);
    let note: msg::BondExpiredNote =
        serde_json::from_value(expired[0].payload.clone()).unwrap();
    assert_eq!(note.coin_id, near_coin);
    assert_eq!(note.tier, 1);

    // A second sweep at the same point is quiet.
    rig.mgr.expire_bonds_at(now + 2 * BOND_EXPIRY as i64);
    assert!(user
        .link
        .drain()
        .iter()
        .all(|n| n.route != msg::BOND_EXPIRED_ROUTE));
}
