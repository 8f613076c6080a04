//! Integration coverage tying the fleet scheduler (C9) to the store-level
//! post-deploy invariants from §3/§8: after a simulated successful deploy,
//! `account.serial == active_system_key.serial`, `account.key_hash ==
//! hash(render(snapshot))`, and `account.is_dirty == false`. The task
//! closure below stands in for [`keymaster_core::deploy::deploy`] (which
//! needs a live SSH/SFTP session) but performs the same store writes in the
//! same order, so the scheduler-level guarantees — no ordering between
//! accounts, sibling failures don't abort the run — are exercised together
//! with the invariants they must preserve.

use std::sync::Arc;

use keymaster_core::hash;
use keymaster_core::mailbox::PasswordMailbox;
use keymaster_core::model::{Account, PublicKey, SystemKey};
use keymaster_core::render;
use keymaster_core::scheduler::{run_fleet, Cancellation, NeverPrompt, TaskOutcome};
use keymaster_core::store::{AccountStore, MemoryStore, PublicKeyStore, SystemKeyStore};
use keymaster_core::KeymasterError;
use tokio::sync::mpsc;

async fn seed_two_accounts(store: &MemoryStore) -> (i64, i64, i64) {
    let sk = store
        .rotate(SystemKey { id: 0, serial: 1, public_key: "ssh-ed25519 AAAAsys sys@keymaster".into(), private_key: "pem".into(), is_active: true })
        .await
        .unwrap();
    let key = store.add(PublicKey { id: 0, algorithm: "ssh-ed25519".into(), key_data: "AAAAalice".into(), comment: "alice".into(), is_global: true, expires_at: None }).await.unwrap();
    let _ = key;

    let a = store
        .add(Account { id: 0, username: "deploy".into(), hostname: "a.example.com".into(), label: "a".into(), tags: String::new(), serial: 0, is_active: true, is_dirty: true, key_hash: String::new() })
        .await
        .unwrap();
    let b = store
        .add(Account { id: 0, username: "deploy".into(), hostname: "b.example.com".into(), label: "b".into(), tags: String::new(), serial: 0, is_active: true, is_dirty: true, key_hash: String::new() })
        .await
        .unwrap();

    (sk.serial, a.id, b.id)
}

#[tokio::test]
async fn successful_fleet_run_leaves_every_account_clean_with_matching_serial_and_hash() {
    let store = Arc::new(MemoryStore::new());
    let (active_serial, a, b) = seed_two_accounts(&store).await;

    let expected_content = {
        let sk = store.get_active().await.unwrap().unwrap();
        let globals = store.list_global().await.unwrap();
        render::render(Some(&sk), &globals, &[], 0).unwrap()
    };
    let expected_hash = hash::content_hash(&expected_content);

    let (tx, mut rx) = mpsc::channel(64);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let store_for_task = Arc::clone(&store);
    let report = run_fleet(vec![a, b], Arc::new(PasswordMailbox::new()), Arc::new(NeverPrompt), Cancellation::new(), 4, tx, move |account_id, _passphrase| {
        let store = Arc::clone(&store_for_task);
        async move {
            let sk = store.get_active().await.map_err(keymaster_core::error::DeployError::Store).map_err(KeymasterError::Deploy)?.unwrap();
            let globals = store.list_global().await.map_err(keymaster_core::error::DeployError::Store).map_err(KeymasterError::Deploy)?;
            let content = render::render(Some(&sk), &globals, &[], 0).unwrap();
            let content_hash = hash::content_hash(&content);

            store.update_serial(account_id, sk.serial).await.map_err(keymaster_core::error::DeployError::Store).map_err(KeymasterError::Deploy)?;
            store.set_key_hash(account_id, &content_hash).await.map_err(keymaster_core::error::DeployError::Store).map_err(KeymasterError::Deploy)?;
            store.set_dirty(account_id, false).await.map_err(keymaster_core::error::DeployError::Store).map_err(KeymasterError::Deploy)?;
            Ok(TaskOutcome::DeploySuccess)
        }
    })
    .await;
    drain.await.unwrap();

    assert_eq!(report.succeeded.len(), 2);
    assert!(report.failed.is_empty());

    for id in [a, b] {
        let account = store.get(id).await.unwrap();
        assert_eq!(account.serial, active_serial);
        assert_eq!(account.key_hash, expected_hash);
        assert!(!account.is_dirty);
    }
}

/// §4.9/§5: no ordering is guaranteed between concurrent accounts, and one
/// account's failure must not prevent its siblings from completing and
/// reaching the same post-deploy invariants.
#[tokio::test]
async fn one_account_failing_does_not_block_siblings_from_becoming_clean() {
    let store = Arc::new(MemoryStore::new());
    let (active_serial, a, failing) = seed_two_accounts(&store).await;

    let (tx, mut rx) = mpsc::channel(64);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let store_for_task = Arc::clone(&store);
    let report = run_fleet(vec![a, failing], Arc::new(PasswordMailbox::new()), Arc::new(NeverPrompt), Cancellation::new(), 4, tx, move |account_id, _passphrase| {
        let store = Arc::clone(&store_for_task);
        let should_fail = account_id == failing;
        async move {
            if should_fail {
                return Err(KeymasterError::Deploy(keymaster_core::error::DeployError::NoSuchSystemKey(99)));
            }
            let sk = store.get_active().await.unwrap().unwrap();
            store.update_serial(account_id, sk.serial).await.unwrap();
            store.set_dirty(account_id, false).await.unwrap();
            Ok(TaskOutcome::DeploySuccess)
        }
    })
    .await;
    drain.await.unwrap();

    assert_eq!(report.succeeded, vec![a]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].account_id, failing);

    assert_eq!(store.get(a).await.unwrap().serial, active_serial);
    assert!(store.get(failing).await.unwrap().is_dirty);
}
