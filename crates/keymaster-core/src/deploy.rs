//! C7 — the single-account deployment orchestrator. Assembles content,
//! connects, uploads, and records the new serial with bounded retry
//! against store contention.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::KeymasterConfig;
use crate::error::DeployError;
use crate::hash;
use crate::model::{audit_action, Account, AuditLogEntry, UnixTimestamp};
use crate::render;
use crate::retry::with_backoff;
use crate::store::{AccountStore, AssignmentStore, AuditStore, KnownHostStore, PublicKeyStore, SystemKeyStore};
use crate::transport::{self, Credential};
use crate::trust::HostKeyMode;
use crate::{sftp, Clock};

/// Dependencies for deploying a single account. Orchestrators take these as
/// explicit constructor/call parameters rather than reaching for a global
/// singleton, so tests can substitute a [`crate::store::MemoryStore`] and a
/// fixed clock.
pub struct Deployer<'a> {
    pub accounts: &'a dyn AccountStore,
    pub public_keys: &'a dyn PublicKeyStore,
    pub assignments: &'a dyn AssignmentStore,
    pub system_keys: &'a dyn SystemKeyStore,
    pub known_hosts: Arc<dyn KnownHostStore>,
    pub audit: &'a dyn AuditStore,
    pub clock: &'a dyn Clock,
    pub config: &'a KeymasterConfig,
}

/// Passphrase for the system key, supplied by the caller when running
/// interactively (§4.7 step 3). In non-interactive mode this must be
/// `None`; a passphrase-required system key then fails fast rather than
/// blocking for input.
pub struct DeployOptions<'a> {
    pub interactive: bool,
    pub passphrase: Option<&'a str>,
}

/// Deploy the rendered authorized_keys content for `account_id`.
pub async fn deploy(deployer: &Deployer<'_>, account_id: i64, opts: DeployOptions<'_>) -> Result<(), DeployError> {
    let account = deployer.accounts.get(account_id).await?;
    let now = deployer.clock.now();

    let system_key = resolve_system_key(deployer, &account).await?;
    let content = render_account_content(deployer, &account, &system_key, now).await?;

    let result = connect_and_upload(deployer, &account, &system_key, &content, &opts).await;

    match result {
        Ok(()) => {
            let expected_hash = hash::content_hash(&content);
            record_success(deployer, &account, system_key.serial, &expected_hash).await?;
            audit_log(deployer, &account, audit_action::DEPLOY_SUCCESS, &format!("serial={}", system_key.serial)).await;
            info!(account = %account.label, serial = system_key.serial, "deploy succeeded");
            Ok(())
        }
        Err(err) => {
            audit_log(deployer, &account, audit_action::DEPLOY_FAIL, &err.to_string()).await;
            warn!(account = %account.label, error = %err, "deploy failed");
            Err(err)
        }
    }
}

async fn resolve_system_key(deployer: &Deployer<'_>, account: &Account) -> Result<crate::model::SystemKey, DeployError> {
    if account.serial == 0 {
        deployer.system_keys.get_active().await?.ok_or(DeployError::NoSuchSystemKey(0))
    } else {
        deployer.system_keys.get_by_serial(account.serial).await?.ok_or(DeployError::NoSuchSystemKey(account.serial))
    }
}

async fn render_account_content(
    deployer: &Deployer<'_>,
    account: &Account,
    system_key: &crate::model::SystemKey,
    now: UnixTimestamp,
) -> Result<String, DeployError> {
    let globals = deployer.public_keys.list_global().await?;
    let assigned_ids = deployer.assignments.list_for_account(account.id).await?;
    let all_keys = deployer.public_keys.list().await?;
    let per_account: Vec<_> = all_keys.into_iter().filter(|k| assigned_ids.contains(&k.id)).collect();

    Ok(render::render(Some(system_key), &globals, &per_account, now)?)
}

async fn connect_and_upload(
    deployer: &Deployer<'_>,
    account: &Account,
    system_key: &crate::model::SystemKey,
    content: &str,
    opts: &DeployOptions<'_>,
) -> Result<(), DeployError> {
    let credential = Credential::SystemKey { pem: &system_key.private_key, passphrase: opts.passphrase };

    let mut session = transport::dial(
        &account.hostname,
        &account.username,
        credential,
        HostKeyMode::Verify,
        deployer.known_hosts.clone(),
        deployer.config,
    )
    .await
    .map_err(|e| {
        if !opts.interactive && matches!(e, crate::error::TransportError::PassphraseRequired) {
            DeployError::PassphraseRequiredNonInteractive
        } else {
            DeployError::Transport(e)
        }
    })?;

    let sftp_session = session.open_sftp(deployer.config.sftp_timeout()).await.map_err(DeployError::Transport)?;
    sftp::deploy(&sftp_session, content, deployer.config.sftp_timeout()).await?;
    Ok(())
}

async fn record_success(deployer: &Deployer<'_>, account: &Account, serial: i64, key_hash: &str) -> Result<(), DeployError> {
    with_backoff(deployer.config.deploy_retry_count, deployer.config.deploy_retry_base(), || async {
        deployer.accounts.update_serial(account.id, serial).await?;
        deployer.accounts.set_key_hash(account.id, key_hash).await?;
        deployer.accounts.set_dirty(account.id, false).await
    })
    .await
    .map_err(DeployError::Store)
}

async fn audit_log(deployer: &Deployer<'_>, account: &Account, action: &str, details: &str) {
    let _ = deployer
        .audit
        .append(AuditLogEntry { timestamp: deployer.clock.now(), username: account.username.clone(), action: action.to_string(), details: details.to_string() })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::SystemKey;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn resolve_system_key_uses_active_for_fresh_account() {
        let store = MemoryStore::new();
        store
            .rotate(SystemKey { id: 0, serial: 1, public_key: "ssh-ed25519 AAAA sys".into(), private_key: "pem".into(), is_active: true })
            .await
            .unwrap();

        let clock = FixedClock::new(1_000);
        let config = KeymasterConfig::default();
        let deployer = Deployer {
            accounts: &store,
            public_keys: &store,
            assignments: &store,
            system_keys: &store,
            known_hosts: Arc::new(MemoryStore::new()),
            audit: &store,
            clock: &clock,
            config: &config,
        };

        let account = Account {
            id: 0,
            username: "deploy".into(),
            hostname: "db1.example.com".into(),
            label: "db1".into(),
            tags: String::new(),
            serial: 0,
            is_active: true,
            is_dirty: true,
            key_hash: String::new(),
        };
        let account = store.add(account).await.unwrap();

        let resolved = resolve_system_key(&deployer, &account).await.unwrap();
        assert_eq!(resolved.serial, 1);
    }
}
