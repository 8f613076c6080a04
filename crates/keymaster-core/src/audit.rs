//! C8 — the audit orchestrator. Two drift modes (§4.8): `Serial` reads only
//! the remote managed header and compares against `account.serial` (cheap,
//! used during staged rotations); `Strict` normalize-hashes the full remote
//! content against a freshly rendered expectation (C2/C3).

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::KeymasterConfig;
use crate::error::AuditError;
use crate::hash;
use crate::model::{audit_action, Account, AuditLogEntry, SystemKey, UnixTimestamp};
use crate::render;
use crate::store::{AccountStore, AssignmentStore, AuditStore, KnownHostStore, PublicKeyStore, SystemKeyStore};
use crate::transport::{self, Credential};
use crate::trust::HostKeyMode;
use crate::{sftp, Clock};

/// Which drift check to run (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMode {
    /// Parse `Serial: <N>` out of the managed header only.
    Serial,
    /// Fetch + normalize-hash the full file against a freshly rendered
    /// expectation.
    Strict,
}

/// Result of one account's audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Ok,
    /// `Serial` mode mismatch: the header's serial didn't match
    /// `account.serial` (or the header was missing/unparsable).
    SerialDrift { expected: i64, remote: Option<i64> },
    /// `Strict` mode mismatch: normalized hashes differ.
    HashDrift,
}

impl AuditOutcome {
    pub fn is_drift(&self) -> bool {
        !matches!(self, AuditOutcome::Ok)
    }
}

/// Dependencies for auditing a single account, mirroring [`crate::deploy::Deployer`].
pub struct Auditor<'a> {
    pub accounts: &'a dyn AccountStore,
    pub public_keys: &'a dyn PublicKeyStore,
    pub assignments: &'a dyn AssignmentStore,
    pub system_keys: &'a dyn SystemKeyStore,
    pub known_hosts: Arc<dyn KnownHostStore>,
    pub audit: &'a dyn AuditStore,
    pub clock: &'a dyn Clock,
    pub config: &'a KeymasterConfig,
}

pub async fn audit(auditor: &Auditor<'_>, account_id: i64, mode: AuditMode) -> Result<AuditOutcome, AuditError> {
    let account = auditor.accounts.get(account_id).await?;
    let system_key = resolve_system_key(auditor, &account).await?;

    let remote_bytes = fetch_remote(auditor, &account, &system_key).await?;
    let remote_content = String::from_utf8_lossy(&remote_bytes).into_owned();

    let outcome = match mode {
        AuditMode::Serial => audit_serial(&remote_content, &account),
        AuditMode::Strict => audit_strict(auditor, &account, &system_key, &remote_content, auditor.clock.now()).await?,
    };

    if outcome.is_drift() {
        audit_log(auditor, &account, audit_action::CLI_AUDIT_FAIL, &format!("{outcome:?}")).await;
        warn!(account = %account.label, outcome = ?outcome, "audit detected drift");

        if matches!(outcome, AuditOutcome::HashDrift) {
            if let Err(e) = auditor.accounts.set_dirty(account.id, true).await {
                audit_log(auditor, &account, audit_action::AUDIT_HASH_MARK_DIRTY_FAILED, &e.to_string()).await;
                warn!(account = %account.label, error = %e, "failed to mark account dirty after drift");
            }
        }
    } else {
        audit_log(auditor, &account, audit_action::CLI_AUDIT_SUCCESS, "ok").await;
        info!(account = %account.label, "audit OK");
    }

    Ok(outcome)
}

async fn resolve_system_key(auditor: &Auditor<'_>, account: &Account) -> Result<SystemKey, AuditError> {
    if account.serial == 0 {
        auditor.system_keys.get_active().await?.ok_or(AuditError::NoSuchSystemKey(0))
    } else {
        auditor.system_keys.get_by_serial(account.serial).await?.ok_or(AuditError::NoSuchSystemKey(account.serial))
    }
}

async fn fetch_remote(auditor: &Auditor<'_>, account: &Account, system_key: &SystemKey) -> Result<Vec<u8>, AuditError> {
    let credential = Credential::SystemKey { pem: &system_key.private_key, passphrase: None };
    let mut session = transport::dial(
        &account.hostname,
        &account.username,
        credential,
        HostKeyMode::Verify,
        auditor.known_hosts.clone(),
        auditor.config,
    )
    .await
    .map_err(AuditError::Transport)?;
    let sftp_session = session.open_sftp(auditor.config.sftp_timeout()).await.map_err(AuditError::Transport)?;
    Ok(sftp::fetch(&sftp_session, auditor.config.sftp_timeout()).await?)
}

/// Compare a remote file's managed-header serial against `account.serial`
/// (§4.8 `Serial` mode), exposed standalone so callers that already have the
/// remote bytes in hand (e.g. a CLI `audit --dry-run`) don't need a full
/// [`Auditor`] to check just the header.
pub fn audit_serial(remote_content: &str, account: &Account) -> AuditOutcome {
    match render::parse_header_serial(remote_content) {
        Some(remote) if remote == account.serial => AuditOutcome::Ok,
        remote => AuditOutcome::SerialDrift { expected: account.serial, remote },
    }
}

async fn audit_strict(auditor: &Auditor<'_>, account: &Account, system_key: &SystemKey, remote_content: &str, now: UnixTimestamp) -> Result<AuditOutcome, AuditError> {
    let globals = auditor.public_keys.list_global().await?;
    let assigned_ids = auditor.assignments.list_for_account(account.id).await?;
    let all_keys = auditor.public_keys.list().await?;
    let per_account: Vec<_> = all_keys.into_iter().filter(|k| assigned_ids.contains(&k.id)).collect();

    let expected = render::render(Some(system_key), &globals, &per_account, now)?;
    let expected_hash = hash::content_hash(&expected);
    let remote_hash = hash::content_hash(remote_content);

    Ok(if expected_hash == remote_hash { AuditOutcome::Ok } else { AuditOutcome::HashDrift })
}

async fn audit_log(auditor: &Auditor<'_>, account: &Account, action: &str, details: &str) {
    let _ = auditor
        .audit
        .append(AuditLogEntry { timestamp: auditor.clock.now(), username: account.username.clone(), action: action.to_string(), details: details.to_string() })
        .await;
}
