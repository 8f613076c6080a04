//! C11 — import and decommission (§4.11). Import reads a remote
//! `authorized_keys` file and folds any key Keymaster doesn't already know
//! about (by comment) into the store; decommission does the reverse,
//! stripping everything Keymaster put there while leaving surrounding
//! content untouched.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::KeymasterConfig;
use crate::error::ImportError;
use crate::keymaterial::{self, KeyAdvisory, ParsedKey};
use crate::model::{audit_action, Account, AccountKey, AuditLogEntry, PublicKey, SystemKey};
use crate::render;
use crate::store::{AccountStore, AssignmentStore, AuditStore, KnownHostStore, PublicKeyStore, SystemKeyStore};
use crate::transport::{self, Credential};
use crate::trust::HostKeyMode;
use crate::{sftp, Clock};

const HEADER_LINE_PREFIX: &str = "# Keymaster Managed Keys";

/// Dependencies for importing from / decommissioning an account, mirroring
/// [`crate::deploy::Deployer`] and [`crate::audit::Auditor`].
pub struct Importer<'a> {
    pub accounts: &'a dyn AccountStore,
    pub public_keys: &'a dyn PublicKeyStore,
    pub assignments: &'a dyn AssignmentStore,
    pub system_keys: &'a dyn SystemKeyStore,
    pub known_hosts: Arc<dyn KnownHostStore>,
    pub audit: &'a dyn AuditStore,
    pub clock: &'a dyn Clock,
    pub config: &'a KeymasterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Parse each line of the account's remote `authorized_keys`, rejecting
/// anything without a comment and skipping comments already known (by
/// exact, case-sensitive match) to [`crate::store::PublicKeyStore`]. Every
/// newly learned key is assigned to this account, since that's the account
/// it was found carrying.
pub async fn import(importer: &Importer<'_>, account_id: i64) -> Result<ImportReport, ImportError> {
    let account = importer.accounts.get(account_id).await?;
    let system_key = resolve_system_key(importer, &account).await?;

    let remote_bytes = fetch_remote(importer, &account, &system_key).await?;
    let remote_content = String::from_utf8_lossy(&remote_bytes).into_owned();

    let mut report = ImportReport::default();

    for raw_line in remote_content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(HEADER_LINE_PREFIX) || line == system_key.public_key.trim() {
            continue;
        }

        let parsed = match keymaterial::parse_authorized_key_line(line) {
            Ok(p) => p,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };

        if parsed.comment.is_empty() {
            report.skipped += 1;
            continue;
        }

        if importer.public_keys.get_by_comment(&parsed.comment).await?.is_some() {
            report.skipped += 1;
            continue;
        }

        if let KeyAdvisory::WeakAlgorithm { algorithm, detail } = &parsed.advisory {
            warn!(account = %account.label, comment = %parsed.comment, algorithm = %algorithm, detail = %detail, "importing weak key");
            audit_log(importer, &account, audit_action::WEAK_KEY_IMPORTED, &format!("comment={} algorithm={} detail={}", parsed.comment, algorithm, detail)).await;
        }

        let added = importer.public_keys.add(new_public_key(&parsed)).await?;
        importer.assignments.assign(AccountKey { account_id: account.id, public_key_id: added.id }).await?;
        audit_log(importer, &account, audit_action::ADD_PUBLIC_KEY, &format!("imported comment={}", added.comment)).await;
        audit_log(importer, &account, audit_action::ASSIGN_KEY, &format!("key_id={} account_id={}", added.id, account.id)).await;
        report.imported += 1;
    }

    info!(account = %account.label, imported = report.imported, skipped = report.skipped, "import complete");
    Ok(report)
}

fn new_public_key(parsed: &ParsedKey) -> PublicKey {
    PublicKey { id: 0, algorithm: parsed.algorithm.clone(), key_data: parsed.key_data.clone(), comment: parsed.comment.clone(), is_global: false, expires_at: None }
}

/// Options controlling what decommission leaves behind.
#[derive(Debug, Clone, Default)]
pub struct DecommissionOptions {
    /// When `false`, the header and restricted system-key line are
    /// re-emitted after stripping everything else, so the account keeps
    /// emergency system-key access without being otherwise managed.
    pub remove_system_key: bool,
    /// Key ids that should stay deployed despite being Keymaster-managed.
    pub retain_key_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecommissionReport {
    pub removed: usize,
    pub retained: usize,
}

/// Strip the Keymaster-managed block (header line, restricted system-key
/// line, and every subsequent line recognized as a managed public key) from
/// the account's remote `authorized_keys`, leaving everything else —
/// anything the managed renderer never produced — untouched. The first line
/// that doesn't parse as a recognized managed key ends the block; whatever
/// follows is preserved verbatim as the file's trailer.
pub async fn decommission(importer: &Importer<'_>, account_id: i64, opts: DecommissionOptions) -> Result<DecommissionReport, ImportError> {
    let account = importer.accounts.get(account_id).await?;
    let system_key = resolve_system_key(importer, &account).await?;

    let remote_bytes = fetch_remote(importer, &account, &system_key).await?;
    let remote_content = String::from_utf8_lossy(&remote_bytes).into_owned();

    if render::parse_header_serial(&remote_content).is_none() {
        // Nothing Keymaster-managed is present; decommission is a no-op.
        return Ok(DecommissionReport::default());
    }

    let lines: Vec<&str> = remote_content.lines().collect();
    let mut idx = 2.min(lines.len()); // header + restricted system-key line
    let mut kept: Vec<&str> = Vec::new();
    let mut removed = 0usize;

    while idx < lines.len() {
        let line = lines[idx];
        let Ok(parsed) = keymaterial::parse_authorized_key_line(line) else { break };
        if parsed.comment.is_empty() {
            break;
        }
        let Some(known) = importer.public_keys.get_by_comment(&parsed.comment).await? else { break };

        if opts.retain_key_ids.contains(&known.id) {
            kept.push(line);
        } else {
            removed += 1;
        }
        idx += 1;
    }

    let trailer = &lines[idx..];

    let mut out = String::new();
    if !opts.remove_system_key {
        out.push_str(&render::render(Some(&system_key), &[], &[], importer.clock.now())?);
        out.push('\n');
    }
    for line in &kept {
        out.push_str(line);
        out.push('\n');
    }
    for line in trailer {
        out.push_str(line);
        out.push('\n');
    }

    let mut session = transport::dial(
        &account.hostname,
        &account.username,
        Credential::SystemKey { pem: &system_key.private_key, passphrase: None },
        HostKeyMode::Verify,
        importer.known_hosts.clone(),
        importer.config,
    )
    .await
    .map_err(ImportError::Transport)?;
    let sftp_session = session.open_sftp(importer.config.sftp_timeout()).await.map_err(ImportError::Transport)?;
    sftp::deploy(&sftp_session, &out, importer.config.sftp_timeout()).await?;

    let report = DecommissionReport { removed, retained: kept.len() };
    audit_log(
        importer,
        &account,
        audit_action::DEPLOY_SUCCESS,
        &format!("decommission removed={} retained={} remove_system_key={}", report.removed, report.retained, opts.remove_system_key),
    )
    .await;
    info!(account = %account.label, removed = report.removed, retained = report.retained, "decommission complete");

    Ok(report)
}

async fn resolve_system_key(importer: &Importer<'_>, account: &Account) -> Result<SystemKey, ImportError> {
    if account.serial == 0 {
        importer.system_keys.get_active().await?.ok_or(ImportError::NoSuchSystemKey(0))
    } else {
        importer.system_keys.get_by_serial(account.serial).await?.ok_or(ImportError::NoSuchSystemKey(account.serial))
    }
}

async fn fetch_remote(importer: &Importer<'_>, account: &Account, system_key: &SystemKey) -> Result<Vec<u8>, ImportError> {
    let credential = Credential::SystemKey { pem: &system_key.private_key, passphrase: None };
    let mut session = transport::dial(&account.hostname, &account.username, credential, HostKeyMode::Verify, importer.known_hosts.clone(), importer.config)
        .await
        .map_err(ImportError::Transport)?;
    let sftp_session = session.open_sftp(importer.config.sftp_timeout()).await.map_err(ImportError::Transport)?;
    Ok(sftp::fetch(&sftp_session, importer.config.sftp_timeout()).await?)
}

async fn audit_log(importer: &Importer<'_>, account: &Account, action: &str, details: &str) {
    let _ = importer
        .audit
        .append(AuditLogEntry { timestamp: importer.clock.now(), username: account.username.clone(), action: action.to_string(), details: details.to_string() })
        .await;
}
