//! C10 — the bootstrap session state machine (§4.10): onboards a brand new
//! account with no prior managed key by walking an operator through
//! `GenerateKey -> WaitConfirm -> VerifyHostKey -> TestConnection ->
//! SelectKeys -> ConfirmDeploy -> Deploying -> (Complete | Failed)`.
//!
//! Each call below is a separate request (CLI prompt, API call) against a
//! session that may outlive any one of them, so — unlike [`crate::deploy`]
//! and [`crate::audit`], which borrow their stores for the duration of one
//! call — [`BootstrapManager`] owns `Arc<dyn Trait>` handles the way
//! [`crate::scheduler::FleetDeps`] does.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::KeymasterConfig;
use crate::error::BootstrapError;
use crate::model::{
    audit_action, Account, AuditLogEntry, BootstrapSession, BootstrapStatus, PublicKey, UnixTimestamp,
};
use crate::render;
use crate::store::{AccountStore, AssignmentStore, AuditStore, KnownHostStore, PublicKeyStore, SessionStore, SystemKeyStore};
use crate::transport::{self, Credential};
use crate::trust::HostKeyMode;
use crate::{keymaterial, sftp, Clock};

/// In-memory FSM stage. Distinct from the coarser persisted
/// [`BootstrapStatus`]: a session stays `Active` across several of these
/// stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    WaitConfirm,
    VerifyHostKey,
    TestConnection,
    SelectKeys,
    ConfirmDeploy,
    Deploying,
}

/// Runtime-only state for one in-flight session. The temporary private key
/// lives here and nowhere else — the persisted [`BootstrapSession`] row
/// never carries it (§3).
struct ActiveBootstrap {
    stage: BootstrapStage,
    temp_private_key: Zeroizing<String>,
    observed_host_key: Option<String>,
    selected_key_ids: Vec<i64>,
}

/// The freshly created session plus what the operator needs to act on
/// `WaitConfirm`: the public half to append remotely, and the shell
/// one-liner that does it.
pub struct StartedBootstrap {
    pub session_id: String,
    pub public_line: String,
    pub confirm_command: String,
    pub expires_at: UnixTimestamp,
}

/// Orchestrates bootstrap sessions end to end, holding the process-wide
/// registry of in-flight attempts that a signal handler or the reaper can
/// reach without threading state through every call site — the one
/// legitimate process-scoped global the design notes (§9) call out,
/// constructed explicitly by the hosting binary rather than looked up as a
/// default singleton.
pub struct BootstrapManager {
    pub accounts: Arc<dyn AccountStore>,
    pub public_keys: Arc<dyn PublicKeyStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub system_keys: Arc<dyn SystemKeyStore>,
    pub known_hosts: Arc<dyn KnownHostStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<KeymasterConfig>,
    active: DashMap<String, ActiveBootstrap>,
}

impl BootstrapManager {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        public_keys: Arc<dyn PublicKeyStore>,
        assignments: Arc<dyn AssignmentStore>,
        system_keys: Arc<dyn SystemKeyStore>,
        known_hosts: Arc<dyn KnownHostStore>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        config: Arc<KeymasterConfig>,
    ) -> Self {
        BootstrapManager {
            accounts,
            public_keys,
            assignments,
            system_keys,
            known_hosts,
            sessions,
            audit,
            clock,
            config,
            active: DashMap::new(),
        }
    }

    /// `GenerateKey`: mint an ephemeral Ed25519 keypair, persist the session
    /// row (public half only), and register the runtime state so later
    /// steps — and an interrupting signal — can find it.
    pub async fn start(&self, username: &str, hostname: &str, label: &str) -> Result<StartedBootstrap, BootstrapError> {
        let comment = format!("keymaster-bootstrap-{username}@{hostname}");
        let keypair = keymaterial::generate_ed25519(&comment, None)?;

        let id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let ttl = self.config.bootstrap_session_ttl_secs.min(3600);
        let expires_at = now + ttl;

        self.sessions
            .save(BootstrapSession {
                id: id.clone(),
                username: username.to_string(),
                hostname: hostname.to_string(),
                label: label.to_string(),
                temp_public_key: keypair.public_line.clone(),
                created_at: now,
                expires_at,
                status: BootstrapStatus::Active,
            })
            .await?;

        self.active.insert(
            id.clone(),
            ActiveBootstrap {
                stage: BootstrapStage::WaitConfirm,
                temp_private_key: keypair.private_pem,
                observed_host_key: None,
                selected_key_ids: Vec::new(),
            },
        );

        info!(session = %id, username, hostname, "bootstrap session started");

        Ok(StartedBootstrap {
            confirm_command: confirm_command(username, &keypair.public_line),
            session_id: id,
            public_line: keypair.public_line,
            expires_at,
        })
    }

    /// `VerifyHostKey`: probe the remote host key and hand it back for the
    /// operator to eyeball (e.g. against an out-of-band fingerprint), before
    /// committing to [`Self::accept_host_key`].
    pub async fn verify_host_key(&self, id: &str) -> Result<String, BootstrapError> {
        let session = self.load_active_session(id).await?;
        self.require_stage(id, BootstrapStage::WaitConfirm)?;

        let observed = transport::probe_host_key(&session.hostname, self.known_hosts.clone(), self.config.host_key_probe_timeout())
            .await?;

        self.active.get_mut(id).ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?.observed_host_key = Some(observed.clone());
        self.set_stage(id, BootstrapStage::VerifyHostKey)?;

        Ok(observed)
    }

    /// Pin the host key the operator confirmed and advance to
    /// `TestConnection`.
    pub async fn accept_host_key(&self, id: &str) -> Result<(), BootstrapError> {
        let session = self.load_active_session(id).await?;
        self.require_stage(id, BootstrapStage::VerifyHostKey)?;

        let observed = self
            .active
            .get(id)
            .and_then(|e| e.observed_host_key.clone())
            .ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?;

        let canonical = crate::trust::canonicalize(&session.hostname).map_err(crate::error::TransportError::Trust)?;
        crate::trust::pin(self.known_hosts.as_ref(), &canonical, &observed).await.map_err(crate::error::TransportError::Trust)?;

        self.set_stage(id, BootstrapStage::TestConnection)?;
        Ok(())
    }

    /// The operator rejected the presented host key. Fails the session
    /// outright rather than permitting a silent retry against a possibly
    /// spoofed host.
    pub async fn reject_host_key(&self, id: &str) -> Result<(), BootstrapError> {
        self.require_stage(id, BootstrapStage::VerifyHostKey)?;
        self.fail(id, "host key rejected by operator").await;
        Err(BootstrapError::HostKeyRejected)
    }

    /// `TestConnection`: dial with the temporary key, pinned against the
    /// host key accepted in the previous step. On failure the session stays
    /// `Active` at this stage so the caller can retry or regenerate (a new
    /// [`Self::start`] call) without the session row ever surfacing failure.
    pub async fn test_connection(&self, id: &str) -> Result<(), BootstrapError> {
        let session = self.load_active_session(id).await?;
        self.require_stage(id, BootstrapStage::TestConnection)?;

        let pem = self
            .active
            .get(id)
            .map(|e| e.temp_private_key.to_string())
            .ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?;

        let mut conn = transport::dial(
            &session.hostname,
            &session.username,
            Credential::SystemKey { pem: &pem, passphrase: None },
            HostKeyMode::PinExpected,
            self.known_hosts.clone(),
            &self.config,
        )
        .await?;
        // A successful dial is the connectivity test itself; open (and
        // immediately drop) the sftp subsystem to confirm the account can
        // actually reach the deploy path Deploying will need.
        conn.open_sftp(self.config.sftp_timeout()).await?;

        self.set_stage(id, BootstrapStage::SelectKeys)?;
        Ok(())
    }

    /// `SelectKeys`: record which non-global public keys this account
    /// should carry, in addition to whatever is global.
    pub async fn select_keys(&self, id: &str, key_ids: Vec<i64>) -> Result<(), BootstrapError> {
        self.require_stage(id, BootstrapStage::SelectKeys)?;
        self.active
            .get_mut(id)
            .ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?
            .selected_key_ids = key_ids;
        self.set_stage(id, BootstrapStage::ConfirmDeploy)?;
        Ok(())
    }

    /// `ConfirmDeploy`: render the content that [`Self::deploy`] would push,
    /// for the operator to review before committing.
    pub async fn preview(&self, id: &str) -> Result<String, BootstrapError> {
        self.require_stage(id, BootstrapStage::ConfirmDeploy)?;
        let selected = self.active.get(id).map(|e| e.selected_key_ids.clone()).unwrap_or_default();
        let system_key = self.system_keys.get_active().await?.ok_or(BootstrapError::Render(crate::error::RenderError::NoActiveSystemKey))?;
        let globals = self.public_keys.list_global().await?;
        let per_account = self.resolve_keys(&selected).await?;
        Ok(render::render(Some(&system_key), &globals, &per_account, self.clock.now())?)
    }

    /// `Deploying`: create the account, assign the selected keys, render and
    /// push the final content, then record the result. Any failure after
    /// the account row is created triggers compensating cleanup — the
    /// account is deleted so a half-onboarded row never lingers — and the
    /// session is marked `failed` rather than deleted, so its audit trail
    /// survives.
    pub async fn deploy(&self, id: &str) -> Result<i64, BootstrapError> {
        let session = self.load_active_session(id).await?;
        self.require_stage(id, BootstrapStage::ConfirmDeploy)?;
        self.set_stage(id, BootstrapStage::Deploying)?;

        match self.deploy_inner(id, &session).await {
            Ok(account_id) => {
                self.sessions.update_status(id, BootstrapStatus::Completed).await?;
                self.active.remove(id);
                self.audit_log(&session.username, audit_action::BOOTSTRAP_HOST, &format!("session={id} account={account_id} host={}", session.hostname))
                    .await;
                info!(session = %id, account_id, "bootstrap deploy complete");
                Ok(account_id)
            }
            Err((e, created_account_id)) => {
                if let Some(account_id) = created_account_id {
                    if let Err(cleanup_err) = self.accounts.delete(account_id).await {
                        warn!(session = %id, account_id, error = %cleanup_err, "compensating account cleanup failed");
                    }
                }
                self.fail(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn deploy_inner(&self, id: &str, session: &BootstrapSession) -> Result<i64, (BootstrapError, Option<i64>)> {
        let selected = self.active.get(id).map(|e| e.selected_key_ids.clone()).unwrap_or_default();

        let account = self
            .accounts
            .add(Account {
                id: 0,
                username: session.username.clone(),
                hostname: session.hostname.clone(),
                label: session.label.clone(),
                tags: String::new(),
                serial: 0,
                is_active: true,
                is_dirty: true,
                key_hash: String::new(),
            })
            .await
            .map_err(|e| (BootstrapError::Store(e), None))?;

        let outcome: Result<(), BootstrapError> = async {
            for key_id in &selected {
                self.assignments.assign(crate::model::AccountKey { account_id: account.id, public_key_id: *key_id }).await?;
            }

            let system_key = self.system_keys.get_active().await?.ok_or(crate::error::RenderError::NoActiveSystemKey)?;
            let globals = self.public_keys.list_global().await?;
            let per_account = self.resolve_keys(&selected).await?;
            let content = render::render(Some(&system_key), &globals, &per_account, self.clock.now())?;

            let pem = self
                .active
                .get(id)
                .map(|e| e.temp_private_key.to_string())
                .ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?;

            let mut conn = transport::dial(
                &account.hostname,
                &account.username,
                Credential::SystemKey { pem: &pem, passphrase: None },
                HostKeyMode::Verify,
                self.known_hosts.clone(),
                &self.config,
            )
            .await?;
            let sftp_session = conn.open_sftp(self.config.sftp_timeout()).await?;
            sftp::deploy(&sftp_session, &content, self.config.sftp_timeout()).await?;

            self.accounts.update_serial(account.id, system_key.serial).await?;
            self.accounts.set_key_hash(account.id, &crate::hash::content_hash(&content)).await?;
            self.accounts.set_dirty(account.id, false).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => Ok(account.id),
            Err(e) => Err((e, Some(account.id))),
        }
    }

    async fn resolve_keys(&self, selected: &[i64]) -> Result<Vec<PublicKey>, BootstrapError> {
        let all = self.public_keys.list().await?;
        Ok(all.into_iter().filter(|k| selected.contains(&k.id)).collect())
    }

    async fn load_active_session(&self, id: &str) -> Result<BootstrapSession, BootstrapError> {
        let session = self.sessions.get(id).await?.ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?;
        if session.status != BootstrapStatus::Active {
            return Err(BootstrapError::InvalidTransition { session: id.to_string(), state: session.status.as_str().to_string() });
        }
        if self.clock.now() >= session.expires_at {
            self.sessions.update_status(id, BootstrapStatus::Expired).await?;
            self.active.remove(id);
            return Err(BootstrapError::Expired(id.to_string()));
        }
        Ok(session)
    }

    fn require_stage(&self, id: &str, expected: BootstrapStage) -> Result<(), BootstrapError> {
        let actual = self.active.get(id).map(|e| e.stage).ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?;
        if actual == expected {
            Ok(())
        } else {
            Err(BootstrapError::InvalidTransition { session: id.to_string(), state: format!("{actual:?}") })
        }
    }

    fn set_stage(&self, id: &str, stage: BootstrapStage) -> Result<(), BootstrapError> {
        self.active.get_mut(id).ok_or_else(|| BootstrapError::SessionNotFound(id.to_string()))?.stage = stage;
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) {
        let username = self.sessions.get(id).await.ok().flatten().map(|s| s.username).unwrap_or_default();
        self.active.remove(id);
        if let Err(e) = self.sessions.update_status(id, BootstrapStatus::Failed).await {
            warn!(session = %id, error = %e, "failed to mark bootstrap session failed");
        }
        self.audit_log(&username, audit_action::BOOTSTRAP_FAILED, &format!("session={id} reason={reason}")).await;
        warn!(session = %id, reason, "bootstrap session failed");
    }

    async fn audit_log(&self, username: &str, action: &str, details: &str) {
        let _ = self
            .audit
            .append(AuditLogEntry { timestamp: self.clock.now(), username: username.to_string(), action: action.to_string(), details: details.to_string() })
            .await;
    }

    /// Signal-handler / shutdown entry point: flip every session this
    /// process still has registered to `interrupted`, regardless of its
    /// in-memory stage, and forget it. A later [`Self::recover_orphaned`]
    /// call (after a restart) sweeps whatever a crash left behind instead.
    pub async fn interrupt_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.active.remove(&id);
            if let Err(e) = self.sessions.update_status(&id, BootstrapStatus::Interrupted).await {
                warn!(session = %id, error = %e, "failed to mark interrupted bootstrap session");
                continue;
            }
            self.audit_log("", audit_action::BOOTSTRAP_FAILED, &format!("session={id} reason=interrupted_by_signal")).await;
        }
    }

    /// Reaper tick: mark `Active` sessions past `expires_at` as `Expired`.
    /// Intended to run on [`KeymasterConfig::reaper_interval`].
    pub async fn sweep_expired(&self) -> Result<usize, BootstrapError> {
        let now = self.clock.now();
        let expired = self.sessions.list_expired(now).await?;
        for session in &expired {
            self.active.remove(&session.id);
            self.sessions.update_status(&session.id, BootstrapStatus::Expired).await?;
        }
        Ok(expired.len())
    }

    /// Startup recovery: any session still `Active` in the store but not
    /// registered in this (freshly started) process's in-memory map was
    /// abandoned by a prior process that crashed mid-flight. Mark it
    /// `orphaned` so an operator can decide whether to clean it up.
    pub async fn recover_orphaned(&self) -> Result<usize, BootstrapError> {
        let mut recovered = 0;
        for session in self.sessions.list_active().await? {
            if !self.active.contains_key(&session.id) {
                self.sessions.update_status(&session.id, BootstrapStatus::Orphaned).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

fn confirm_command(username: &str, public_line: &str) -> String {
    format!("echo '{public_line}' >> /home/{username}/.ssh/authorized_keys_keymaster_bootstrap")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::store::MemoryStore;

    fn manager(clock: Arc<dyn Clock>) -> BootstrapManager {
        let store = Arc::new(MemoryStore::new());
        BootstrapManager::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            clock,
            Arc::new(KeymasterConfig::default()),
        )
    }

    #[tokio::test]
    async fn start_persists_session_and_registers_runtime_state() {
        let clock = Arc::new(FixedClock::new(1_000));
        let mgr = manager(clock.clone());

        let started = mgr.start("deploy", "db1.example.com", "db1").await.unwrap();
        assert!(started.public_line.starts_with("ssh-ed25519"));
        assert!(started.confirm_command.contains(started.public_line.as_str()));
        assert_eq!(started.expires_at, 1_000 + mgr.config.bootstrap_session_ttl_secs.min(3600));

        let persisted = mgr.sessions.get(&started.session_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, BootstrapStatus::Active);
        assert_eq!(persisted.temp_public_key, started.public_line);

        assert!(mgr.require_stage(&started.session_id, BootstrapStage::WaitConfirm).is_ok());
    }

    #[tokio::test]
    async fn out_of_order_transition_is_rejected() {
        let clock = Arc::new(FixedClock::new(1_000));
        let mgr = manager(clock);
        let started = mgr.start("deploy", "db1.example.com", "db1").await.unwrap();

        // select_keys before verify_host_key/accept_host_key/test_connection.
        let err = mgr.select_keys(&started.session_id, vec![1]).await.unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn expired_session_is_marked_and_rejected() {
        let clock = Arc::new(FixedClock::new(0));
        let mgr = manager(clock.clone());
        let started = mgr.start("deploy", "db1.example.com", "db1").await.unwrap();

        clock.set(started.expires_at + 1);
        let err = mgr.load_active_session(&started.session_id).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Expired(_)));

        let persisted = mgr.sessions.get(&started.session_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, BootstrapStatus::Expired);
    }

    #[tokio::test]
    async fn interrupt_all_fails_active_sessions_and_logs() {
        let clock = Arc::new(FixedClock::new(1_000));
        let mgr = manager(clock);
        let started = mgr.start("deploy", "db1.example.com", "db1").await.unwrap();

        mgr.interrupt_all().await;

        let persisted = mgr.sessions.get(&started.session_id).await.unwrap().unwrap();
        assert_eq!(persisted.status, BootstrapStatus::Interrupted);
        assert!(mgr.active.is_empty());

        let entries = mgr.audit.list().await.unwrap();
        assert!(entries.iter().any(|e| e.action == audit_action::BOOTSTRAP_FAILED && e.details.contains("interrupted_by_signal")));
    }

    #[tokio::test]
    async fn sweep_expired_flips_status_and_forgets_runtime_state() {
        let clock = Arc::new(FixedClock::new(0));
        let mgr = manager(clock.clone());
        let started = mgr.start("deploy", "db1.example.com", "db1").await.unwrap();

        clock.set(started.expires_at + 1);
        let n = mgr.sweep_expired().await.unwrap();
        assert_eq!(n, 1);
        assert!(mgr.active.is_empty());
        assert_eq!(mgr.sessions.get(&started.session_id).await.unwrap().unwrap().status, BootstrapStatus::Expired);
    }
}
