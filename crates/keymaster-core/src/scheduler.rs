//! C9 — the fleet scheduler. Fans a single-account operation (deploy or
//! audit) out across a target set, with no ordering guarantees between
//! accounts (§5). When any task reports *passphrase-required*, consumption
//! suspends, the operator is prompted exactly once, the answer is cached in
//! the [`crate::mailbox::PasswordMailbox`], and the full set re-runs —
//! previously-successful results are discarded and recomputed, which keeps
//! each task's retry logic stateless (§4.9).
//!
//! The progress contract resolved in SPEC_FULL §C.1: callers drain a
//! [`FleetEvent`] channel rather than only getting a terminal
//! [`FleetReport`], so a richer UI can show per-target lifecycle while a
//! simpler caller can just keep the `Finished`/`Done` events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::error::{ErrorCategory, KeymasterError};
use crate::mailbox::PasswordMailbox;

/// Cooperative cancellation signal (§5: "aborts pending tasks; in-flight
/// tasks ... observe it via the dial timeout"). Cheap to clone; every
/// clone observes the same flag.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collects the operator's answer to a single passphrase prompt. The
/// out-of-scope CLI/TUI layer implements this; the scheduler only knows it
/// can ask once per run.
#[async_trait]
pub trait PassphrasePrompt: Send + Sync {
    async fn prompt(&self) -> Option<String>;
}

/// A prompt that never has an answer, for non-interactive fleet runs where
/// nobody is present to type a passphrase.
pub struct NeverPrompt;

#[async_trait]
impl PassphrasePrompt for NeverPrompt {
    async fn prompt(&self) -> Option<String> {
        None
    }
}

/// What a single-account task produced on success. The scheduler is
/// operation-agnostic: it doesn't know or care whether `task` deploys or
/// audits, only whether it succeeded, and if not, whether the failure was a
/// passphrase prompt.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    DeploySuccess,
    AuditResult(crate::audit::AuditOutcome),
}

/// Lifecycle events emitted while a fleet run executes (SPEC_FULL §C.1).
#[derive(Debug, Clone)]
pub enum FleetEvent {
    Started { account_id: i64 },
    Finished { account_id: i64, ok: bool },
    PassphraseRequested,
    PassphraseAccepted,
    Done { report: FleetReport },
}

/// One account's terminal failure, with the §7 classification a fleet
/// summary groups on.
#[derive(Debug, Clone)]
pub struct FleetFailure {
    pub account_id: i64,
    pub category: ErrorCategory,
    pub detail: String,
}

/// End-of-run summary (§7: "end-of-run summary of failed accounts with
/// their classified cause").
#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub succeeded: Vec<i64>,
    pub failed: Vec<FleetFailure>,
    pub skipped: Vec<i64>,
}

/// Run `task` concurrently (bounded by `concurrency`) over every id in
/// `targets`, coordinating at most one passphrase re-prompt round (§4.9:
/// "stops to collect a passphrase once"). `events` is best-effort — a
/// dropped receiver does not abort the run.
pub async fn run_fleet<F, Fut>(
    targets: Vec<i64>,
    mailbox: Arc<PasswordMailbox>,
    prompt: Arc<dyn PassphrasePrompt>,
    cancel: Cancellation,
    concurrency: usize,
    events: mpsc::Sender<FleetEvent>,
    task: F,
) -> FleetReport
where
    F: Fn(i64, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome, KeymasterError>> + Send + 'static,
{
    let task = Arc::new(task);
    let mut outcomes: HashMap<i64, Result<TaskOutcome, KeymasterError>> = HashMap::new();
    // Exactly one re-prompt round per §4.9: the initial attempt, plus one
    // retry after the operator answers.
    let mut rounds_left = 2;

    loop {
        outcomes.clear();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut joins = JoinSet::new();

        for &account_id in &targets {
            if cancel.is_cancelled() {
                break;
            }
            let _ = events.send(FleetEvent::Started { account_id }).await;

            let semaphore = Arc::clone(&semaphore);
            let task = Arc::clone(&task);
            let passphrase = mailbox.get();

            joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = task(account_id, passphrase).await;
                (account_id, result)
            });
        }

        while let Some(joined) = joins.join_next().await {
            if let Ok((account_id, result)) = joined {
                let _ = events.send(FleetEvent::Finished { account_id, ok: result.is_ok() }).await;
                outcomes.insert(account_id, result);
            }
        }

        let passphrase_requested = outcomes.values().any(|r| matches!(r, Err(e) if e.is_passphrase_required()));

        if passphrase_requested && rounds_left > 1 && !cancel.is_cancelled() {
            rounds_left -= 1;
            let _ = events.send(FleetEvent::PassphraseRequested).await;
            match prompt.prompt().await {
                Some(passphrase) => {
                    mailbox.set(passphrase);
                    let _ = events.send(FleetEvent::PassphraseAccepted).await;
                    continue;
                }
                None => break,
            }
        }
        break;
    }

    mailbox.clear();
    let report = build_report(&targets, &outcomes);
    let _ = events.send(FleetEvent::Done { report: report.clone() }).await;
    report
}

fn build_report(targets: &[i64], outcomes: &HashMap<i64, Result<TaskOutcome, KeymasterError>>) -> FleetReport {
    let mut report = FleetReport::default();
    for &id in targets {
        match outcomes.get(&id) {
            Some(Ok(_)) => report.succeeded.push(id),
            Some(Err(e)) => report.failed.push(FleetFailure { account_id: id, category: e.category(), detail: e.to_string() }),
            None => report.skipped.push(id),
        }
    }
    report
}

/// Store/clock/config handles a fleet run needs, bundled as `Arc`s so the
/// per-account closures handed to [`run_fleet`] are `'static` without any
/// package-global lookup (§9 design notes: orchestrator constructors take
/// these as explicit parameters).
pub struct FleetDeps {
    pub accounts: Arc<dyn crate::store::AccountStore>,
    pub public_keys: Arc<dyn crate::store::PublicKeyStore>,
    pub assignments: Arc<dyn crate::store::AssignmentStore>,
    pub system_keys: Arc<dyn crate::store::SystemKeyStore>,
    pub known_hosts: Arc<dyn crate::store::KnownHostStore>,
    pub audit: Arc<dyn crate::store::AuditStore>,
    pub clock: Arc<dyn crate::Clock>,
    pub config: Arc<crate::config::KeymasterConfig>,
}

/// Fan a deploy (C7) out across `targets` (§4.9 wraps C7).
pub async fn deploy_fleet(
    deps: Arc<FleetDeps>,
    targets: Vec<i64>,
    mailbox: Arc<PasswordMailbox>,
    prompt: Arc<dyn PassphrasePrompt>,
    cancel: Cancellation,
    events: mpsc::Sender<FleetEvent>,
) -> FleetReport {
    let concurrency = deps.config.fleet_concurrency;
    run_fleet(targets, mailbox, prompt, cancel, concurrency, events, move |account_id, passphrase| {
        let deps = Arc::clone(&deps);
        async move {
            let deployer = crate::deploy::Deployer {
                accounts: deps.accounts.as_ref(),
                public_keys: deps.public_keys.as_ref(),
                assignments: deps.assignments.as_ref(),
                system_keys: deps.system_keys.as_ref(),
                known_hosts: Arc::clone(&deps.known_hosts),
                audit: deps.audit.as_ref(),
                clock: deps.clock.as_ref(),
                config: deps.config.as_ref(),
            };
            let opts = crate::deploy::DeployOptions { interactive: true, passphrase: passphrase.as_deref() };
            crate::deploy::deploy(&deployer, account_id, opts)
                .await
                .map(|()| TaskOutcome::DeploySuccess)
                .map_err(KeymasterError::Deploy)
        }
    })
    .await
}

/// Fan an audit (C8) out across `targets` (§4.9 wraps C8).
pub async fn audit_fleet(
    deps: Arc<FleetDeps>,
    targets: Vec<i64>,
    mode: crate::audit::AuditMode,
    mailbox: Arc<PasswordMailbox>,
    prompt: Arc<dyn PassphrasePrompt>,
    cancel: Cancellation,
    events: mpsc::Sender<FleetEvent>,
) -> FleetReport {
    let concurrency = deps.config.fleet_concurrency;
    run_fleet(targets, mailbox, prompt, cancel, concurrency, events, move |account_id, _passphrase| {
        let deps = Arc::clone(&deps);
        async move {
            let auditor = crate::audit::Auditor {
                accounts: deps.accounts.as_ref(),
                public_keys: deps.public_keys.as_ref(),
                assignments: deps.assignments.as_ref(),
                system_keys: deps.system_keys.as_ref(),
                known_hosts: Arc::clone(&deps.known_hosts),
                audit: deps.audit.as_ref(),
                clock: deps.clock.as_ref(),
                config: deps.config.as_ref(),
            };
            crate::audit::audit(&auditor, account_id, mode)
                .await
                .map(TaskOutcome::AuditResult)
                .map_err(KeymasterError::Audit)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeployError, TransportError};
    use std::sync::atomic::AtomicU32;

    struct OnceAnswer(&'static str);

    #[async_trait]
    impl PassphrasePrompt for OnceAnswer {
        async fn prompt(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn all_succeed_without_passphrase_round() {
        let mailbox = Arc::new(PasswordMailbox::new());
        let (tx, _rx) = mpsc::channel(64);
        let report = run_fleet(vec![1, 2, 3], mailbox, Arc::new(NeverPrompt), Cancellation::new(), 4, tx, |id, _pass| async move {
            let _ = id;
            Ok(TaskOutcome::DeploySuccess)
        })
        .await;

        assert_eq!(report.succeeded.len(), 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn passphrase_required_is_recovered_exactly_once() {
        let mailbox = Arc::new(PasswordMailbox::new());
        let (tx, _rx) = mpsc::channel(64);
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_for_task = Arc::clone(&attempts);
        let report = run_fleet(vec![1, 2], mailbox, Arc::new(OnceAnswer("hunter2")), Cancellation::new(), 4, tx, move |_id, passphrase| {
            let attempts = Arc::clone(&attempts_for_task);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                match passphrase {
                    Some(p) if p == "hunter2" => Ok(TaskOutcome::DeploySuccess),
                    _ => Err(KeymasterError::Deploy(DeployError::Transport(TransportError::PassphraseRequired))),
                }
            }
        })
        .await;

        assert_eq!(report.succeeded.len(), 2);
        assert!(report.failed.is_empty());
        // Two accounts, two rounds (miss then hit): four task invocations.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn wrong_passphrase_surfaces_as_failure_after_single_retry() {
        let mailbox = Arc::new(PasswordMailbox::new());
        let (tx, _rx) = mpsc::channel(64);

        let report = run_fleet(vec![1], mailbox, Arc::new(OnceAnswer("wrong")), Cancellation::new(), 4, tx, |_id, _pass| async move {
            Err::<TaskOutcome, _>(KeymasterError::Deploy(DeployError::Transport(TransportError::PassphraseRequired)))
        })
        .await;

        assert_eq!(report.succeeded.len(), 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].category, ErrorCategory::Auth);
    }

    #[tokio::test]
    async fn sibling_failure_does_not_abort_other_tasks() {
        let mailbox = Arc::new(PasswordMailbox::new());
        let (tx, _rx) = mpsc::channel(64);

        let report = run_fleet(vec![1, 2, 3], mailbox, Arc::new(NeverPrompt), Cancellation::new(), 4, tx, |id, _pass| async move {
            if id == 2 {
                Err(KeymasterError::Deploy(DeployError::NoSuchSystemKey(0)))
            } else {
                Ok(TaskOutcome::DeploySuccess)
            }
        })
        .await;

        assert_eq!(report.succeeded, vec![1, 3]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].account_id, 2);
    }
}
