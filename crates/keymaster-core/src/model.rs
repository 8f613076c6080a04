//! Core data model (§3). These types are the shape the abstract store
//! interface (§6, [`crate::store`]) reads and writes; schema and migrations
//! are the persistent store's own concern and live outside this crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unix timestamp in seconds. `0` is the sentinel meaning "no expiry" for
/// [`PublicKey::expires_at`], and also, confusingly but per §3, the sentinel
/// meaning "deactivated" — the renderer (§4.2 step 3) is what gives the two
/// readings their distinct meaning based on context.
pub type UnixTimestamp = i64;

/// A managed UNIX account on a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub hostname: String,
    pub label: String,
    /// Comma-joined tag set. Order is immaterial and duplicates are
    /// collapsed; use [`Account::tags`]/[`Account::set_tags`] rather than
    /// touching the string directly.
    pub tags: String,
    /// Last successfully deployed system-key serial. `0` if never deployed.
    pub serial: i64,
    pub is_active: bool,
    pub is_dirty: bool,
    /// Canonical fingerprint of the currently-rendered authorized_keys
    /// content, as of the last successful deploy.
    pub key_hash: String,
}

impl Account {
    /// Parse the comma-joined tag set into a deduplicated, order-irrelevant
    /// set.
    pub fn tags(&self) -> BTreeSet<String> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Replace the tag set, collapsing duplicates and normalizing order so
    /// that two accounts with the same tags compare equal in `tags`.
    pub fn set_tags(&mut self, tags: impl IntoIterator<Item = String>) {
        let set: BTreeSet<String> = tags.into_iter().filter(|s| !s.trim().is_empty()).collect();
        self.tags = set.into_iter().collect::<Vec<_>>().join(",");
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(tag)
    }
}

/// A public key known to Keymaster — global (deployed to every active
/// account) or assigned to specific accounts via [`AccountKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: i64,
    pub algorithm: String,
    /// Base64-encoded key-data component (no algorithm prefix, no comment).
    pub key_data: String,
    /// Unique across all public keys.
    pub comment: String,
    pub is_global: bool,
    /// `None` = never expires (the "zero" reading in §3/§8). `Some(0)` is
    /// the Unix-epoch sentinel meaning *deactivated*: a key nobody would
    /// legitimately set to expire at 1970-01-01, reserved so "no expiry"
    /// and "deactivated" don't collide on the same representation.
    /// `Some(t)` for `t > 0` is an ordinary expiry instant, live while
    /// `now < t`.
    pub expires_at: Option<UnixTimestamp>,
}

impl PublicKey {
    /// §3 invariant: `Some(0)` (the Unix-epoch sentinel) means deactivated.
    pub fn is_deactivated(&self) -> bool {
        matches!(self.expires_at, Some(0))
    }

    /// True when the key is not deactivated and either never expires or
    /// `now < expires_at`.
    pub fn is_live_at(&self, now: UnixTimestamp) -> bool {
        match self.expires_at {
            None => true,
            Some(0) => false,
            Some(t) => now < t,
        }
    }

    pub fn authorized_line(&self) -> String {
        if self.comment.is_empty() {
            format!("{} {}", self.algorithm, self.key_data)
        } else {
            format!("{} {} {}", self.algorithm, self.key_data, self.comment)
        }
    }
}

/// The fleet's privileged system key. Exactly one [`SystemKey`] has
/// `is_active == true` whenever any exist (§3 invariant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemKey {
    pub id: i64,
    pub serial: i64,
    /// `"<alg> <base64> <comment>"` authorized_keys form.
    pub public_key: String,
    /// OpenSSH PEM, optionally passphrase-encrypted.
    pub private_key: String,
    pub is_active: bool,
}

/// A pinned host key, keyed by canonicalized `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHost {
    pub canonical: String,
    /// Authorized-keys-form host key (`"<alg> <base64>"`).
    pub host_key: String,
}

/// Many-to-many assignment of a [`PublicKey`] to an [`Account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKey {
    pub account_id: i64,
    pub public_key_id: i64,
}

/// Append-only audit trail entry. `action` is one of the contract names in
/// §6 ("Audit actions").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: UnixTimestamp,
    pub username: String,
    pub action: String,
    pub details: String,
}

/// Audit action name contracts (§6). Consumers filter on these strings, so
/// they're exposed as `&'static str` constants rather than an enum the core
/// would need to keep serializing compatibly forever.
pub mod audit_action {
    pub const ADD_ACCOUNT: &str = "ADD_ACCOUNT";
    pub const DELETE_ACCOUNT: &str = "DELETE_ACCOUNT";
    pub const TOGGLE_ACCOUNT_STATUS: &str = "TOGGLE_ACCOUNT_STATUS";
    pub const ADD_PUBLIC_KEY: &str = "ADD_PUBLIC_KEY";
    pub const DELETE_PUBLIC_KEY: &str = "DELETE_PUBLIC_KEY";
    pub const TOGGLE_KEY_GLOBAL: &str = "TOGGLE_KEY_GLOBAL";
    pub const ASSIGN_KEY: &str = "ASSIGN_KEY";
    pub const UNASSIGN_KEY: &str = "UNASSIGN_KEY";
    pub const TRUST_HOST: &str = "TRUST_HOST";
    pub const CREATE_SYSTEM_KEY: &str = "CREATE_SYSTEM_KEY";
    pub const ROTATE_SYSTEM_KEY: &str = "ROTATE_SYSTEM_KEY";
    pub const DEPLOY_SUCCESS: &str = "DEPLOY_SUCCESS";
    pub const DEPLOY_FAIL: &str = "DEPLOY_FAIL";
    pub const CLI_AUDIT_SUCCESS: &str = "CLI_AUDIT_SUCCESS";
    pub const CLI_AUDIT_FAIL: &str = "CLI_AUDIT_FAIL";
    pub const AUDIT_HASH_MARK_DIRTY_FAILED: &str = "AUDIT_HASH_MARK_DIRTY_FAILED";
    pub const ACCOUNT_KEY_HASH_UPDATED: &str = "ACCOUNT_KEY_HASH_UPDATED";
    pub const BOOTSTRAP_HOST: &str = "BOOTSTRAP_HOST";
    pub const BOOTSTRAP_FAILED: &str = "BOOTSTRAP_FAILED";
    pub const WEAK_KEY_IMPORTED: &str = "WEAK_KEY_IMPORTED";
}

/// Lifecycle state of a [`BootstrapSession`] (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Active,
    Completed,
    Failed,
    Expired,
    Orphaned,
    Interrupted,
}

impl BootstrapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapStatus::Active => "active",
            BootstrapStatus::Completed => "completed",
            BootstrapStatus::Failed => "failed",
            BootstrapStatus::Expired => "expired",
            BootstrapStatus::Orphaned => "orphaned",
            BootstrapStatus::Interrupted => "interrupted",
        }
    }
}

/// Persisted row for a bootstrap session. The in-memory form additionally
/// holds the temporary private key ([`crate::bootstrap::ActiveBootstrap`]),
/// which is never written here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSession {
    pub id: String,
    pub username: String,
    pub hostname: String,
    pub label: String,
    pub temp_public_key: String,
    pub created_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
    pub status: BootstrapStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 1,
            username: "deploy".into(),
            hostname: "db1.example.com".into(),
            label: "db1".into(),
            tags: String::new(),
            serial: 0,
            is_active: true,
            is_dirty: false,
            key_hash: String::new(),
        }
    }

    #[test]
    fn tag_set_collapses_duplicates_and_order() {
        let mut a = account();
        a.set_tags(["db".into(), "prod".into(), "db".into()]);
        let mut b = account();
        b.set_tags(["prod".into(), "db".into()]);
        assert_eq!(a.tags(), b.tags());
        assert!(a.has_tag("db"));
        assert!(a.has_tag("prod"));
        assert!(!a.has_tag("staging"));
    }

    #[test]
    fn expiry_sentinels() {
        let mut k = PublicKey {
            id: 1,
            algorithm: "ssh-ed25519".into(),
            key_data: "AAAA".into(),
            comment: "alice".into(),
            is_global: false,
            expires_at: None,
        };
        assert!(k.is_live_at(1_000_000));
        assert!(!k.is_deactivated());

        k.expires_at = Some(0);
        assert!(k.is_deactivated());
        assert!(!k.is_live_at(1_000_000));

        k.expires_at = Some(500);
        assert!(k.is_live_at(499));
        assert!(!k.is_live_at(500));
        assert!(!k.is_live_at(501));
    }
}
