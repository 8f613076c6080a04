//! Abstract persistent-store interface (§6) and an in-memory reference
//! implementation for tests. Schema, migrations, and SQL dialect are out of
//! scope for this crate — the real store is an external collaborator that
//! only needs to satisfy these traits, the same way the rest of this
//! workspace keeps its storage engine behind a narrow trait rather than
//! hard-coding `sled`/SQL calls throughout.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Account, AccountKey, AuditLogEntry, BootstrapSession, BootstrapStatus, KnownHost, PublicKey, SystemKey, UnixTimestamp};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list(&self) -> StoreResult<Vec<Account>>;
    async fn list_active(&self) -> StoreResult<Vec<Account>>;
    async fn list_active_by_tag(&self, tag: &str) -> StoreResult<Vec<Account>>;
    async fn add(&self, account: Account) -> StoreResult<Account>;
    async fn delete(&self, id: i64) -> StoreResult<()>;
    async fn update_label(&self, id: i64, label: &str) -> StoreResult<()>;
    async fn update_tags(&self, id: i64, tags: &str) -> StoreResult<()>;
    async fn update_serial(&self, id: i64, serial: i64) -> StoreResult<()>;
    async fn toggle_status(&self, id: i64) -> StoreResult<bool>;
    async fn set_dirty(&self, id: i64, dirty: bool) -> StoreResult<()>;
    async fn set_key_hash(&self, id: i64, key_hash: &str) -> StoreResult<()>;
    async fn get(&self, id: i64) -> StoreResult<Account>;
}

#[async_trait]
pub trait PublicKeyStore: Send + Sync {
    async fn add(&self, key: PublicKey) -> StoreResult<PublicKey>;
    async fn list(&self) -> StoreResult<Vec<PublicKey>>;
    async fn list_global(&self) -> StoreResult<Vec<PublicKey>>;
    async fn get_by_comment(&self, comment: &str) -> StoreResult<Option<PublicKey>>;
    async fn toggle_global(&self, id: i64) -> StoreResult<bool>;
    async fn set_expiry(&self, id: i64, expires_at: Option<UnixTimestamp>) -> StoreResult<()>;
    async fn delete(&self, id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait SystemKeyStore: Send + Sync {
    async fn create(&self, key: SystemKey) -> StoreResult<SystemKey>;
    /// Insert `new` as the active key and deactivate whatever was active
    /// before, atomically from the caller's point of view (§4/§6 "rotate").
    async fn rotate(&self, new: SystemKey) -> StoreResult<SystemKey>;
    async fn get_active(&self) -> StoreResult<Option<SystemKey>>;
    async fn get_by_serial(&self, serial: i64) -> StoreResult<Option<SystemKey>>;
    async fn has_any(&self) -> StoreResult<bool>;
}

#[async_trait]
pub trait KnownHostStore: Send + Sync {
    async fn get(&self, canonical: &str) -> StoreResult<Option<KnownHost>>;
    async fn put(&self, host: KnownHost) -> StoreResult<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn assign(&self, link: AccountKey) -> StoreResult<()>;
    async fn unassign(&self, link: AccountKey) -> StoreResult<()>;
    async fn list_for_account(&self, account_id: i64) -> StoreResult<Vec<i64>>;
    async fn list_for_key(&self, public_key_id: i64) -> StoreResult<Vec<i64>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: BootstrapSession) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<Option<BootstrapSession>>;
    async fn update_status(&self, id: &str, status: BootstrapStatus) -> StoreResult<()>;
    async fn delete(&self, id: &str) -> StoreResult<()>;
    async fn list_expired(&self, now: UnixTimestamp) -> StoreResult<Vec<BootstrapSession>>;
    async fn list_orphaned(&self) -> StoreResult<Vec<BootstrapSession>>;
    async fn list_active(&self) -> StoreResult<Vec<BootstrapSession>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditLogEntry) -> StoreResult<()>;
    async fn list(&self) -> StoreResult<Vec<AuditLogEntry>>;
}

/// Bundles the seven store traits so orchestrators can take a single
/// `Arc<dyn Store>` instead of seven constructor parameters. A real
/// implementation (backing onto a SQL or embedded database) implements all
/// seven on one connection-pool-holding type; [`MemoryStore`] below is the
/// all-in-one test double.
pub trait Store: AccountStore + PublicKeyStore + SystemKeyStore + KnownHostStore + AssignmentStore + SessionStore + AuditStore {}
impl<T> Store for T where T: AccountStore + PublicKeyStore + SystemKeyStore + KnownHostStore + AssignmentStore + SessionStore + AuditStore {}

mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// `dashmap`-backed store used by integration tests and by examples; not
    /// wired into any production binary. Mirrors the concurrent
    /// shared-state style this workspace already uses for its in-process
    /// caches.
    #[derive(Default)]
    pub struct MemoryStore {
        accounts: DashMap<i64, Account>,
        next_account_id: AtomicI64,
        public_keys: DashMap<i64, PublicKey>,
        next_key_id: AtomicI64,
        system_keys: DashMap<i64, SystemKey>,
        next_system_key_id: AtomicI64,
        known_hosts: DashMap<String, KnownHost>,
        assignments: DashMap<(i64, i64), ()>,
        sessions: DashMap<String, BootstrapSession>,
        audit: DashMap<i64, AuditLogEntry>,
        next_audit_id: AtomicI64,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl AccountStore for MemoryStore {
        async fn list(&self) -> StoreResult<Vec<Account>> {
            Ok(self.accounts.iter().map(|e| e.value().clone()).collect())
        }

        async fn list_active(&self) -> StoreResult<Vec<Account>> {
            Ok(self.accounts.iter().filter(|e| e.value().is_active).map(|e| e.value().clone()).collect())
        }

        async fn list_active_by_tag(&self, tag: &str) -> StoreResult<Vec<Account>> {
            Ok(self
                .accounts
                .iter()
                .filter(|e| e.value().is_active && e.value().has_tag(tag))
                .map(|e| e.value().clone())
                .collect())
        }

        async fn add(&self, mut account: Account) -> StoreResult<Account> {
            let id = self.next_account_id.fetch_add(1, Ordering::SeqCst) + 1;
            account.id = id;
            self.accounts.insert(id, account.clone());
            Ok(account)
        }

        async fn delete(&self, id: i64) -> StoreResult<()> {
            self.accounts.remove(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            Ok(())
        }

        async fn update_label(&self, id: i64, label: &str) -> StoreResult<()> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.label = label.to_string();
            Ok(())
        }

        async fn update_tags(&self, id: i64, tags: &str) -> StoreResult<()> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.tags = tags.to_string();
            Ok(())
        }

        async fn update_serial(&self, id: i64, serial: i64) -> StoreResult<()> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.serial = serial;
            Ok(())
        }

        async fn toggle_status(&self, id: i64) -> StoreResult<bool> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.is_active = !a.is_active;
            Ok(a.is_active)
        }

        async fn set_dirty(&self, id: i64, dirty: bool) -> StoreResult<()> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.is_dirty = dirty;
            Ok(())
        }

        async fn set_key_hash(&self, id: i64, key_hash: &str) -> StoreResult<()> {
            let mut a = self.accounts.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
            a.key_hash = key_hash.to_string();
            Ok(())
        }

        async fn get(&self, id: i64) -> StoreResult<Account> {
            self.accounts.get(&id).map(|e| e.value().clone()).ok_or_else(|| StoreError::NotFound(format!("account {id}")))
        }
    }

    #[async_trait]
    impl PublicKeyStore for MemoryStore {
        async fn add(&self, mut key: PublicKey) -> StoreResult<PublicKey> {
            let id = self.next_key_id.fetch_add(1, Ordering::SeqCst) + 1;
            key.id = id;
            self.public_keys.insert(id, key.clone());
            Ok(key)
        }

        async fn list(&self) -> StoreResult<Vec<PublicKey>> {
            Ok(self.public_keys.iter().map(|e| e.value().clone()).collect())
        }

        async fn list_global(&self) -> StoreResult<Vec<PublicKey>> {
            Ok(self.public_keys.iter().filter(|e| e.value().is_global).map(|e| e.value().clone()).collect())
        }

        async fn get_by_comment(&self, comment: &str) -> StoreResult<Option<PublicKey>> {
            Ok(self.public_keys.iter().find(|e| e.value().comment == comment).map(|e| e.value().clone()))
        }

        async fn toggle_global(&self, id: i64) -> StoreResult<bool> {
            let mut k = self.public_keys.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("public key {id}")))?;
            k.is_global = !k.is_global;
            Ok(k.is_global)
        }

        async fn set_expiry(&self, id: i64, expires_at: Option<UnixTimestamp>) -> StoreResult<()> {
            let mut k = self.public_keys.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("public key {id}")))?;
            k.expires_at = expires_at;
            Ok(())
        }

        async fn delete(&self, id: i64) -> StoreResult<()> {
            self.public_keys.remove(&id).ok_or_else(|| StoreError::NotFound(format!("public key {id}")))?;
            Ok(())
        }
    }

    #[async_trait]
    impl SystemKeyStore for MemoryStore {
        async fn create(&self, mut key: SystemKey) -> StoreResult<SystemKey> {
            let id = self.next_system_key_id.fetch_add(1, Ordering::SeqCst) + 1;
            key.id = id;
            self.system_keys.insert(id, key.clone());
            Ok(key)
        }

        async fn rotate(&self, mut new: SystemKey) -> StoreResult<SystemKey> {
            for mut e in self.system_keys.iter_mut() {
                e.value_mut().is_active = false;
            }
            let id = self.next_system_key_id.fetch_add(1, Ordering::SeqCst) + 1;
            new.id = id;
            new.is_active = true;
            self.system_keys.insert(id, new.clone());
            Ok(new)
        }

        async fn get_active(&self) -> StoreResult<Option<SystemKey>> {
            Ok(self.system_keys.iter().find(|e| e.value().is_active).map(|e| e.value().clone()))
        }

        async fn get_by_serial(&self, serial: i64) -> StoreResult<Option<SystemKey>> {
            Ok(self.system_keys.iter().find(|e| e.value().serial == serial).map(|e| e.value().clone()))
        }

        async fn has_any(&self) -> StoreResult<bool> {
            Ok(!self.system_keys.is_empty())
        }
    }

    #[async_trait]
    impl KnownHostStore for MemoryStore {
        async fn get(&self, canonical: &str) -> StoreResult<Option<KnownHost>> {
            Ok(self.known_hosts.get(canonical).map(|e| e.value().clone()))
        }

        async fn put(&self, host: KnownHost) -> StoreResult<()> {
            self.known_hosts.insert(host.canonical.clone(), host);
            Ok(())
        }
    }

    #[async_trait]
    impl AssignmentStore for MemoryStore {
        async fn assign(&self, link: AccountKey) -> StoreResult<()> {
            self.assignments.insert((link.account_id, link.public_key_id), ());
            Ok(())
        }

        async fn unassign(&self, link: AccountKey) -> StoreResult<()> {
            self.assignments.remove(&(link.account_id, link.public_key_id));
            Ok(())
        }

        async fn list_for_account(&self, account_id: i64) -> StoreResult<Vec<i64>> {
            Ok(self
                .assignments
                .iter()
                .filter(|e| e.key().0 == account_id)
                .map(|e| e.key().1)
                .collect())
        }

        async fn list_for_key(&self, public_key_id: i64) -> StoreResult<Vec<i64>> {
            Ok(self
                .assignments
                .iter()
                .filter(|e| e.key().1 == public_key_id)
                .map(|e| e.key().0)
                .collect())
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn save(&self, session: BootstrapSession) -> StoreResult<()> {
            self.sessions.insert(session.id.clone(), session);
            Ok(())
        }

        async fn get(&self, id: &str) -> StoreResult<Option<BootstrapSession>> {
            Ok(self.sessions.get(id).map(|e| e.value().clone()))
        }

        async fn update_status(&self, id: &str, status: BootstrapStatus) -> StoreResult<()> {
            let mut s = self.sessions.get_mut(id).ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
            s.status = status;
            Ok(())
        }

        async fn delete(&self, id: &str) -> StoreResult<()> {
            self.sessions.remove(id).ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
            Ok(())
        }

        async fn list_expired(&self, now: UnixTimestamp) -> StoreResult<Vec<BootstrapSession>> {
            Ok(self
                .sessions
                .iter()
                .filter(|e| matches!(e.value().status, BootstrapStatus::Active) && e.value().expires_at <= now)
                .map(|e| e.value().clone())
                .collect())
        }

        async fn list_orphaned(&self) -> StoreResult<Vec<BootstrapSession>> {
            Ok(self
                .sessions
                .iter()
                .filter(|e| matches!(e.value().status, BootstrapStatus::Orphaned))
                .map(|e| e.value().clone())
                .collect())
        }

        async fn list_active(&self) -> StoreResult<Vec<BootstrapSession>> {
            Ok(self
                .sessions
                .iter()
                .filter(|e| matches!(e.value().status, BootstrapStatus::Active))
                .map(|e| e.value().clone())
                .collect())
        }
    }

    #[async_trait]
    impl AuditStore for MemoryStore {
        async fn append(&self, entry: AuditLogEntry) -> StoreResult<()> {
            let id = self.next_audit_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.audit.insert(id, entry);
            Ok(())
        }

        async fn list(&self) -> StoreResult<Vec<AuditLogEntry>> {
            let mut entries: Vec<(i64, AuditLogEntry)> = self.audit.iter().map(|e| (*e.key(), e.value().clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            Ok(entries.into_iter().map(|(_, e)| e).collect())
        }
    }
}

pub use memory::MemoryStore;

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: i64, active: bool, tags: &str) -> Account {
        Account {
            id,
            username: "deploy".into(),
            hostname: format!("host{id}.example.com"),
            label: format!("host{id}"),
            tags: tags.to_string(),
            serial: 0,
            is_active: active,
            is_dirty: false,
            key_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn add_assigns_sequential_ids_and_list_active_filters() {
        let store = MemoryStore::new();
        let a = store.add(account(0, true, "db,prod")).await.unwrap();
        let b = store.add(account(0, false, "db")).await.unwrap();
        assert_ne!(a.id, b.id);

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let by_tag = store.list_active_by_tag("db").await.unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, a.id);
    }

    #[tokio::test]
    async fn system_key_rotate_deactivates_previous() {
        let store = MemoryStore::new();
        let first = store
            .create(SystemKey { id: 0, serial: 1, public_key: "ssh-ed25519 AAAA k1".into(), private_key: "pem1".into(), is_active: true })
            .await
            .unwrap();
        let second = store
            .rotate(SystemKey { id: 0, serial: 2, public_key: "ssh-ed25519 AAAA k2".into(), private_key: "pem2".into(), is_active: true })
            .await
            .unwrap();

        let active = store.get_active().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(store.get_by_serial(first.serial).await.unwrap().unwrap().is_active, false);
    }

    #[tokio::test]
    async fn assignment_roundtrip() {
        let store = MemoryStore::new();
        store.assign(AccountKey { account_id: 1, public_key_id: 10 }).await.unwrap();
        store.assign(AccountKey { account_id: 1, public_key_id: 11 }).await.unwrap();
        assert_eq!(store.list_for_account(1).await.unwrap().len(), 2);
        assert_eq!(store.list_for_key(10).await.unwrap(), vec![1]);

        store.unassign(AccountKey { account_id: 1, public_key_id: 10 }).await.unwrap();
        assert_eq!(store.list_for_account(1).await.unwrap(), vec![11]);
    }

    #[tokio::test]
    async fn audit_list_preserves_append_order() {
        let store = MemoryStore::new();
        store
            .append(AuditLogEntry { timestamp: 1, username: "root".into(), action: crate::model::audit_action::ADD_ACCOUNT.into(), details: "one".into() })
            .await
            .unwrap();
        store
            .append(AuditLogEntry { timestamp: 2, username: "root".into(), action: crate::model::audit_action::ADD_ACCOUNT.into(), details: "two".into() })
            .await
            .unwrap();
        let entries = store.list().await.unwrap();
        assert_eq!(entries.iter().map(|e| e.details.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);
    }
}
