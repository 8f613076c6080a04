//! C4 — host-trust store interface: canonical `host:port` addressing,
//! trust-on-first-use, and mismatch detection. The pin itself lives behind
//! [`crate::store::KnownHostStore`]; this module owns canonicalization and
//! the TOFU decision, not persistence.

use crate::error::TrustError;
use crate::model::KnownHost;
use crate::store::KnownHostStore;

/// How a connection attempt should treat the remote host key (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyMode {
    /// Require an existing pin; fail on first contact.
    Verify,
    /// Pin on first contact; fail only on mismatch against an existing pin.
    TrustOnFirstUse,
    /// Accept only if the presented key equals the given expected key
    /// (bootstrap's `VerifyHostKey` step, after the operator has accepted
    /// a probed key).
    PinExpected,
}

/// Canonicalize a host address per §6:
/// - strip a leading `user@`
/// - bracketed IPv6 (`[::1]:2222`) is parsed as `(ipv6, port)`
/// - otherwise try `host:port`, falling back to bare host
/// - rejoin as `host:port`, bracketing IPv6 and defaulting the port to 22
pub fn canonicalize(input: &str) -> Result<String, TrustError> {
    let input = input.rsplit_once('@').map(|(_, rest)| rest).unwrap_or(input);

    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| TrustError::InvalidAddress(input.to_string()))?;
        if host.is_empty() {
            return Err(TrustError::InvalidAddress(input.to_string()));
        }
        let port = match after.strip_prefix(':') {
            Some(p) if !p.is_empty() => p.parse::<u16>().map_err(|_| TrustError::InvalidAddress(input.to_string()))?,
            Some(_) => return Err(TrustError::InvalidAddress(input.to_string())),
            None => 22,
        };
        return Ok(format!("[{host}]:{port}"));
    }

    // Disambiguate bare IPv6 (multiple colons, no brackets) from host:port.
    let colon_count = input.matches(':').count();
    if colon_count >= 2 {
        if input.is_empty() {
            return Err(TrustError::InvalidAddress(input.to_string()));
        }
        return Ok(format!("[{input}]:22"));
    }

    match input.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() && !port_str.is_empty() => {
            let port: u16 = port_str.parse().map_err(|_| TrustError::InvalidAddress(input.to_string()))?;
            Ok(format!("{host}:{port}"))
        }
        _ if !input.is_empty() => Ok(format!("{input}:22")),
        _ => Err(TrustError::InvalidAddress(input.to_string())),
    }
}

/// Resolve a host-key pin for a non-bootstrap connect: look up by the full
/// canonical `host:port`, then fall back to the bare host (for backward
/// compatibility with pins written before port-qualified addressing).
async fn resolve_existing(store: &dyn KnownHostStore, canonical: &str) -> Result<Option<KnownHost>, TrustError> {
    if let Some(hit) = store.get(canonical).await.map_err(|e| TrustError::InvalidAddress(e.to_string()))? {
        return Ok(Some(hit));
    }
    let bare_host = canonical.rsplit_once(':').map(|(h, _)| h).unwrap_or(canonical);
    if bare_host == canonical {
        return Ok(None);
    }
    store.get(bare_host).await.map_err(|e| TrustError::InvalidAddress(e.to_string()))
}

/// Apply TOFU policy given the key actually presented by the remote host.
/// Returns `Ok(())` when the connection may proceed; on `Ok`, trust-on-first
/// use callers should then `put` the presented key if no prior pin existed.
pub async fn check(store: &dyn KnownHostStore, canonical: &str, presented_key: &str, mode: HostKeyMode) -> Result<(), TrustError> {
    let existing = resolve_existing(store, canonical).await?;

    match (mode, existing) {
        (HostKeyMode::PinExpected, Some(known)) if known.host_key == presented_key => Ok(()),
        (HostKeyMode::PinExpected, _) => Err(TrustError::Mismatch { canonical: canonical.to_string() }),
        (HostKeyMode::Verify, None) => Err(TrustError::Unknown { canonical: canonical.to_string() }),
        (HostKeyMode::Verify, Some(known)) if known.host_key == presented_key => Ok(()),
        (HostKeyMode::Verify, Some(_)) => Err(TrustError::Mismatch { canonical: canonical.to_string() }),
        (HostKeyMode::TrustOnFirstUse, None) => Ok(()),
        (HostKeyMode::TrustOnFirstUse, Some(known)) if known.host_key == presented_key => Ok(()),
        (HostKeyMode::TrustOnFirstUse, Some(_)) => Err(TrustError::Mismatch { canonical: canonical.to_string() }),
    }
}

/// Pin a host key, replacing whatever was pinned before (`INSERT OR
/// REPLACE` semantics per §3 — re-provisioning is supported, there is no
/// "strict TOFU" lock that would reject a later trust call).
pub async fn pin(store: &dyn KnownHostStore, canonical: &str, host_key: &str) -> Result<(), TrustError> {
    store
        .put(KnownHost { canonical: canonical.to_string(), host_key: host_key.to_string() })
        .await
        .map_err(|e| TrustError::InvalidAddress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn strips_user_prefix() {
        assert_eq!(canonicalize("deploy@db1.example.com").unwrap(), "db1.example.com:22");
    }

    #[test]
    fn defaults_port_when_absent() {
        assert_eq!(canonicalize("db1.example.com").unwrap(), "db1.example.com:22");
    }

    #[test]
    fn keeps_explicit_port() {
        assert_eq!(canonicalize("db1.example.com:2222").unwrap(), "db1.example.com:2222");
    }

    #[test]
    fn brackets_bare_ipv6() {
        assert_eq!(canonicalize("::1").unwrap(), "[::1]:22");
    }

    #[test]
    fn preserves_bracketed_ipv6_with_port() {
        assert_eq!(canonicalize("[2001:db8::1]:2200").unwrap(), "[2001:db8::1]:2200");
    }

    #[test]
    fn defaults_port_for_bracketed_ipv6() {
        assert_eq!(canonicalize("[2001:db8::1]").unwrap(), "[2001:db8::1]:22");
    }

    #[tokio::test]
    async fn trust_on_first_use_pins_then_detects_mismatch() {
        let store = MemoryStore::new();
        let canonical = "db1.example.com:22";

        check(&store, canonical, "keyA", HostKeyMode::TrustOnFirstUse).await.unwrap();
        pin(&store, canonical, "keyA").await.unwrap();

        assert!(check(&store, canonical, "keyA", HostKeyMode::TrustOnFirstUse).await.is_ok());
        let err = check(&store, canonical, "keyB", HostKeyMode::TrustOnFirstUse).await.unwrap_err();
        assert!(matches!(err, TrustError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn verify_mode_rejects_unknown_host() {
        let store = MemoryStore::new();
        let err = check(&store, "new-host.example.com:22", "keyA", HostKeyMode::Verify).await.unwrap_err();
        assert!(matches!(err, TrustError::Unknown { .. }));
    }

    #[tokio::test]
    async fn falls_back_to_bare_host_pin() {
        let store = MemoryStore::new();
        pin(&store, "db1.example.com", "keyA").await.unwrap();
        assert!(check(&store, "db1.example.com:22", "keyA", HostKeyMode::Verify).await.is_ok());
    }

    #[tokio::test]
    async fn re_pinning_replaces_prior_key() {
        let store = MemoryStore::new();
        let canonical = "db1.example.com:22";
        pin(&store, canonical, "keyA").await.unwrap();
        pin(&store, canonical, "keyB").await.unwrap();
        assert!(check(&store, canonical, "keyB", HostKeyMode::Verify).await.is_ok());
    }
}
