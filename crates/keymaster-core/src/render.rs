//! C2 — the authorized_keys renderer. A pure function of
//! `(active system key, global keys, per-account keys, now)`; the one piece
//! of this crate every other orchestrator calls through, so its output
//! must be byte-stable for a given input across runs and across whatever
//! language a peer implementation is written in.

use crate::error::RenderError;
use crate::model::{PublicKey, SystemKey, UnixTimestamp};

const HEADER_PREFIX: &str = "# Keymaster Managed Keys (Serial: ";
const RESTRICTED_OPTIONS: &str = "command=\"internal-sftp\",no-port-forwarding,no-x11-forwarding,no-agent-forwarding,no-pty";

/// Render the canonical authorized_keys payload (§4.2).
///
/// `globals` and `per_account` may overlap; entries are deduplicated by
/// [`PublicKey::id`], not by content, so two keys that happen to render
/// identically but carry distinct ids are both kept.
pub fn render(system_key: Option<&SystemKey>, globals: &[PublicKey], per_account: &[PublicKey], now: UnixTimestamp) -> Result<String, RenderError> {
    let system_key = system_key.ok_or(RenderError::NoActiveSystemKey)?;

    let mut seen = std::collections::HashSet::new();
    let mut live: Vec<&PublicKey> = globals
        .iter()
        .chain(per_account.iter())
        .filter(|k| seen.insert(k.id))
        .filter(|k| k.is_live_at(now))
        .collect();

    live.sort_by(|a, b| a.comment.cmp(&b.comment));

    let mut lines = vec![
        format!("{HEADER_PREFIX}{})", system_key.serial),
        format!("{RESTRICTED_OPTIONS} {}", system_key.public_key),
    ];
    lines.extend(live.iter().map(|key| key.authorized_line()));

    let mut out = lines.join("\n");
    if !live.is_empty() {
        out.push('\n');
    }

    Ok(out)
}

/// Parse the `Serial: <N>` value out of a rendered payload's managed
/// header, used by the serial-only audit mode (§4.8).
pub fn parse_header_serial(content: &str) -> Option<i64> {
    let first_line = content.lines().next()?;
    let start = first_line.find(HEADER_PREFIX)? + HEADER_PREFIX.len();
    let rest = &first_line[start..];
    let end = rest.find(')')?;
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_key() -> SystemKey {
        SystemKey {
            id: 1,
            serial: 7,
            public_key: "ssh-ed25519 AAAAsystem system@keymaster".into(),
            private_key: "pem".into(),
            is_active: true,
        }
    }

    fn key(id: i64, comment: &str, expires_at: Option<UnixTimestamp>) -> PublicKey {
        PublicKey {
            id,
            algorithm: "ssh-ed25519".into(),
            key_data: format!("AAAA{id}"),
            comment: comment.into(),
            is_global: false,
            expires_at,
        }
    }

    #[test]
    fn fails_without_active_system_key() {
        assert!(matches!(render(None, &[], &[], 0), Err(RenderError::NoActiveSystemKey)));
    }

    #[test]
    fn header_and_restricted_system_key_line() {
        let out = render(Some(&system_key()), &[], &[], 0).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next().unwrap(), "# Keymaster Managed Keys (Serial: 7)");
        assert_eq!(lines.next().unwrap(), format!("{RESTRICTED_OPTIONS} ssh-ed25519 AAAAsystem system@keymaster"));
        assert_eq!(lines.next(), None);
        assert!(!out.ends_with('\n'));
    }

    #[test]
    fn trailing_lf_present_when_user_keys_exist() {
        let out = render(Some(&system_key()), &[key(1, "alice", None)], &[], 1_000).unwrap();
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn dedups_by_id_not_source_list() {
        let shared = key(1, "alice", None);
        let out = render(Some(&system_key()), &[shared.clone()], &[shared], 0).unwrap();
        assert_eq!(out.matches("alice").count(), 1);
    }

    #[test]
    fn excludes_expired_but_keeps_never_expiring_and_future() {
        let out = render(
            Some(&system_key()),
            &[key(1, "alice-future", Some(2_000)), key(2, "bob-expired", Some(500)), key(3, "carol-forever", None)],
            &[],
            1_000,
        )
        .unwrap();
        assert!(out.contains("alice-future"));
        assert!(!out.contains("bob-expired"));
        assert!(out.contains("carol-forever"));
    }

    #[test]
    fn deactivated_sentinel_is_excluded() {
        let out = render(Some(&system_key()), &[key(1, "alice", Some(0))], &[], 1_000).unwrap();
        assert!(!out.contains("alice"));
    }

    #[test]
    fn sorted_ascending_by_comment() {
        let out = render(Some(&system_key()), &[key(1, "zeta", None), key(2, "alpha", None)], &[], 0).unwrap();
        let alpha_pos = out.find("alpha").unwrap();
        let zeta_pos = out.find("zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn header_serial_round_trips() {
        let out = render(Some(&system_key()), &[], &[], 0).unwrap();
        assert_eq!(parse_header_serial(&out), Some(7));
    }
}
