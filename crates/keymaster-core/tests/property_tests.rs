//! Property coverage for the three invariants SPEC_FULL's test-tooling
//! section calls out as worth generating inputs for: normalization-hash
//! equivalence under cosmetic noise (C3), host-address canonicalization
//! idempotence (C4), and render determinism (C2).

use keymaster_core::hash::content_hash;
use keymaster_core::model::{PublicKey, SystemKey};
use keymaster_core::render::render;
use keymaster_core::trust::canonicalize;
use proptest::prelude::*;

fn public_key(id: i64) -> PublicKey {
    PublicKey {
        id,
        algorithm: "ssh-ed25519".to_string(),
        key_data: format!("AAAA{id}"),
        comment: format!("user{id}"),
        is_global: false,
        expires_at: None,
    }
}

proptest! {
    /// Interleaving blank lines, `#`-comment lines, and trailing
    /// spaces/tabs into an otherwise-fixed managed file must never change
    /// its content hash (§4.3).
    #[test]
    fn normalization_absorbs_cosmetic_noise(
        extra_blank_lines in 0usize..5,
        extra_comment_lines in 0usize..5,
        trailing_spaces in 0usize..4,
        use_crlf in any::<bool>(),
    ) {
        let base = "# Keymaster Managed Keys (Serial: 3)\nssh-ed25519 AAAA alice@example.com\nssh-rsa AAAA bob@example.com";

        let mut noisy = String::new();
        for line in base.lines() {
            noisy.push_str(line);
            noisy.push_str(&" ".repeat(trailing_spaces));
            noisy.push('\n');
        }
        for _ in 0..extra_blank_lines {
            noisy.push('\n');
        }
        for i in 0..extra_comment_lines {
            noisy.push_str(&format!("# stray comment {i}\n"));
        }
        if use_crlf {
            noisy = noisy.replace('\n', "\r\n");
        }

        prop_assert_eq!(content_hash(base), content_hash(&noisy));
    }

    /// Any address canonicalize() accepts is already in its own canonical
    /// form: re-canonicalizing its output is a no-op (§6).
    #[test]
    fn canonicalize_is_idempotent_on_plain_hosts(
        host in "[a-z][a-z0-9]{0,10}(\\.[a-z][a-z0-9]{0,10}){0,2}",
        port in 1u16..=65535,
        with_explicit_port in any::<bool>(),
        with_user_prefix in any::<bool>(),
    ) {
        let addr = if with_explicit_port { format!("{host}:{port}") } else { host.clone() };
        let addr = if with_user_prefix { format!("deploy@{addr}") } else { addr };

        let once = canonicalize(&addr).unwrap();
        let twice = canonicalize(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Bracketed IPv6 addresses canonicalize idempotently too, independent
    /// of whether a port was given.
    #[test]
    fn canonicalize_is_idempotent_on_bracketed_ipv6(
        segment in "[0-9a-f]{1,4}",
        port in 1u16..=65535,
        with_explicit_port in any::<bool>(),
    ) {
        let host = format!("[{segment}::1]");
        let addr = if with_explicit_port { format!("{host}:{port}") } else { host };

        let once = canonicalize(&addr).unwrap();
        let twice = canonicalize(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    /// Rendering the same snapshot twice must byte-for-byte agree: nothing
    /// in C2 may depend on hash-map iteration order or wall-clock time
    /// beyond the `now` parameter both calls share (§4.2).
    #[test]
    fn render_is_deterministic(
        serial in 0i64..1_000,
        global_keys in prop::collection::vec(0i64..50, 0..4),
        account_keys in prop::collection::vec(50i64..100, 0..4),
        now in 0i64..10_000_000,
    ) {
        let system_key = SystemKey {
            id: 1,
            serial,
            public_key: "ssh-ed25519 AAAAsystem system@keymaster".to_string(),
            private_key: "pem".to_string(),
            is_active: true,
        };

        let globals: Vec<PublicKey> = global_keys.into_iter().map(public_key).collect();
        let per_account: Vec<PublicKey> = account_keys.into_iter().map(public_key).collect();

        let first = render(Some(&system_key), &globals, &per_account, now).unwrap();
        let second = render(Some(&system_key), &globals, &per_account, now).unwrap();
        prop_assert_eq!(first, second);
    }
}
