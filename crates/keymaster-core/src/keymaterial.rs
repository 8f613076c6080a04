//! C1 — key-material library: Ed25519 keypair generation, authorized_keys
//! line parsing, SHA-256 fingerprints, and optionally passphrase-protected
//! private-key serialization.
//!
//! Built on `ssh-key` (OpenSSH wire/PEM formats and Ed25519 keypair
//! generation), the same pure-Rust SSH stack used elsewhere in the
//! retrieval pack for agentless key management — no shelling out to
//! `ssh-keygen`.

use crate::error::KeyMaterialError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey};
use zeroize::Zeroizing;

/// A freshly generated Ed25519 keypair, in authorized_keys / OpenSSH PEM
/// form.
pub struct GeneratedKeypair {
    /// `"<alg> <base64> <comment>"` authorized_keys line.
    pub public_line: String,
    /// OpenSSH PEM, unencrypted unless a passphrase was supplied.
    pub private_pem: Zeroizing<String>,
    pub fingerprint: String,
}

/// Generate a new Ed25519 keypair. When `passphrase` is `Some`, the private
/// key PEM is encrypted with it (OpenSSH's own scheme, via `ssh-key`'s
/// `encryption` feature); otherwise the PEM is written unencrypted — both
/// are the "standard OpenSSH PEM form" §4.1 asks for.
pub fn generate_ed25519(comment: &str, passphrase: Option<&str>) -> Result<GeneratedKeypair, KeyMaterialError> {
    let mut private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| KeyMaterialError::GenerationFailed(e.to_string()))?;
    private
        .set_comment(comment)
        .map_err(|e| KeyMaterialError::GenerationFailed(e.to_string()))?;

    if let Some(pass) = passphrase {
        private = private
            .encrypt(&mut OsRng, pass.as_bytes())
            .map_err(|e| KeyMaterialError::Serialization(e.to_string()))?;
    }

    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| KeyMaterialError::Serialization(e.to_string()))?;

    let public = private.public_key();
    let public_line = format!(
        "{} {} {}",
        public.algorithm(),
        BASE64.encode(public.key_data().ed25519().ok_or(KeyMaterialError::UnknownKeyType)?.0),
        comment
    );
    let fingerprint = fingerprint_sha256_of(public);

    Ok(GeneratedKeypair {
        public_line,
        private_pem: Zeroizing::new(private_pem.to_string()),
        fingerprint,
    })
}

/// Decode an OpenSSH PEM private key, decrypting with `passphrase` if it is
/// encrypted and no passphrase is given. §4.5 step 1's contract: on an
/// encrypted key with no passphrase, return the recoverable
/// [`KeyMaterialError::PassphraseRequired`] signal rather than failing hard.
pub fn load_private_key(pem: &str, passphrase: Option<&str>) -> Result<PrivateKey, KeyMaterialError> {
    let key = PrivateKey::from_openssh(pem).map_err(|_| KeyMaterialError::DecryptionFailed)?;
    if key.is_encrypted() {
        let pass = passphrase.ok_or(KeyMaterialError::PassphraseRequired)?;
        key.decrypt(pass.as_bytes()).map_err(|_| KeyMaterialError::DecryptionFailed)
    } else {
        Ok(key)
    }
}

/// `fingerprint-sha256(pub) -> string`, formatted `SHA256:<base64, no padding>`
/// the way OpenSSH itself prints it.
pub fn fingerprint_sha256_of(public: &PublicKey) -> String {
    format!("{}", public.fingerprint(HashAlg::Sha256))
}

/// Non-fatal advisory returned alongside a successfully parsed key when its
/// algorithm is considered weak (§4.1: DSA, or RSA < 2048 bits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAdvisory {
    None,
    WeakAlgorithm { algorithm: String, detail: String },
}

/// A parsed authorized_keys line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub algorithm: String,
    pub key_data: String,
    pub comment: String,
    pub advisory: KeyAdvisory,
}

/// Parse a raw authorized_keys line, optionally prefixed with SSH options
/// (`command="...",no-pty ssh-ed25519 AAAA... comment`). Locates the first
/// whitespace-delimited token starting with `ssh-` or `ecdsa-`, then expects
/// a base64 key-data token immediately after it; everything past that is the
/// comment (may be empty).
pub fn parse_authorized_key_line(line: &str) -> Result<ParsedKey, KeyMaterialError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(KeyMaterialError::EmptyLine);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let key_type_idx = tokens
        .iter()
        .position(|t| t.starts_with("ssh-") || t.starts_with("ecdsa-"))
        .ok_or(KeyMaterialError::UnknownKeyType)?;

    let algorithm = tokens[key_type_idx].to_string();
    let key_data = tokens
        .get(key_type_idx + 1)
        .copied()
        .ok_or(KeyMaterialError::MissingKeyData)?;
    BASE64
        .decode(key_data)
        .map_err(KeyMaterialError::InvalidBase64)?;

    let comment = tokens[key_type_idx + 2..].join(" ");
    let advisory = weak_algorithm_advisory(&algorithm, key_data);

    Ok(ParsedKey {
        algorithm,
        key_data: key_data.to_string(),
        comment,
        advisory,
    })
}

fn weak_algorithm_advisory(algorithm: &str, key_data_b64: &str) -> KeyAdvisory {
    if algorithm == "ssh-dss" {
        return KeyAdvisory::WeakAlgorithm {
            algorithm: algorithm.to_string(),
            detail: "DSA keys are deprecated and should be replaced".to_string(),
        };
    }
    if algorithm == "ssh-rsa" {
        if let Ok(raw) = BASE64.decode(key_data_b64) {
            if let Some(bits) = rsa_modulus_bits(&raw) {
                if bits < 2048 {
                    return KeyAdvisory::WeakAlgorithm {
                        algorithm: algorithm.to_string(),
                        detail: format!("RSA key is only {bits} bits; 2048+ is recommended"),
                    };
                }
            }
        }
    }
    KeyAdvisory::None
}

/// Extract the RSA modulus bit length from an `ssh-rsa` key-data blob
/// (`string "ssh-rsa"`, `mpint e`, `mpint n`), without pulling in a full RSA
/// parsing crate — just enough to size the advisory above.
fn rsa_modulus_bits(key_data: &[u8]) -> Option<u32> {
    let mut pos = 0usize;
    let read_u32 = |buf: &[u8], pos: &mut usize| -> Option<u32> {
        let bytes: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
        *pos += 4;
        Some(u32::from_be_bytes(bytes))
    };
    let skip_field = |buf: &[u8], pos: &mut usize| -> Option<()> {
        let len = read_u32(buf, pos)? as usize;
        *pos += len;
        Some(())
    };

    let type_len = read_u32(key_data, &mut pos)? as usize;
    pos += type_len; // "ssh-rsa"
    skip_field(key_data, &mut pos)?; // e
    let n_len = read_u32(key_data, &mut pos)? as usize;
    let n = key_data.get(pos..pos + n_len)?;
    // mpint may carry a leading zero sign byte; don't count it.
    let mut n = n;
    while n.first() == Some(&0) {
        n = &n[1..];
    }
    let bits = n.len() as u32 * 8
        - n.first()
            .map(|b| b.leading_zeros())
            .unwrap_or(0);
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_round_trips_unencrypted_key() {
        let kp = generate_ed25519("alice@example.com", None).unwrap();
        assert!(kp.public_line.starts_with("ssh-ed25519 "));
        assert!(kp.public_line.ends_with("alice@example.com"));
        assert!(kp.fingerprint.starts_with("SHA256:"));

        let loaded = load_private_key(&kp.private_pem, None).unwrap();
        assert!(!loaded.is_encrypted());
    }

    #[test]
    fn encrypted_key_requires_passphrase() {
        let kp = generate_ed25519("bob@example.com", Some("hunter2")).unwrap();
        let err = load_private_key(&kp.private_pem, None).unwrap_err();
        assert!(matches!(err, KeyMaterialError::PassphraseRequired));

        let loaded = load_private_key(&kp.private_pem, Some("hunter2")).unwrap();
        assert!(!loaded.is_encrypted());
    }

    #[test]
    fn wrong_passphrase_fails_distinctly() {
        let kp = generate_ed25519("carol@example.com", Some("correct-horse")).unwrap();
        let err = load_private_key(&kp.private_pem, Some("wrong")).unwrap_err();
        assert!(matches!(err, KeyMaterialError::DecryptionFailed));
    }

    #[test]
    fn parses_line_with_options_prefix() {
        let parsed = parse_authorized_key_line(
            r#"command="internal-sftp",no-pty ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA alice@example.com"#,
        )
        .unwrap();
        assert_eq!(parsed.algorithm, "ssh-ed25519");
        assert_eq!(parsed.comment, "alice@example.com");
    }

    #[test]
    fn rejects_empty_line() {
        assert!(matches!(parse_authorized_key_line(""), Err(KeyMaterialError::EmptyLine)));
    }

    #[test]
    fn rejects_missing_key_type() {
        assert!(matches!(
            parse_authorized_key_line("not-a-key-type AAAA comment"),
            Err(KeyMaterialError::UnknownKeyType)
        ));
    }

    #[test]
    fn dsa_is_flagged_weak() {
        let parsed = parse_authorized_key_line("ssh-dss AAAAB3NzaC1kc3MAAAA= legacy@example.com").unwrap();
        assert!(matches!(parsed.advisory, KeyAdvisory::WeakAlgorithm { .. }));
    }
}
