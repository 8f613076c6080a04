//! Error taxonomy for the Keymaster core.
//!
//! Every fallible operation in this crate returns a [`KeymasterError`]. Each
//! component family gets its own `thiserror` enum (mirroring the per-module
//! error style used elsewhere in this workspace); [`KeymasterError`]
//! aggregates them with `#[from]` so callers can match on either the
//! specific variant or the coarser [`ErrorCategory`] from the taxonomy.

use thiserror::Error;

/// Coarse classification from the error-handling design (input / config /
/// transport / auth / trust / remote / store / internal). Fleet operations
/// use this to decide whether a failure is worth surfacing immediately or
/// retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Input,
    Config,
    Transport,
    Auth,
    Trust,
    Remote,
    Store,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Config => "config",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Trust => "trust",
            ErrorCategory::Remote => "remote",
            ErrorCategory::Store => "store",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// C1 key-material parsing/generation failures.
#[derive(Debug, Error)]
pub enum KeyMaterialError {
    #[error("unrecognized key type in authorized_keys line")]
    UnknownKeyType,
    #[error("authorized_keys line is missing its base64 key-data component")]
    MissingKeyData,
    #[error("authorized_keys line is empty")]
    EmptyLine,
    #[error("invalid base64 key data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("key generation failed: {0}")]
    GenerationFailed(String),
    #[error("failed to serialize private key: {0}")]
    Serialization(String),
    #[error("passphrase required to decrypt private key")]
    PassphraseRequired,
    #[error("incorrect passphrase or corrupt private key")]
    DecryptionFailed,
}

/// C2 renderer failures.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no active system key to render against")]
    NoActiveSystemKey,
}

/// C4 host-trust failures.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("host key mismatch for {canonical}: remote presented an unrecognized key")]
    Mismatch { canonical: String },
    #[error("unknown host key for {canonical} (trust-on-first-use not permitted in this mode)")]
    Unknown { canonical: String },
    #[error("could not parse host address: {0}")]
    InvalidAddress(String),
}

/// C5 transport failures, classified per §4.5/§7.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timed out dialing {0}")]
    Timeout(String),
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error("private key is passphrase-protected")]
    PassphraseRequired,
    #[error("no authentication method available (no key, no agent)")]
    NoAuthMethod,
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error("transport error: {0}")]
    Other(String),
}

/// C6 SFTP deploy primitive failures.
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("sftp session failed: {0}")]
    Session(String),
    #[error("failed to write remote file {path}: {source}")]
    Write { path: String, source: String },
    #[error("failed to rename {from} -> {to}: {source}")]
    Rename { from: String, to: String, source: String },
    #[error("failed to read remote file {path}: {source}")]
    Read { path: String, source: String },
    #[error("failed to set permissions on {path}: {source}")]
    Chmod { path: String, source: String },
    #[error("sftp operation on {path} timed out")]
    Timeout { path: String },
}

/// Abstract persistent-store failures (the store implementation itself is
/// an external collaborator; this is only the shape the core observes).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store contention: {0}")]
    Contention(String),
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Other(String),
}

/// C7 account deployment failures.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no system key found for serial {0}")]
    NoSuchSystemKey(i64),
    #[error("passphrase required and interactive mode is disabled")]
    PassphraseRequiredNonInteractive,
}

/// C8 audit failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote managed header missing or unparsable")]
    MalformedHeader,
    #[error("no system key found for serial {0}")]
    NoSuchSystemKey(i64),
}

/// C10 bootstrap session failures.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {session} is in state {state:?}, which does not permit this transition")]
    InvalidTransition { session: String, state: String },
    #[error("session {0} expired")]
    Expired(String),
    #[error("operator rejected the presented host key")]
    HostKeyRejected,
}

/// C11 import/decommission failures.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("no system key found for serial {0}")]
    NoSuchSystemKey(i64),
}

/// The crate-wide error type. Every public fallible operation returns
/// `Result<T, KeymasterError>` (or a narrower alias that converts into it).
#[derive(Debug, Error)]
pub enum KeymasterError {
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Sftp(#[from] SftpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl KeymasterError {
    /// Classify this error per the §7 taxonomy, for callers that branch on
    /// category (fleet summaries, retry policy) rather than the exact
    /// variant.
    pub fn category(&self) -> ErrorCategory {
        match self {
            KeymasterError::KeyMaterial(e) => key_material_category(e),
            KeymasterError::Render(_) => ErrorCategory::Config,
            KeymasterError::Trust(_) => ErrorCategory::Trust,
            KeymasterError::Transport(e) => transport_category(e),
            KeymasterError::Sftp(_) => ErrorCategory::Remote,
            KeymasterError::Store(_) => ErrorCategory::Store,
            KeymasterError::Deploy(e) => match e {
                DeployError::Render(_) => ErrorCategory::Config,
                DeployError::Transport(t) => transport_category(t),
                DeployError::Sftp(_) => ErrorCategory::Remote,
                DeployError::Store(_) => ErrorCategory::Store,
                DeployError::NoSuchSystemKey(_) => ErrorCategory::Config,
                DeployError::PassphraseRequiredNonInteractive => ErrorCategory::Auth,
            },
            KeymasterError::Audit(e) => match e {
                AuditError::Render(_) => ErrorCategory::Config,
                AuditError::Transport(t) => transport_category(t),
                AuditError::Sftp(_) => ErrorCategory::Remote,
                AuditError::Store(_) => ErrorCategory::Store,
                AuditError::MalformedHeader => ErrorCategory::Remote,
                AuditError::NoSuchSystemKey(_) => ErrorCategory::Config,
            },
            KeymasterError::Bootstrap(e) => match e {
                BootstrapError::KeyMaterial(ke) => key_material_category(ke),
                BootstrapError::Transport(t) => transport_category(t),
                BootstrapError::Sftp(_) => ErrorCategory::Remote,
                BootstrapError::Store(_) => ErrorCategory::Store,
                BootstrapError::Render(_) => ErrorCategory::Config,
                BootstrapError::SessionNotFound(_) => ErrorCategory::Internal,
                BootstrapError::InvalidTransition { .. } => ErrorCategory::Internal,
                BootstrapError::Expired(_) => ErrorCategory::Internal,
                BootstrapError::HostKeyRejected => ErrorCategory::Trust,
            },
            KeymasterError::Import(e) => match e {
                ImportError::KeyMaterial(ke) => key_material_category(ke),
                ImportError::Transport(t) => transport_category(t),
                ImportError::Sftp(_) => ErrorCategory::Remote,
                ImportError::Store(_) => ErrorCategory::Store,
                ImportError::Render(_) => ErrorCategory::Config,
                ImportError::NoSuchSystemKey(_) => ErrorCategory::Config,
            },
        }
    }

    /// True when the failure is a recoverable passphrase prompt, which per
    /// §7 must always be surfaced to the operator rather than retried.
    pub fn is_passphrase_required(&self) -> bool {
        matches!(self.category(), ErrorCategory::Auth)
            && matches!(
                self,
                KeymasterError::Transport(TransportError::PassphraseRequired)
                    | KeymasterError::KeyMaterial(KeyMaterialError::PassphraseRequired)
                    | KeymasterError::Deploy(DeployError::Transport(TransportError::PassphraseRequired))
                    | KeymasterError::Deploy(DeployError::PassphraseRequiredNonInteractive)
                    | KeymasterError::Audit(AuditError::Transport(TransportError::PassphraseRequired))
                    | KeymasterError::Bootstrap(BootstrapError::Transport(TransportError::PassphraseRequired))
                    | KeymasterError::Import(ImportError::Transport(TransportError::PassphraseRequired))
            )
    }
}

fn key_material_category(e: &KeyMaterialError) -> ErrorCategory {
    match e {
        KeyMaterialError::PassphraseRequired | KeyMaterialError::DecryptionFailed => ErrorCategory::Auth,
        _ => ErrorCategory::Input,
    }
}

fn transport_category(e: &TransportError) -> ErrorCategory {
    match e {
        TransportError::Timeout(_) | TransportError::Refused(_) | TransportError::Other(_) => {
            ErrorCategory::Transport
        }
        TransportError::AuthFailed { .. } | TransportError::PassphraseRequired | TransportError::NoAuthMethod => {
            ErrorCategory::Auth
        }
        TransportError::Trust(_) => ErrorCategory::Trust,
        TransportError::KeyMaterial(_) => ErrorCategory::Input,
    }
}

pub type Result<T> = std::result::Result<T, KeymasterError>;
