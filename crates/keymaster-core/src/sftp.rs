//! C6 — SFTP deploy primitive. Atomically replaces `.ssh/authorized_keys`
//! via a write-then-rename-then-backup sequence that degrades safely on
//! SFTP servers without atomic overwrite (restricted shells, Windows
//! OpenSSH). Built on `russh-sftp` against the channel opened by
//! [`crate::transport::Session`].

use std::time::Duration;

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;

use crate::error::SftpError;

const SSH_DIR: &str = ".ssh";
const AUTHORIZED_KEYS: &str = ".ssh/authorized_keys";
const BACKUP_SUFFIX: &str = ".keymaster-bak";

/// Replace the remote `.ssh/authorized_keys` with `content`, per §4.6:
/// 1. ensure `.ssh/` exists, chmod 0700
/// 2. write a namespaced temp file, chmod 0600
/// 3. remove any stale backup
/// 4. rename current -> backup (ignored if absent)
/// 5. rename temp -> current; on failure, restore the backup and remove
///    the temp file, then surface the rename error
/// 6. on success, remove the backup
///
/// The whole sequence is bounded by `timeout` (§4.5's 60s SFTP op budget),
/// so a server that accepts the connection but never answers an SFTP
/// request doesn't block the fleet worker holding it indefinitely.
pub async fn deploy(sftp: &SftpSession, content: &str, timeout: Duration) -> Result<(), SftpError> {
    tokio::time::timeout(timeout, deploy_inner(sftp, content))
        .await
        .map_err(|_| SftpError::Timeout { path: AUTHORIZED_KEYS.to_string() })?
}

async fn deploy_inner(sftp: &SftpSession, content: &str) -> Result<(), SftpError> {
    ensure_ssh_dir(sftp).await?;

    let temp_path = format!("{AUTHORIZED_KEYS}.keymaster.{}", namespaced_timestamp());
    write_file(sftp, &temp_path, content.as_bytes(), 0o600).await?;

    let backup_path = format!("{AUTHORIZED_KEYS}{BACKUP_SUFFIX}");
    let _ = sftp.remove_file(&backup_path).await;

    // Rename current -> backup; absence of a current file is fine.
    let had_current = sftp.rename(AUTHORIZED_KEYS, &backup_path).await.is_ok();

    match sftp.rename(&temp_path, AUTHORIZED_KEYS).await {
        Ok(()) => {
            if had_current {
                let _ = sftp.remove_file(&backup_path).await;
            }
            Ok(())
        }
        Err(e) => {
            if had_current {
                let _ = sftp.rename(&backup_path, AUTHORIZED_KEYS).await;
            }
            let _ = sftp.remove_file(&temp_path).await;
            Err(SftpError::Rename { from: temp_path, to: AUTHORIZED_KEYS.to_string(), source: e.to_string() })
        }
    }
}

/// Read the raw bytes of the remote `.ssh/authorized_keys`, bounded by
/// `timeout`.
pub async fn fetch(sftp: &SftpSession, timeout: Duration) -> Result<Vec<u8>, SftpError> {
    tokio::time::timeout(timeout, fetch_inner(sftp))
        .await
        .map_err(|_| SftpError::Timeout { path: AUTHORIZED_KEYS.to_string() })?
}

async fn fetch_inner(sftp: &SftpSession) -> Result<Vec<u8>, SftpError> {
    use tokio::io::AsyncReadExt;

    let mut file = sftp
        .open_with_flags(AUTHORIZED_KEYS, OpenFlags::READ)
        .await
        .map_err(|e| SftpError::Read { path: AUTHORIZED_KEYS.to_string(), source: e.to_string() })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| SftpError::Read { path: AUTHORIZED_KEYS.to_string(), source: e.to_string() })?;
    Ok(buf)
}

async fn ensure_ssh_dir(sftp: &SftpSession) -> Result<(), SftpError> {
    if sftp.metadata(SSH_DIR).await.is_err() {
        sftp.create_dir(SSH_DIR).await.map_err(|e| SftpError::Write { path: SSH_DIR.to_string(), source: e.to_string() })?;
    }
    sftp.set_metadata(SSH_DIR, russh_sftp::protocol::FileAttributes { permissions: Some(0o700), ..Default::default() })
        .await
        .map_err(|e| SftpError::Chmod { path: SSH_DIR.to_string(), source: e.to_string() })
}

async fn write_file(sftp: &SftpSession, path: &str, content: &[u8], mode: u32) -> Result<(), SftpError> {
    use tokio::io::AsyncWriteExt;

    let mut file = sftp
        .open_with_flags(path, OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE)
        .await
        .map_err(|e| SftpError::Write { path: path.to_string(), source: e.to_string() })?;
    file.write_all(content).await.map_err(|e| SftpError::Write { path: path.to_string(), source: e.to_string() })?;
    file.flush().await.map_err(|e| SftpError::Write { path: path.to_string(), source: e.to_string() })?;
    drop(file);

    sftp.set_metadata(path, russh_sftp::protocol::FileAttributes { permissions: Some(mode), ..Default::default() })
        .await
        .map_err(|e| SftpError::Chmod { path: path.to_string(), source: e.to_string() })
}

/// Nanosecond-resolution timestamp used to namespace the temp upload path,
/// so two concurrent deploys against the same account never collide.
fn namespaced_timestamp() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}
