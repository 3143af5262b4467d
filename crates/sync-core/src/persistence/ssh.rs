//! Materializes an SSH private key (read from the `SSH_PRIVATE_KEY`
//! environment variable, PEM-encoded) into a 0600 temporary file for the
//! lifetime of the process, and builds the `GIT_SSH_COMMAND` override that
//! points `ssh` at it. Host-key checking is disabled: these are short-lived
//! deploy keys, not long-lived operator deploy targets worth the friction
//! of a known_hosts dance.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Owns the lifetime of a materialized private key file; removes it on
/// drop so the PEM never outlives the process.
pub struct SshKeyGuard {
    key_path: Option<PathBuf>,
}

impl SshKeyGuard {
    /// Reads `SSH_PRIVATE_KEY` from the environment and writes it to a
    /// fresh 0600 temp file. Returns `None` (with a warning) if the
    /// variable is absent — absence is non-fatal, per §6: push will simply
    /// fail gracefully later.
    pub fn from_env() -> Self {
        match std::env::var("SSH_PRIVATE_KEY") {
            Ok(pem) if !pem.trim().is_empty() => match Self::write_key(&pem) {
                Ok(path) => SshKeyGuard {
                    key_path: Some(path),
                },
                Err(e) => {
                    warn!("failed to materialize SSH_PRIVATE_KEY: {e}");
                    SshKeyGuard { key_path: None }
                }
            },
            _ => {
                warn!("SSH_PRIVATE_KEY not set; git push over ssh will fail");
                SshKeyGuard { key_path: None }
            }
        }
    }

    fn write_key(pem: &str) -> std::io::Result<PathBuf> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("relay-sync-deploy-key-{}.pem", std::process::id()));
        let mut file = fs::File::create(&path)?;
        file.write_all(pem.as_bytes())?;
        if !pem.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        set_owner_only(&path)?;
        Ok(path)
    }

    /// The `GIT_SSH_COMMAND` value to set on a single git subprocess
    /// invocation — never on the process-wide environment, so no mutex is
    /// needed beyond the per-repo git lock (see §9's design note).
    pub fn ssh_command(&self) -> Option<String> {
        let path = self.key_path.as_ref()?;
        Some(format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            shell_quote(path)
        ))
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

impl Drop for SshKeyGuard {
    fn drop(&mut self) {
        if let Some(path) = self.key_path.take() {
            let _ = fs::remove_file(path);
        }
    }
}
