//! Secret material handling
//!
//! Secrets never appear on a command line. They are written to a
//! [`SecretFile`] and tools receive the file path (`--key-file`,
//! `--unlock-key-file`, `openssl passwd -in`).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Random bytes in the bootstrap secret (hex-encoded to 128 characters).
pub const BOOTSTRAP_BYTES: usize = 64;

/// Temporary unlock credential used to create and open the container before
/// the recovery credential exists. Revoked once the recovery credential is
/// proven to work.
pub struct BootstrapSecret {
    value: Zeroizing<String>,
}

impl BootstrapSecret {
    /// Generate a fresh secret from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; BOOTSTRAP_BYTES]);
        OsRng.fill_bytes(bytes.as_mut());

        let mut value = Zeroizing::new(String::with_capacity(BOOTSTRAP_BYTES * 2));
        for b in bytes.iter() {
            value.push_str(&format!("{:02x}", b));
        }
        Self { value }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for BootstrapSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BootstrapSecret(<redacted>)")
    }
}

/// RAII wrapper for a temporary key file.
///
/// Created with mode 0600 in a RAM-backed directory. On drop the content is
/// overwritten with zeros and the file is unlinked, including on early
/// return and panic unwinding.
#[derive(Debug)]
pub struct SecretFile {
    path: PathBuf,
    size: usize,
}

impl SecretFile {
    /// Write `secret` to a new key file under `dir`.
    pub fn new(dir: &Path, secret: &str) -> std::io::Result<Self> {
        let suffix = OsRng.next_u64();
        let path = dir.join(format!(".easeinstall-key-{:016x}", suffix));

        // create_new + mode: the file never exists with wider permissions
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        file.write_all(secret.as_bytes())?;
        file.sync_all()?;

        tracing::debug!("SecretFile created: {:?} ({} bytes)", path, secret.len());

        Ok(Self {
            path,
            size: secret.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn secure_wipe(&self) {
        if let Ok(mut file) = OpenOptions::new().write(true).open(&self.path) {
            let zeros = vec![0u8; self.size];
            let _ = file.write_all(&zeros);
            let _ = file.sync_all();
        }

        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove key file {:?}: {}", self.path, e);
        } else {
            tracing::debug!("SecretFile wiped: {:?}", self.path);
        }
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        self.secure_wipe();
    }
}
