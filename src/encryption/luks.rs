//! Typed arguments for `cryptsetup`, `systemd-cryptenroll` and `fuser`.
//!
//! All operations target LUKS2 with secure defaults:
//! - Cipher: aes-xts-plain64 (AES-256)
//! - Key derivation: argon2id
//!
//! Keys are always passed as key file paths produced by
//! [`SecretFile`](super::secret::SecretFile).

use std::path::{Path, PathBuf};

use crate::tool_args::ToolArgs;

/// Device-mapper node for an opened container.
pub fn mapper_path(mapper_name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(mapper_name)
}

/// LUKS cipher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LuksCipher {
    /// AES-256 in XTS mode.
    #[default]
    Aes256Xts,
    Serpent256Xts,
}

impl LuksCipher {
    pub fn as_cipher_str(&self) -> &'static str {
        match self {
            LuksCipher::Aes256Xts => "aes-xts-plain64",
            LuksCipher::Serpent256Xts => "serpent-xts-plain64",
        }
    }

    /// Key size in bits; XTS uses two keys.
    pub fn key_size(&self) -> u32 {
        512
    }
}

impl std::fmt::Display for LuksCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_cipher_str())
    }
}

// ============================================================================
// cryptsetup
// ============================================================================

/// `cryptsetup luksFormat`: creates the container. DESTRUCTIVE.
///
/// | Field      | Flag                 |
/// |------------|----------------------|
/// | `device`   | positional           |
/// | `cipher`   | `--cipher`, `--key-size` |
/// | `key_file` | `--key-file`         |
/// | `label`    | `--label`            |
#[derive(Debug, Clone)]
pub struct LuksFormatArgs {
    pub device: PathBuf,
    pub cipher: LuksCipher,
    pub key_file: PathBuf,
    pub label: Option<String>,
}

impl ToolArgs for LuksFormatArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "luksFormat".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--batch-mode".to_string(),
            "--pbkdf".to_string(),
            "argon2id".to_string(),
            "--cipher".to_string(),
            self.cipher.as_cipher_str().to_string(),
            "--key-size".to_string(),
            self.cipher.key_size().to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
        ];

        if let Some(ref label) = self.label {
            args.push("--label".to_string());
            args.push(label.clone());
        }

        args.push(self.device.display().to_string());
        args
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `cryptsetup open --key-file F DEVICE NAME`
#[derive(Debug, Clone)]
pub struct LuksOpenArgs {
    pub device: PathBuf,
    pub mapper_name: String,
    pub key_file: PathBuf,
}

impl ToolArgs for LuksOpenArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "open".to_string(),
            "--type".to_string(),
            "luks2".to_string(),
            "--key-file".to_string(),
            self.key_file.display().to_string(),
            self.device.display().to_string(),
            self.mapper_name.clone(),
        ]
    }
}

/// `cryptsetup close NAME`
#[derive(Debug, Clone)]
pub struct LuksCloseArgs {
    pub mapper_name: String,
}

impl ToolArgs for LuksCloseArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["close".to_string(), self.mapper_name.clone()]
    }
}

/// `cryptsetup status NAME`: exit 0 iff the mapping is active.
#[derive(Debug, Clone)]
pub struct LuksStatusArgs {
    pub mapper_name: String,
}

impl ToolArgs for LuksStatusArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["status".to_string(), self.mapper_name.clone()]
    }
}

/// `cryptsetup luksUUID DEVICE`
#[derive(Debug, Clone)]
pub struct LuksUuidArgs {
    pub device: PathBuf,
}

impl ToolArgs for LuksUuidArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["luksUUID".to_string(), self.device.display().to_string()]
    }
}

/// `cryptsetup luksRemoveKey --batch-mode DEVICE KEYFILE`
///
/// Removes the key slot unlocked by the key in `key_file`. Destructive in the
/// sense that a wrong call can lock the operator out.
#[derive(Debug, Clone)]
pub struct LuksRemoveKeyArgs {
    pub device: PathBuf,
    pub key_file: PathBuf,
}

impl ToolArgs for LuksRemoveKeyArgs {
    fn program(&self) -> &str {
        "cryptsetup"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "luksRemoveKey".to_string(),
            "--batch-mode".to_string(),
            self.device.display().to_string(),
            self.key_file.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// systemd-cryptenroll
// ============================================================================

/// Bind a TPM2 key slot to the given PCR policy.
#[derive(Debug, Clone)]
pub struct TpmEnrollArgs {
    pub device: PathBuf,
    pub unlock_key_file: PathBuf,
    pub pcrs: String,
}

impl ToolArgs for TpmEnrollArgs {
    fn program(&self) -> &str {
        "systemd-cryptenroll"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            format!("--unlock-key-file={}", self.unlock_key_file.display()),
            "--tpm2-device=auto".to_string(),
            format!("--tpm2-pcrs={}", self.pcrs),
            self.device.display().to_string(),
        ]
    }
}

/// Generate a recovery key slot. The key is printed on stdout.
#[derive(Debug, Clone)]
pub struct RecoveryEnrollArgs {
    pub device: PathBuf,
    pub unlock_key_file: PathBuf,
}

impl ToolArgs for RecoveryEnrollArgs {
    fn program(&self) -> &str {
        "systemd-cryptenroll"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            format!("--unlock-key-file={}", self.unlock_key_file.display()),
            "--recovery-key".to_string(),
            self.device.display().to_string(),
        ]
    }
}

// ============================================================================
// fuser
// ============================================================================

/// `fuser -km TARGET`: kill every process holding the mount or device.
#[derive(Debug, Clone)]
pub struct FuserKillArgs {
    pub target: PathBuf,
}

impl FuserKillArgs {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
        }
    }
}

impl ToolArgs for FuserKillArgs {
    fn program(&self) -> &str {
        "fuser"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-km".to_string(), self.target.display().to_string()]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}
