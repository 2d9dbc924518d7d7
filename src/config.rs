//! Installer configuration file handling.
//!
//! The configuration describes the live environment the installer runs in
//! (mount root, scratch paths, tool choices, retry budgets), not the system
//! being installed. Every field has a default so an empty `{}` file, or no
//! file at all, yields a working production configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "EASEOS_INSTALLER_CONFIG";

/// Installer configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    // Live environment paths
    pub mount_root: PathBuf,
    pub transcript_path: PathBuf,
    /// Where key files are created; must be RAM-backed
    pub secrets_dir: PathBuf,
    /// Materializer configuration copied into the target
    pub template_dir: PathBuf,

    // Paths inside the target, relative to the mount root
    pub recovery_key_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub descriptor_dir: PathBuf,
    pub transcript_target_path: PathBuf,

    // Encryption
    pub mapper_name: String,
    pub tpm_device: PathBuf,
    /// PCRs bound when secure boot is enabled
    pub tpm_pcrs_secure_boot: String,
    /// PCRs bound when secure boot is disabled
    pub tpm_pcrs: String,

    // Materializer
    pub materializer_program: String,
    /// `{root}` is replaced with the mount root
    pub materializer_args: Vec<String>,
    pub generate_hardware_config: bool,

    // Preflight
    pub connectivity_probe: String,
    pub connectivity_timeout_secs: u64,

    // Bounded waits
    pub settle_retry: RetryPolicy,
    pub close_retry: RetryPolicy,
    pub connectivity_retry: RetryPolicy,
    /// Close attempt from which holders of the mapping are killed
    pub close_escalate_after: u32,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt"),
            transcript_path: PathBuf::from("/tmp/easyos-install.log"),
            secrets_dir: PathBuf::from("/tmp"),
            template_dir: PathBuf::from("/etc/easy/config"),
            recovery_key_path: PathBuf::from("etc/easy/recovery-key.txt"),
            artifact_dir: PathBuf::from("var/lib/easyos/install"),
            descriptor_dir: PathBuf::from("etc/nixos/easy"),
            transcript_target_path: PathBuf::from("var/log/easyos-install.log"),
            mapper_name: "cryptroot".to_string(),
            tpm_device: PathBuf::from("/dev/tpmrm0"),
            tpm_pcrs_secure_boot: "0+7".to_string(),
            tpm_pcrs: "0".to_string(),
            materializer_program: "nixos-install".to_string(),
            materializer_args: vec![
                "--root".to_string(),
                "{root}".to_string(),
                "--no-root-passwd".to_string(),
                "--no-channel-copy".to_string(),
                "--flake".to_string(),
                "{root}/etc/nixos#easeos".to_string(),
            ],
            generate_hardware_config: true,
            connectivity_probe: "1.1.1.1:443".to_string(),
            connectivity_timeout_secs: 5,
            settle_retry: RetryPolicy::new(10, 1000),
            close_retry: RetryPolicy::new(10, 1000),
            connectivity_retry: RetryPolicy::new(3, 2000),
            close_escalate_after: 3,
        }
    }
}

impl InstallerConfig {
    /// Load from `explicit`, else from `$EASEOS_INSTALLER_CONFIG`, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.mount_root.is_absolute() {
            anyhow::bail!("mount_root must be an absolute path");
        }
        if !self.secrets_dir.is_absolute() {
            anyhow::bail!("secrets_dir must be an absolute path");
        }

        for (name, path) in [
            ("recovery_key_path", &self.recovery_key_path),
            ("artifact_dir", &self.artifact_dir),
            ("descriptor_dir", &self.descriptor_dir),
            ("transcript_target_path", &self.transcript_target_path),
        ] {
            if path.is_absolute() {
                anyhow::bail!("{} must be relative to the mount root", name);
            }
            if path.as_os_str().is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }

        if self.mapper_name.is_empty()
            || !self
                .mapper_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("mapper_name must be a non-empty [A-Za-z0-9_-] identifier");
        }

        for (name, pcrs) in [
            ("tpm_pcrs", &self.tpm_pcrs),
            ("tpm_pcrs_secure_boot", &self.tpm_pcrs_secure_boot),
        ] {
            if pcrs.is_empty()
                || !pcrs
                    .split('+')
                    .all(|p| p.parse::<u8>().map(|n| n < 24).unwrap_or(false))
            {
                anyhow::bail!("{} must look like \"0+7\" (PCR indices 0-23)", name);
            }
        }

        if self.materializer_program.trim().is_empty() {
            anyhow::bail!("materializer_program must be specified");
        }

        for (name, policy) in [
            ("settle_retry", &self.settle_retry),
            ("close_retry", &self.close_retry),
            ("connectivity_retry", &self.connectivity_retry),
        ] {
            if policy.attempts == 0 || policy.attempts > 60 {
                anyhow::bail!("{}.attempts must be between 1 and 60", name);
            }
        }

        Ok(())
    }

    /// Materializer arguments with `{root}` substituted.
    pub fn materializer_args_for(&self, root: &Path) -> Vec<String> {
        let root = root.display().to_string();
        self.materializer_args
            .iter()
            .map(|a| a.replace("{root}", &root))
            .collect()
    }

    /// Absolute location of a target-relative path under the mount root.
    pub fn in_target(&self, relative: &Path) -> PathBuf {
        self.mount_root.join(relative)
    }
}
