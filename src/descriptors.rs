//! Descriptor files consumed by the materializer
//!
//! Three small JSON documents are written under `<root>/etc/nixos/easy/`:
//!
//! | File               | Content                                   | Written   |
//! |--------------------|-------------------------------------------|-----------|
//! | `credentials.json` | admin user + hash, root hash, hostname    | always    |
//! | `bootloader.json`  | firmware target, GRUB device on BIOS      | always    |
//! | `encryption.json`  | container UUID, mapper, TPM2 binding      | encrypted |
//!
//! Before the materializer runs, [`verify_consistency`] re-reads the tree
//! and checks it against the target.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collector::Identity;
use crate::encryption::EncryptionState;
use crate::error::{InstallError, Result, chain};
use crate::preflight::MANIFEST;
use crate::tool_args::ToolArgs;
use crate::tool_runner::{ToolRunner, run_checked};
use crate::types::{FirmwareMode, InstallTarget};

pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const BOOTLOADER_FILE: &str = "bootloader.json";
pub const ENCRYPTION_FILE: &str = "encryption.json";

/// Where the template is copied, relative to the mount root.
pub const CONFIG_DIR: &str = "etc/nixos";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsDescriptor {
    pub username: String,
    pub password_hash: String,
    pub root_password_hash: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootloaderDescriptor {
    pub firmware: FirmwareMode,
    /// Disk GRUB is installed to (BIOS only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// ESP mountpoint (UEFI only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_mount_point: Option<String>,
}

impl BootloaderDescriptor {
    pub fn for_target(target: &InstallTarget) -> Self {
        match target.firmware() {
            FirmwareMode::Uefi => Self {
                firmware: FirmwareMode::Uefi,
                device: None,
                efi_mount_point: Some("/boot".to_string()),
            },
            FirmwareMode::Bios => Self {
                firmware: FirmwareMode::Bios,
                device: Some(target.device().display().to_string()),
                efi_mount_point: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionDescriptor {
    pub container_uuid: String,
    pub mapper_name: String,
    pub tpm2_enrolled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm2_pcrs: Option<String>,
}

impl From<&EncryptionState> for EncryptionDescriptor {
    fn from(state: &EncryptionState) -> Self {
        Self {
            container_uuid: state.uuid.clone(),
            mapper_name: state.mapper_name.clone(),
            tpm2_enrolled: state.hardware_enrolled,
            tpm2_pcrs: state.pcrs.clone(),
        }
    }
}

/// `nixos-generate-config --root ROOT`
#[derive(Debug, Clone)]
pub struct GenerateConfigArgs {
    pub root: PathBuf,
}

impl ToolArgs for GenerateConfigArgs {
    fn program(&self) -> &str {
        "nixos-generate-config"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--root".to_string(), self.root.display().to_string()]
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    // Remove first so the mode applies even if a stale file exists.
    let _ = fs::remove_file(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| {
        InstallError::descriptor(format!("{} unreadable: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| InstallError::descriptor(format!("{} invalid: {}", path.display(), e)))
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == MANIFEST {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy the configuration template into `<root>/etc/nixos` and, if
/// requested, generate the hardware configuration next to it.
pub fn prepare_tree(
    runner: &dyn ToolRunner,
    template_dir: &Path,
    root: &Path,
    generate_hardware_config: bool,
) -> Result<PathBuf> {
    let config_dir = root.join(CONFIG_DIR);

    if generate_hardware_config {
        run_checked(
            runner,
            &GenerateConfigArgs {
                root: root.to_path_buf(),
            },
        )
        .map_err(|e| InstallError::descriptor(chain(&e)))?;
    }

    // Copied after generation: the template's own files win.
    let copied = copy_tree(template_dir, &config_dir).map_err(|e| {
        InstallError::descriptor(format!(
            "copying {} to {}: {}",
            template_dir.display(),
            config_dir.display(),
            e
        ))
    })?;
    tracing::info!(
        "Copied {} template file(s) into {}",
        copied,
        config_dir.display()
    );
    Ok(config_dir)
}

/// Write every descriptor for this run. Returns the paths written.
pub fn write_descriptors(
    descriptor_dir: &Path,
    target: &InstallTarget,
    identity: &Identity,
    encryption: Option<&EncryptionState>,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(descriptor_dir)?;
    let mut written = Vec::with_capacity(3);

    let credentials = descriptor_dir.join(CREDENTIALS_FILE);
    write_json(
        &credentials,
        &CredentialsDescriptor {
            username: identity.admin_user.clone(),
            password_hash: identity.admin_hash.clone(),
            root_password_hash: identity.root_hash.clone(),
            hostname: identity.hostname.clone(),
        },
        0o600,
    )?;
    written.push(credentials);

    let bootloader = descriptor_dir.join(BOOTLOADER_FILE);
    write_json(&bootloader, &BootloaderDescriptor::for_target(target), 0o644)?;
    written.push(bootloader);

    let enc_path = descriptor_dir.join(ENCRYPTION_FILE);
    match encryption {
        Some(state) => {
            write_json(&enc_path, &EncryptionDescriptor::from(state), 0o644)?;
            written.push(enc_path);
        }
        None => {
            let _ = fs::remove_file(&enc_path);
        }
    }

    tracing::info!("Wrote {} descriptor(s) to {}", written.len(), descriptor_dir.display());
    Ok(written)
}

/// Check the tree is internally consistent before materialization.
pub fn verify_consistency(
    config_dir: &Path,
    descriptor_dir: &Path,
    target: &InstallTarget,
) -> Result<()> {
    let populated = fs::read_dir(config_dir)
        .map(|mut d| d.next().is_some())
        .unwrap_or(false);
    if !populated {
        return Err(InstallError::descriptor(format!(
            "{} is empty or missing",
            config_dir.display()
        )));
    }

    let creds: CredentialsDescriptor = read_json(&descriptor_dir.join(CREDENTIALS_FILE))?;
    if creds.username.is_empty() || creds.hostname.is_empty() {
        return Err(InstallError::descriptor("credentials descriptor is incomplete"));
    }
    if !creds.password_hash.starts_with("$6$") || !creds.root_password_hash.starts_with("$6$") {
        return Err(InstallError::descriptor(
            "credentials descriptor does not hold SHA-512 crypt hashes",
        ));
    }

    let boot: BootloaderDescriptor = read_json(&descriptor_dir.join(BOOTLOADER_FILE))?;
    if boot.firmware != target.firmware() {
        return Err(InstallError::descriptor(format!(
            "bootloader descriptor targets {} but the machine is {}",
            boot.firmware,
            target.firmware()
        )));
    }
    if boot.firmware == FirmwareMode::Bios && boot.device.is_none() {
        return Err(InstallError::descriptor("BIOS bootloader descriptor has no device"));
    }

    let enc_path = descriptor_dir.join(ENCRYPTION_FILE);
    match (target.encryption_requested(), enc_path.exists()) {
        (true, true) => {
            let enc: EncryptionDescriptor = read_json(&enc_path)?;
            if enc.container_uuid.is_empty() {
                return Err(InstallError::descriptor("encryption descriptor has no UUID"));
            }
        }
        (true, false) => {
            return Err(InstallError::descriptor("encryption descriptor missing"));
        }
        (false, true) => {
            return Err(InstallError::descriptor(
                "encryption descriptor present for an unencrypted target",
            ));
        }
        (false, false) => {}
    }

    tracing::debug!("Descriptor tree is consistent");
    Ok(())
}
