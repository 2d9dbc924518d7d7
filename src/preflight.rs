//! Preflight checks
//!
//! Verifies the live environment before anything is asked or touched:
//! - Running with root privileges (EUID 0)
//! - Required tools are on `PATH`
//! - The network is reachable (the materializer fetches from it)
//! - The configuration template tree is present and matches its
//!   `SHA256SUMS` manifest, if it carries one
//!
//! Any failure aborts the run with a report naming the packages to add.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::InstallerConfig;
use crate::error::{InstallError, Result};
use crate::hardware::{NetworkState, detect_internet};

/// Manifest file checked inside the template directory.
pub const MANIFEST: &str = "SHA256SUMS";

/// Set to `1` or `true` to skip the root check during development.
pub const SKIP_ROOT_ENV: &str = "EASEOS_SKIP_ROOT_CHECK";

/// Tools every install needs.
const REQUIRED_BINARIES: &[&str] = &[
    "wipefs",
    "sgdisk",
    "partprobe",
    "udevadm",
    "mkfs.vfat",
    "mkfs.ext4",
    "mkfs.btrfs",
    "btrfs",
    "mount",
    "umount",
    "mountpoint",
    "lsblk",
    "openssl",
    "fuser",
];

/// Tools needed only when the disk may be encrypted.
const ENCRYPTION_BINARIES: &[&str] = &["cryptsetup", "systemd-cryptenroll"];

/// What to check.
#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    pub skip_root: bool,
    pub check_network: bool,
    pub check_encryption_tools: bool,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            skip_root: should_skip_root_check(),
            check_network: true,
            check_encryption_tools: true,
        }
    }
}

/// Result of environment verification
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub is_root: bool,
    pub missing_binaries: Vec<String>,
    pub network: NetworkState,
    pub integrity_errors: Vec<String>,
}

impl PreflightReport {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.is_root
            && self.missing_binaries.is_empty()
            && self.network.is_online()
            && self.integrity_errors.is_empty()
    }

    /// Operator-facing report of every failed check.
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        out.push("Preflight check failed".to_string());
        out.push(String::new());

        if !self.is_root {
            out.push("ERROR: root privileges required".to_string());
            out.push("   Run the installer with sudo or as root.".to_string());
            out.push(String::new());
        }

        if !self.missing_binaries.is_empty() {
            out.push("ERROR: missing required tools".to_string());
            for binary in &self.missing_binaries {
                out.push(format!("   • {} (package: {})", binary, package_for_binary(binary)));
            }
            let mut packages: Vec<&str> = self
                .missing_binaries
                .iter()
                .map(|b| package_for_binary(b))
                .collect();
            packages.sort_unstable();
            packages.dedup();
            out.push(format!("   Add to the live image: {}", packages.join(" ")));
            out.push(String::new());
        }

        if !self.network.is_online() {
            out.push("ERROR: no network connectivity".to_string());
            out.push("   Connect a cable or join a wireless network, then retry.".to_string());
            out.push(String::new());
        }

        if !self.integrity_errors.is_empty() {
            out.push("ERROR: installer files are damaged".to_string());
            for err in &self.integrity_errors {
                out.push(format!("   • {}", err));
            }
            out.push("   Re-download or re-flash the installer image.".to_string());
            out.push(String::new());
        }

        out.join("\n")
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(InstallError::preflight(self.render()))
        }
    }
}

/// Whether `name` resolves to an executable file on `PATH`.
pub fn binary_exists(name: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path).any(|dir| {
        fs::metadata(dir.join(name))
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Skip root check (for development/testing)
pub fn should_skip_root_check() -> bool {
    env::var(SKIP_ROOT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Map binary names to the packages that ship them.
fn package_for_binary(binary: &str) -> &'static str {
    match binary {
        "wipefs" | "partprobe" | "mount" | "umount" | "mountpoint" | "lsblk" => "util-linux",
        "sgdisk" => "gptfdisk",
        "udevadm" | "systemd-cryptenroll" => "systemd",
        "mkfs.vfat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.btrfs" | "btrfs" => "btrfs-progs",
        "openssl" => "openssl",
        "fuser" => "psmisc",
        "cryptsetup" => "cryptsetup",
        "nixos-install" | "nixos-generate-config" => "nixos-install-tools",
        _ => "unknown",
    }
}

/// Every binary this configuration will call.
pub fn required_binaries(config: &InstallerConfig, with_encryption: bool) -> Vec<String> {
    let mut bins: Vec<String> = REQUIRED_BINARIES.iter().map(|s| s.to_string()).collect();
    if with_encryption {
        bins.extend(ENCRYPTION_BINARIES.iter().map(|s| s.to_string()));
    }
    bins.push(config.materializer_program.clone());
    if config.generate_hardware_config {
        bins.push("nixos-generate-config".to_string());
    }
    bins
}

/// Check the template tree against its manifest.
///
/// Manifest lines are `<sha256 hex>  <relative path>` (the `sha256sum`
/// output format); a leading `*` on the path is ignored.
pub fn verify_template(dir: &Path) -> Vec<String> {
    if !dir.is_dir() {
        return vec![format!("{} is missing", dir.display())];
    }

    let manifest = dir.join(MANIFEST);
    let content = match fs::read_to_string(&manifest) {
        Ok(c) => c,
        Err(_) => {
            tracing::debug!("No {} in {}, skipping hash check", MANIFEST, dir.display());
            return Vec::new();
        }
    };

    let mut errors = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((expected, rel)) = line.split_once(char::is_whitespace) else {
            errors.push(format!("{} line {} is malformed", MANIFEST, lineno + 1));
            continue;
        };
        let rel = rel.trim_start().trim_start_matches('*');
        let path: PathBuf = dir.join(rel);

        match fs::read(&path) {
            Ok(bytes) => {
                let actual = format!("{:x}", Sha256::digest(&bytes));
                if !actual.eq_ignore_ascii_case(expected) {
                    errors.push(format!("{} does not match its checksum", rel));
                }
            }
            Err(e) => errors.push(format!("{}: {}", rel, e)),
        }
    }
    errors
}

/// Run every check.
pub fn run(config: &InstallerConfig, opts: PreflightOptions) -> PreflightReport {
    tracing::debug!("Running preflight checks ({:?})", opts);

    let is_root = if opts.skip_root {
        tracing::warn!("Root check skipped ({}=1)", SKIP_ROOT_ENV);
        true
    } else {
        is_running_as_root()
    };

    let missing_binaries = required_binaries(config, opts.check_encryption_tools)
        .into_iter()
        .filter(|b| !binary_exists(b))
        .collect();

    let network = if opts.check_network {
        detect_internet(
            &config.connectivity_probe,
            Duration::from_secs(config.connectivity_timeout_secs),
            &config.connectivity_retry,
        )
    } else {
        NetworkState::Online
    };

    let integrity_errors = verify_template(&config.template_dir);

    let report = PreflightReport {
        is_root,
        missing_binaries,
        network,
        integrity_errors,
    };
    if report.is_ok() {
        tracing::info!("Preflight checks passed");
    }
    report
}
