//! Hardware environment detection
//!
//! Detects firmware mode (UEFI vs BIOS), hardware-backed unlock support
//! (TPM 2.0 + secure boot state) and network connectivity. All detection is
//! read-only and never shells out.

use std::fmt;
use std::fs;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::{RetryPolicy, retry};
use crate::types::FirmwareMode;

const EFI_SYSFS: &str = "/sys/firmware/efi";
const SECURE_BOOT_VAR: &str = "SecureBoot-8be4df61-93ca-11d2-aa0d-00e098032b8c";

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

impl NetworkState {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "Online"),
            Self::Offline => write!(f, "Offline"),
        }
    }
}

/// Platform support for hardware-backed unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSecurity {
    /// TPM 2.0 resource manager node, if present
    pub tpm_device: Option<PathBuf>,
    /// Secure boot reported as enabled by the firmware
    pub secure_boot: bool,
}

impl HardwareSecurity {
    pub fn available(&self) -> bool {
        self.tpm_device.is_some()
    }

    /// PCR policy to bind: include PCR 7 only when secure boot state is meaningful.
    pub fn pcrs<'a>(&self, with_secure_boot: &'a str, without: &'a str) -> &'a str {
        if self.secure_boot {
            with_secure_boot
        } else {
            without
        }
    }
}

/// Aggregated hardware detection results.
#[derive(Debug, Clone)]
pub struct HardwareInfo {
    pub firmware: FirmwareMode,
    pub security: HardwareSecurity,
}

impl HardwareInfo {
    /// Detect firmware and hardware security support on the live system.
    pub fn detect(tpm_device: &Path) -> Self {
        let firmware = detect_firmware_mode_at(Path::new(EFI_SYSFS));
        let security = detect_security_at(Path::new(EFI_SYSFS), tpm_device);

        tracing::info!(
            "Hardware detection: firmware={}, tpm={}, secure_boot={}",
            firmware,
            security.available(),
            security.secure_boot
        );

        Self { firmware, security }
    }
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Firmware: {}, TPM2: {}, Secure boot: {}",
            self.firmware,
            if self.security.available() { "yes" } else { "no" },
            if self.security.secure_boot { "on" } else { "off" }
        )
    }
}

/// The kernel exposes the EFI sysfs directory only when booted via UEFI.
pub fn detect_firmware_mode_at(efi_sysfs: &Path) -> FirmwareMode {
    if efi_sysfs.exists() {
        FirmwareMode::Uefi
    } else {
        FirmwareMode::Bios
    }
}

/// TPM presence from the resource manager node; secure boot from efivars.
pub fn detect_security_at(efi_sysfs: &Path, tpm_device: &Path) -> HardwareSecurity {
    let tpm_device = tpm_device.exists().then(|| tpm_device.to_path_buf());

    // efivar layout: 4 attribute bytes followed by the value byte
    let secure_boot = fs::read(efi_sysfs.join("efivars").join(SECURE_BOOT_VAR))
        .map(|bytes| bytes.len() >= 5 && bytes[4] == 1)
        .unwrap_or(false);

    HardwareSecurity {
        tpm_device,
        secure_boot,
    }
}

/// Probe connectivity with a TCP connect, retried per `policy`.
pub fn detect_internet(probe: &str, timeout: Duration, policy: &RetryPolicy) -> NetworkState {
    let result = retry(policy, "connectivity check", |_| {
        let addr = resolve(probe)?;
        TcpStream::connect_timeout(&addr, timeout)
            .map(|_| ())
            .map_err(|e| format!("{}: {}", probe, e))
    });

    match result {
        Ok(()) => {
            tracing::info!("Network connectivity confirmed ({})", probe);
            NetworkState::Online
        }
        Err(e) => {
            tracing::warn!("{}", e);
            NetworkState::Offline
        }
    }
}

fn resolve(probe: &str) -> Result<SocketAddr, String> {
    probe
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {}", probe, e))?
        .next()
        .ok_or_else(|| format!("{} resolved to no addresses", probe))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_firmware_from_sysfs() {
        let dir = tempdir().expect("tempdir");
        let efi = dir.path().join("efi");
        assert_eq!(detect_firmware_mode_at(&efi), FirmwareMode::Bios);
        fs::create_dir(&efi).expect("mkdir");
        assert_eq!(detect_firmware_mode_at(&efi), FirmwareMode::Uefi);
    }

    #[test]
    fn test_security_detection() {
        let dir = tempdir().expect("tempdir");
        let efi = dir.path().join("efi");
        let vars = efi.join("efivars");
        fs::create_dir_all(&vars).expect("mkdir");
        let tpm = dir.path().join("tpmrm0");

        let none = detect_security_at(&efi, &tpm);
        assert!(!none.available());
        assert!(!none.secure_boot);

        fs::write(&tpm, b"").expect("write");
        fs::write(vars.join(SECURE_BOOT_VAR), [6, 0, 0, 0, 1]).expect("write");
        let both = detect_security_at(&efi, &tpm);
        assert!(both.available());
        assert!(both.secure_boot);
        assert_eq!(both.pcrs("0+7", "0"), "0+7");
    }

    #[test]
    fn test_secure_boot_disabled_value() {
        let dir = tempdir().expect("tempdir");
        let vars = dir.path().join("efivars");
        fs::create_dir_all(&vars).expect("mkdir");
        fs::write(vars.join(SECURE_BOOT_VAR), [6, 0, 0, 0, 0]).expect("write");
        let sec = detect_security_at(dir.path(), &dir.path().join("missing"));
        assert!(!sec.secure_boot);
        assert_eq!(sec.pcrs("0+7", "0"), "0");
    }

    #[test]
    fn test_unresolvable_probe_is_offline() {
        let state = detect_internet(
            "invalid host name:443",
            Duration::from_millis(10),
            &RetryPolicy::new(2, 0),
        );
        assert_eq!(state, NetworkState::Offline);
    }

    #[test]
    fn test_network_state_display() {
        assert_eq!(NetworkState::Online.to_string(), "Online");
        assert!(!NetworkState::Offline.is_online());
    }
}
