//! Type-safe value types shared across the installer
//!
//! Stringly-typed choices (firmware, filesystem, partition role) are enums
//! with strum-derived parsing/display so CLI flags, descriptors and tool
//! arguments all agree on spelling.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

/// Boot firmware the target will be installed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    /// UEFI firmware: GPT with an EFI System Partition
    #[strum(serialize = "uefi", ascii_case_insensitive)]
    Uefi,
    /// Legacy BIOS firmware: GPT with a BIOS boot partition for GRUB core.img
    #[strum(serialize = "bios", ascii_case_insensitive)]
    Bios,
}

impl FirmwareMode {
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }
}

/// Filesystem (or container) type a partition is formatted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum FilesystemType {
    /// Left unformatted (BIOS boot partition)
    None,
    /// FAT32 for the EFI System Partition
    Vfat,
    /// Plain /boot when the root is encrypted on BIOS
    Ext4,
    /// Root pool holding the subvolumes
    Btrfs,
    /// LUKS2 container; Btrfs is created inside the opened mapping
    Luks2,
}

/// What a partition is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    Biosboot,
    Boot,
    Root,
}

impl PartitionRole {
    /// GPT type code passed to `sgdisk --typecode`
    pub fn gpt_typecode(self, firmware: FirmwareMode) -> &'static str {
        match (self, firmware) {
            (Self::Biosboot, _) => "ef02",
            (Self::Boot, FirmwareMode::Uefi) => "ef00",
            (Self::Boot, FirmwareMode::Bios) => "8300",
            (Self::Root, _) => "8300",
        }
    }

    /// GPT partition name / filesystem label
    pub fn label(self) -> &'static str {
        match self {
            Self::Biosboot => "BIOSBOOT",
            Self::Boot => "BOOT",
            Self::Root => "EASEROOT",
        }
    }
}

/// What is being installed where. Built once after confirmation and never
/// modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    device: PathBuf,
    firmware: FirmwareMode,
    encryption_requested: bool,
    hardware_security_available: bool,
}

impl InstallTarget {
    pub fn new(
        device: impl Into<PathBuf>,
        firmware: FirmwareMode,
        encryption_requested: bool,
        hardware_security_available: bool,
    ) -> Self {
        Self {
            device: device.into(),
            firmware,
            encryption_requested,
            hardware_security_available,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn firmware(&self) -> FirmwareMode {
        self.firmware
    }

    pub fn encryption_requested(&self) -> bool {
        self.encryption_requested
    }

    pub fn hardware_security_available(&self) -> bool {
        self.hardware_security_available
    }
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub success: bool,
    /// Transcript on the live system
    pub log_path: PathBuf,
    /// Artifact directory inside the target
    pub generated_artifacts_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_parse_is_case_insensitive() {
        assert_eq!("UEFI".parse::<FirmwareMode>().ok(), Some(FirmwareMode::Uefi));
        assert_eq!("bios".parse::<FirmwareMode>().ok(), Some(FirmwareMode::Bios));
        assert!("coreboot".parse::<FirmwareMode>().is_err());
    }

    #[test]
    fn test_filesystem_display() {
        assert_eq!(FilesystemType::Vfat.to_string(), "vfat");
        assert_eq!(FilesystemType::Luks2.to_string(), "luks2");
    }

    #[test]
    fn test_install_target_accessors() {
        let t = InstallTarget::new("/dev/vda", FirmwareMode::Bios, true, false);
        assert_eq!(t.device(), Path::new("/dev/vda"));
        assert_eq!(t.firmware(), FirmwareMode::Bios);
        assert!(t.encryption_requested());
        assert!(!t.hardware_security_available());
    }

    #[test]
    fn test_typecodes() {
        assert_eq!(PartitionRole::Boot.gpt_typecode(FirmwareMode::Uefi), "ef00");
        assert_eq!(PartitionRole::Boot.gpt_typecode(FirmwareMode::Bios), "8300");
        assert_eq!(PartitionRole::Biosboot.gpt_typecode(FirmwareMode::Bios), "ef02");
    }
}
