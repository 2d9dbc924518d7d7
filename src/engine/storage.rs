//! Partition plan engine
//!
//! Translates `FirmwareMode × encryption` into an ordered [`PartitionPlan`].
//!
//! | Firmware | Encrypted | Partitions                                   |
//! |----------|-----------|----------------------------------------------|
//! | UEFI     | no        | boot (ESP, vfat) → root (btrfs)              |
//! | UEFI     | yes       | boot (ESP, vfat) → root (luks2)              |
//! | BIOS     | no        | biosboot (raw) → root (btrfs)                |
//! | BIOS     | yes       | biosboot (raw) → boot (ext4) → root (luks2)  |
//!
//! BIOS + encryption needs a plain `/boot` because the legacy GRUB stage
//! cannot read a LUKS2 header. Root always takes the remainder of the disk
//! and is always the last partition.
//!
//! # Design
//!
//! - **Pure logic**: no I/O, the same inputs always yield the same plan
//! - **Typed output**: roles, sizes and filesystem types are enums/values
//! - **Validated**: `validate()` checks the invariants the provisioner relies on

use std::fmt;
use std::path::Path;

use crate::devices::partition_path;
use crate::types::{FilesystemType, FirmwareMode, PartitionRole};

/// Partition size in the form `sgdisk --new` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    MiB(u32),
    /// Remaining space on the disk
    Remainder,
}

impl SizeSpec {
    /// `sgdisk --new=N:0:<end>` end field.
    pub fn sgdisk_end(self) -> String {
        match self {
            Self::MiB(n) => format!("+{}M", n),
            Self::Remainder => "0".to_string(),
        }
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MiB(n) => write!(f, "{} MiB", n),
            Self::Remainder => write!(f, "rest of disk"),
        }
    }
}

/// One entry of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    /// 1-based partition index on the disk
    pub number: u32,
    pub role: PartitionRole,
    pub size: SizeSpec,
    pub filesystem: FilesystemType,
}

/// Ordered partition plan for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub firmware: FirmwareMode,
    pub encrypted: bool,
    pub partitions: Vec<PartitionSpec>,
}

pub const BIOSBOOT_MIB: u32 = 1;
pub const ESP_MIB: u32 = 1024;
pub const BIOS_BOOT_FS_MIB: u32 = 1024;

impl PartitionPlan {
    /// Derive the plan for a firmware mode and encryption choice.
    pub fn derive(firmware: FirmwareMode, encrypted: bool) -> Self {
        let root_fs = if encrypted {
            FilesystemType::Luks2
        } else {
            FilesystemType::Btrfs
        };

        let mut layout: Vec<(PartitionRole, SizeSpec, FilesystemType)> = Vec::with_capacity(3);
        match firmware {
            FirmwareMode::Uefi => {
                layout.push((PartitionRole::Boot, SizeSpec::MiB(ESP_MIB), FilesystemType::Vfat));
            }
            FirmwareMode::Bios => {
                layout.push((
                    PartitionRole::Biosboot,
                    SizeSpec::MiB(BIOSBOOT_MIB),
                    FilesystemType::None,
                ));
                if encrypted {
                    layout.push((
                        PartitionRole::Boot,
                        SizeSpec::MiB(BIOS_BOOT_FS_MIB),
                        FilesystemType::Ext4,
                    ));
                }
            }
        }
        layout.push((PartitionRole::Root, SizeSpec::Remainder, root_fs));

        let partitions = layout
            .into_iter()
            .zip(1u32..)
            .map(|((role, size, filesystem), number)| PartitionSpec {
                number,
                role,
                size,
                filesystem,
            })
            .collect();

        Self {
            firmware,
            encrypted,
            partitions,
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// The partition with the given role, if planned.
    pub fn by_role(&self, role: PartitionRole) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.role == role)
    }

    /// The root partition (always present).
    pub fn root(&self) -> Option<&PartitionSpec> {
        self.by_role(PartitionRole::Root)
    }

    /// Check the invariants the provisioner relies on.
    pub fn validate(&self) -> Result<(), String> {
        let last = self.partitions.last().ok_or("plan has no partitions")?;
        if last.role != PartitionRole::Root || last.size != SizeSpec::Remainder {
            return Err("root must be the last partition and take the remainder".into());
        }
        for (i, p) in self.partitions.iter().enumerate() {
            if p.number as usize != i + 1 {
                return Err(format!("partition {} is numbered {}", i + 1, p.number));
            }
            if p.size == SizeSpec::Remainder && p.role != PartitionRole::Root {
                return Err(format!("{} must have a fixed size", p.role));
            }
        }
        if self.firmware.is_uefi() != self.by_role(PartitionRole::Biosboot).is_none() {
            return Err("BIOS boot partition present iff firmware is BIOS".into());
        }
        if self.encrypted != (last.filesystem == FilesystemType::Luks2) {
            return Err("root filesystem does not match the encryption choice".into());
        }
        Ok(())
    }

    /// Human-readable summary for the confirmation screen and `plan` command.
    pub fn summary(&self, disk: &Path) -> String {
        let mut lines = vec![
            format!("Partition plan for {}", disk.display()),
            format!("  Firmware: {}", self.firmware),
            format!("  Encrypted: {}", if self.encrypted { "yes" } else { "no" }),
            format!("  Partitions ({}):", self.partitions.len()),
        ];
        for p in &self.partitions {
            lines.push(format!(
                "    {}  {:<8} {:<13} {}",
                partition_path(disk, p.number).display(),
                p.role,
                p.size,
                p.filesystem
            ));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uefi_plain_has_boot_and_root() {
        let plan = PartitionPlan::derive(FirmwareMode::Uefi, false);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.partitions[0].role, PartitionRole::Boot);
        assert_eq!(plan.partitions[0].filesystem, FilesystemType::Vfat);
        assert_eq!(plan.partitions[1].role, PartitionRole::Root);
        assert_eq!(plan.partitions[1].filesystem, FilesystemType::Btrfs);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_uefi_encrypted_root_is_luks() {
        let plan = PartitionPlan::derive(FirmwareMode::Uefi, true);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.root().map(|p| p.filesystem), Some(FilesystemType::Luks2));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_bios_plain_has_biosboot_first() {
        let plan = PartitionPlan::derive(FirmwareMode::Bios, false);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.partitions[0].role, PartitionRole::Biosboot);
        assert_eq!(plan.partitions[0].filesystem, FilesystemType::None);
        assert!(plan.by_role(PartitionRole::Boot).is_none());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_bios_encrypted_gets_plain_boot() {
        let plan = PartitionPlan::derive(FirmwareMode::Bios, true);
        let roles: Vec<_> = plan.partitions.iter().map(|p| p.role).collect();
        assert_eq!(
            roles,
            vec![PartitionRole::Biosboot, PartitionRole::Boot, PartitionRole::Root]
        );
        assert_eq!(
            plan.by_role(PartitionRole::Boot).map(|p| p.filesystem),
            Some(FilesystemType::Ext4)
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_misordered_root() {
        let mut plan = PartitionPlan::derive(FirmwareMode::Uefi, false);
        plan.partitions.swap(0, 1);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_sgdisk_end() {
        assert_eq!(SizeSpec::MiB(1024).sgdisk_end(), "+1024M");
        assert_eq!(SizeSpec::Remainder.sgdisk_end(), "0");
    }

    #[test]
    fn test_summary_lists_partition_nodes() {
        let plan = PartitionPlan::derive(FirmwareMode::Uefi, true);
        let summary = plan.summary(Path::new("/dev/nvme0n1"));
        assert!(summary.contains("/dev/nvme0n1p1"));
        assert!(summary.contains("/dev/nvme0n1p2"));
        assert!(summary.contains("luks2"));
    }
}
