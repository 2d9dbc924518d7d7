//! Device provisioner
//!
//! Wipes the target, writes a fresh GPT per [`PartitionPlan`], waits for the
//! kernel to publish the partition nodes and formats every partition whose
//! filesystem is created here. An encrypted root is left raw: the container
//! belongs to the enrollment manager.
//!
//! Every failure is fatal and never retried. Only the node wait loops.

use std::path::{Path, PathBuf};

use crate::devices::partition_path;
use crate::engine::storage::{PartitionPlan, PartitionSpec};
use crate::error::{InstallError, Result, chain};
use crate::retry::{RetryPolicy, retry};
use crate::tool_args::ToolArgs;
use crate::tool_runner::{ToolRunner, run_checked};
use crate::types::{FilesystemType, FirmwareMode, PartitionRole};

// ============================================================================
// Tool arguments
// ============================================================================

/// `wipefs --all DEVICE`. DESTRUCTIVE.
#[derive(Debug, Clone)]
pub struct WipefsArgs {
    pub device: PathBuf,
}

impl ToolArgs for WipefsArgs {
    fn program(&self) -> &str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--all".to_string(), self.device.display().to_string()]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `sgdisk --zap-all DEVICE`. DESTRUCTIVE.
#[derive(Debug, Clone)]
pub struct ZapArgs {
    pub device: PathBuf,
}

impl ToolArgs for ZapArgs {
    fn program(&self) -> &str {
        "sgdisk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--zap-all".to_string(), self.device.display().to_string()]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// One `sgdisk --new/--typecode/--change-name` call per partition.
#[derive(Debug, Clone)]
pub struct CreatePartitionArgs {
    pub device: PathBuf,
    pub spec: PartitionSpec,
    pub firmware: FirmwareMode,
}

impl ToolArgs for CreatePartitionArgs {
    fn program(&self) -> &str {
        "sgdisk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let n = self.spec.number;
        vec![
            format!("--new={}:0:{}", n, self.spec.size.sgdisk_end()),
            format!(
                "--typecode={}:{}",
                n,
                self.spec.role.gpt_typecode(self.firmware)
            ),
            format!("--change-name={}:{}", n, self.spec.role.label()),
            self.device.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `partprobe DEVICE`
#[derive(Debug, Clone)]
pub struct PartprobeArgs {
    pub device: PathBuf,
}

impl ToolArgs for PartprobeArgs {
    fn program(&self) -> &str {
        "partprobe"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

/// `udevadm settle`
#[derive(Debug, Clone, Default)]
pub struct SettleArgs;

impl ToolArgs for SettleArgs {
    fn program(&self) -> &str {
        "udevadm"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["settle".to_string(), "--timeout=10".to_string()]
    }
}

/// `mkfs.<fs>` for one partition or mapping. DESTRUCTIVE.
#[derive(Debug, Clone)]
pub struct MkfsArgs {
    pub device: PathBuf,
    pub filesystem: FilesystemType,
    pub label: String,
}

impl ToolArgs for MkfsArgs {
    fn program(&self) -> &str {
        match self.filesystem {
            FilesystemType::Vfat => "mkfs.vfat",
            FilesystemType::Ext4 => "mkfs.ext4",
            _ => "mkfs.btrfs",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        let device = self.device.display().to_string();
        match self.filesystem {
            FilesystemType::Vfat => vec![
                "-F".to_string(),
                "32".to_string(),
                "-n".to_string(),
                self.label.clone(),
                device,
            ],
            FilesystemType::Ext4 => vec![
                "-F".to_string(),
                "-L".to_string(),
                self.label.clone(),
                device,
            ],
            _ => vec![
                "-f".to_string(),
                "-L".to_string(),
                self.label.clone(),
                device,
            ],
        }
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

// ============================================================================
// Provisioning
// ============================================================================

/// Partition nodes produced by provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDisk {
    pub device: PathBuf,
    pub boot: Option<(PathBuf, FilesystemType)>,
    /// Root partition: a Btrfs pool, or a raw partition awaiting LUKS
    pub root: PathBuf,
}

fn fail(what: &str, e: anyhow::Error) -> InstallError {
    InstallError::provisioning(format!("{}: {}", what, chain(&e)))
}

/// Format a device as the Btrfs root pool.
pub fn format_pool(runner: &dyn ToolRunner, device: &Path) -> Result<()> {
    run_checked(
        runner,
        &MkfsArgs {
            device: device.to_path_buf(),
            filesystem: FilesystemType::Btrfs,
            label: PartitionRole::Root.label().to_string(),
        },
    )
    .map_err(|e| fail("formatting root pool", e))?;
    Ok(())
}

/// Run the full provisioning sequence against `device`.
pub fn provision(
    runner: &dyn ToolRunner,
    device: &Path,
    plan: &PartitionPlan,
    settle: &RetryPolicy,
) -> Result<ProvisionedDisk> {
    plan.validate().map_err(InstallError::provisioning)?;

    tracing::warn!("Wiping {}", device.display());
    run_checked(runner, &WipefsArgs { device: device.to_path_buf() })
        .map_err(|e| fail("wiping signatures", e))?;
    run_checked(runner, &ZapArgs { device: device.to_path_buf() })
        .map_err(|e| fail("clearing partition table", e))?;

    for spec in &plan.partitions {
        run_checked(
            runner,
            &CreatePartitionArgs {
                device: device.to_path_buf(),
                spec: *spec,
                firmware: plan.firmware,
            },
        )
        .map_err(|e| fail(&format!("creating {} partition", spec.role), e))?;
    }

    run_checked(runner, &PartprobeArgs { device: device.to_path_buf() })
        .map_err(|e| fail("re-reading partition table", e))?;

    let nodes: Vec<PathBuf> = plan
        .partitions
        .iter()
        .map(|p| partition_path(device, p.number))
        .collect();
    wait_for_nodes(runner, &nodes, settle)?;

    let mut boot = None;
    let mut root = None;
    for (spec, node) in plan.partitions.iter().zip(&nodes) {
        match (spec.role, spec.filesystem) {
            (_, FilesystemType::None) => {}
            (PartitionRole::Root, FilesystemType::Luks2) => {}
            (PartitionRole::Root, _) => format_pool(runner, node)?,
            (role, fs) => {
                run_checked(
                    runner,
                    &MkfsArgs {
                        device: node.clone(),
                        filesystem: fs,
                        label: role.label().to_string(),
                    },
                )
                .map_err(|e| fail(&format!("formatting {} as {}", node.display(), fs), e))?;
            }
        }

        match spec.role {
            PartitionRole::Boot => boot = Some((node.clone(), spec.filesystem)),
            PartitionRole::Root => root = Some(node.clone()),
            PartitionRole::Biosboot => {}
        }
    }

    let root = root.ok_or_else(|| InstallError::provisioning("plan has no root partition"))?;
    tracing::info!(
        "Provisioned {} with {} partition(s)",
        device.display(),
        plan.len()
    );

    Ok(ProvisionedDisk {
        device: device.to_path_buf(),
        boot,
        root,
    })
}

/// Poll until every node is a block device, settling udev between attempts.
fn wait_for_nodes(runner: &dyn ToolRunner, nodes: &[PathBuf], settle: &RetryPolicy) -> Result<()> {
    retry(settle, "waiting for partition nodes", |_| {
        // settle failure is not fatal by itself; the node check decides
        let _ = runner.run(&SettleArgs);
        match nodes.iter().find(|n| !runner.is_block_device(n)) {
            Some(missing) => Err(format!("{} has not appeared", missing.display())),
            None => Ok(()),
        }
    })
    .map_err(|e| InstallError::provisioning(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::SizeSpec;

    #[test]
    fn test_create_partition_args() {
        let args = CreatePartitionArgs {
            device: PathBuf::from("/dev/sda"),
            spec: PartitionSpec {
                number: 1,
                role: PartitionRole::Boot,
                size: SizeSpec::MiB(1024),
                filesystem: FilesystemType::Vfat,
            },
            firmware: FirmwareMode::Uefi,
        };
        assert_eq!(
            args.to_cli_args(),
            vec!["--new=1:0:+1024M", "--typecode=1:ef00", "--change-name=1:BOOT", "/dev/sda"]
        );
        assert!(args.is_destructive());
    }

    #[test]
    fn test_mkfs_program_per_filesystem() {
        let mk = |fs| MkfsArgs {
            device: PathBuf::from("/dev/sda1"),
            filesystem: fs,
            label: "X".to_string(),
        };
        assert_eq!(mk(FilesystemType::Vfat).program(), "mkfs.vfat");
        assert_eq!(mk(FilesystemType::Ext4).program(), "mkfs.ext4");
        assert_eq!(mk(FilesystemType::Btrfs).program(), "mkfs.btrfs");
        assert_eq!(
            mk(FilesystemType::Vfat).to_cli_args(),
            vec!["-F", "32", "-n", "X", "/dev/sda1"]
        );
    }

    #[test]
    fn test_wipe_tools_are_destructive() {
        let dev = PathBuf::from("/dev/sda");
        assert!(WipefsArgs { device: dev.clone() }.is_destructive());
        assert!(ZapArgs { device: dev.clone() }.is_destructive());
        assert!(!PartprobeArgs { device: dev }.is_destructive());
    }
}
