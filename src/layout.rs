//! Filesystem layout builder
//!
//! Creates the fixed Btrfs subvolume set in the root pool and mounts it,
//! together with the boot partition, under the mount root.
//!
//! [`MountTree`] order is root first, then children, then `/boot`. Every
//! teardown path (enrollment close, rollback, finalization) walks
//! [`MountTree::unmount_order`], the exact reverse.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{InstallError, Result, chain};
use crate::tool_args::ToolArgs;
use crate::tool_runner::{ToolRunner, run_checked};
use crate::types::FilesystemType;

/// Subvolume name → mountpoint relative to the mount root, in mount order.
pub const SUBVOLUMES: [(&str, &str); 4] = [
    ("@", ""),
    ("@home", "home"),
    ("@nix", "nix"),
    ("@var", "var"),
];

/// Options shared by every subvolume mount.
pub const SUBVOLUME_OPTIONS: &str = "compress=zstd,noatime";

/// One mount of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Block device mounted (pool device for subvolumes)
    pub source: PathBuf,
    /// Absolute mountpoint under the mount root
    pub mountpoint: PathBuf,
    pub options: String,
    pub subvolume: Option<String>,
}

/// Ordered mounts making up the target tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTree {
    pub root: PathBuf,
    entries: Vec<MountEntry>,
}

impl MountTree {
    /// The standard tree: four subvolumes of `pool`, then `boot` if any.
    pub fn standard(root: &Path, pool: &Path, boot: Option<&Path>) -> Self {
        let mut entries: Vec<MountEntry> = SUBVOLUMES
            .iter()
            .map(|(subvol, rel)| MountEntry {
                source: pool.to_path_buf(),
                mountpoint: if rel.is_empty() {
                    root.to_path_buf()
                } else {
                    root.join(rel)
                },
                options: format!("{},subvol={}", SUBVOLUME_OPTIONS, subvol),
                subvolume: Some(subvol.to_string()),
            })
            .collect();

        if let Some(boot) = boot {
            entries.push(MountEntry {
                source: boot.to_path_buf(),
                mountpoint: root.join("boot"),
                options: "defaults".to_string(),
                subvolume: None,
            });
        }

        Self {
            root: root.to_path_buf(),
            entries,
        }
    }

    /// Build a tree from arbitrary entries (mount order).
    pub fn from_entries(root: &Path, entries: Vec<MountEntry>) -> Self {
        Self {
            root: root.to_path_buf(),
            entries,
        }
    }

    pub fn mount_order(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Exact reverse of [`mount_order`](Self::mount_order).
    pub fn unmount_order(&self) -> impl Iterator<Item = &MountEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tool arguments
// ============================================================================

/// `mount [-o OPTIONS] SOURCE TARGET`
#[derive(Debug, Clone)]
pub struct MountArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub options: Option<String>,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(ref opts) = self.options {
            args.push("-o".to_string());
            args.push(opts.clone());
        }
        args.push(self.source.display().to_string());
        args.push(self.target.display().to_string());
        args
    }
}

/// `umount TARGET`
#[derive(Debug, Clone)]
pub struct UmountArgs {
    pub target: PathBuf,
}

impl ToolArgs for UmountArgs {
    fn program(&self) -> &str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }
}

/// `mountpoint -q TARGET`: exit 0 iff TARGET is a mountpoint.
#[derive(Debug, Clone)]
pub struct MountpointArgs {
    pub target: PathBuf,
}

impl ToolArgs for MountpointArgs {
    fn program(&self) -> &str {
        "mountpoint"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-q".to_string(), self.target.display().to_string()]
    }
}

/// `btrfs subvolume create PATH`
#[derive(Debug, Clone)]
pub struct SubvolumeCreateArgs {
    pub path: PathBuf,
}

impl ToolArgs for SubvolumeCreateArgs {
    fn program(&self) -> &str {
        "btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "subvolume".to_string(),
            "create".to_string(),
            self.path.display().to_string(),
        ]
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Whether `target` is currently a mountpoint.
pub fn is_mounted(runner: &dyn ToolRunner, target: &Path) -> bool {
    runner
        .run(&MountpointArgs {
            target: target.to_path_buf(),
        })
        .map(|o| o.success)
        .unwrap_or(false)
}

/// Create the subvolume set in a freshly formatted pool.
///
/// The pool's top level is mounted at the mount root only for the duration
/// of the call.
pub fn create_subvolumes(runner: &dyn ToolRunner, pool: &Path, root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;

    run_checked(
        runner,
        &MountArgs {
            source: pool.to_path_buf(),
            target: root.to_path_buf(),
            options: None,
        },
    )
    .map_err(|e| InstallError::layout(chain(&e)))?;

    let created = SUBVOLUMES.iter().try_for_each(|(subvol, _)| {
        run_checked(
            runner,
            &SubvolumeCreateArgs {
                path: root.join(subvol),
            },
        )
        .map(|_| ())
    });

    // Unmount even if a create failed, so the pool is not left mounted.
    let unmounted = run_checked(
        runner,
        &UmountArgs {
            target: root.to_path_buf(),
        },
    );

    created.map_err(|e| InstallError::layout(chain(&e)))?;
    unmounted.map_err(|e| InstallError::layout(chain(&e)))?;

    tracing::info!(
        "Created subvolumes {} on {}",
        SUBVOLUMES.map(|(s, _)| s).join(", "),
        pool.display()
    );
    Ok(())
}

/// Mount every entry in order. Entries already mounted are skipped, so this
/// also serves as the remount after enrollment.
pub fn mount_tree(runner: &dyn ToolRunner, tree: &MountTree) -> Result<()> {
    for entry in tree.mount_order() {
        if is_mounted(runner, &entry.mountpoint) {
            tracing::debug!("{} already mounted", entry.mountpoint.display());
            continue;
        }

        // Child mountpoints are created inside the already mounted parent.
        fs::create_dir_all(&entry.mountpoint)?;

        run_checked(
            runner,
            &MountArgs {
                source: entry.source.clone(),
                target: entry.mountpoint.clone(),
                options: Some(entry.options.clone()),
            },
        )
        .map_err(|e| InstallError::layout(chain(&e)))?;
    }

    tracing::info!("Mounted {} filesystem(s) under {}", tree.len(), tree.root.display());
    Ok(())
}

/// Unmount every entry in reverse order, skipping those not mounted.
///
/// Returns the mountpoints actually unmounted.
pub fn unmount_tree(runner: &dyn ToolRunner, tree: &MountTree) -> anyhow::Result<Vec<PathBuf>> {
    let mut released = Vec::new();
    for entry in tree.unmount_order() {
        if !is_mounted(runner, &entry.mountpoint) {
            continue;
        }
        run_checked(
            runner,
            &UmountArgs {
                target: entry.mountpoint.clone(),
            },
        )?;
        released.push(entry.mountpoint.clone());
    }
    Ok(released)
}

/// Build the layout on a freshly formatted pool: subvolumes, then mounts.
pub fn build(runner: &dyn ToolRunner, tree: &MountTree) -> Result<()> {
    let pool = tree
        .mount_order()
        .first()
        .map(|e| e.source.clone())
        .ok_or_else(|| InstallError::layout("mount tree is empty"))?;

    create_subvolumes(runner, &pool, &tree.root)?;
    mount_tree(runner, tree)
}

/// Filesystem type of the boot mount for a partition, if it gets one.
pub fn boot_is_mounted(fs: FilesystemType) -> bool {
    matches!(fs, FilesystemType::Vfat | FilesystemType::Ext4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tree_order() {
        let tree = MountTree::standard(
            Path::new("/mnt"),
            Path::new("/dev/mapper/cryptroot"),
            Some(Path::new("/dev/sda1")),
        );
        let points: Vec<_> = tree
            .mount_order()
            .iter()
            .map(|e| e.mountpoint.display().to_string())
            .collect();
        assert_eq!(points, vec!["/mnt", "/mnt/home", "/mnt/nix", "/mnt/var", "/mnt/boot"]);
        assert_eq!(
            tree.mount_order()[1].options,
            "compress=zstd,noatime,subvol=@home"
        );
        assert_eq!(tree.mount_order()[4].subvolume, None);
    }

    #[test]
    fn test_unmount_order_is_reverse() {
        let tree = MountTree::standard(Path::new("/mnt"), Path::new("/dev/sda2"), None);
        let down: Vec<_> = tree.unmount_order().map(|e| e.mountpoint.clone()).collect();
        let mut up: Vec<_> = tree.mount_order().iter().map(|e| e.mountpoint.clone()).collect();
        up.reverse();
        assert_eq!(down, up);
        assert_eq!(down.last().map(|p| p.as_path()), Some(Path::new("/mnt")));
    }

    #[test]
    fn test_mount_args() {
        let args = MountArgs {
            source: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/mnt"),
            options: Some("compress=zstd,noatime,subvol=@".to_string()),
        };
        assert_eq!(
            args.describe(),
            "mount -o compress=zstd,noatime,subvol=@ /dev/sda2 /mnt"
        );
    }

    #[test]
    fn test_boot_mount_filesystems() {
        assert!(boot_is_mounted(FilesystemType::Vfat));
        assert!(boot_is_mounted(FilesystemType::Ext4));
        assert!(!boot_is_mounted(FilesystemType::None));
    }
}
