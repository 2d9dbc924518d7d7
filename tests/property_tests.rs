//! Property-based tests for easeinstall
//!
//! These tests verify:
//! - Partition plans are a pure function of firmware mode and encryption
//! - Unmount order is the exact reverse of mount order
//! - Mounting then unmounting any tree leaves nothing mounted
//! - Partition node naming follows the kernel convention

mod common;

use std::path::{Path, PathBuf};

use proptest::prelude::*;

use common::FakeHost;
use easeinstall::devices::partition_path;
use easeinstall::layout::{self, MountEntry, MountTree};
use easeinstall::{FilesystemType, FirmwareMode, PartitionPlan, PartitionRole, SizeSpec};

fn firmware_strategy() -> impl Strategy<Value = FirmwareMode> {
    prop_oneof![Just(FirmwareMode::Uefi), Just(FirmwareMode::Bios)]
}

/// Distinct nested mountpoints under `/mnt`, parents before children.
fn tree_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("[a-z]{1,6}(/[a-z]{1,6}){0,2}", 0..8)
        .prop_map(|set| set.into_iter().collect())
}

// =============================================================================
// Partition plans
// =============================================================================

proptest! {
    #[test]
    fn plan_is_deterministic(firmware in firmware_strategy(), encrypted in any::<bool>()) {
        prop_assert_eq!(
            PartitionPlan::derive(firmware, encrypted),
            PartitionPlan::derive(firmware, encrypted)
        );
    }

    #[test]
    fn plan_is_well_formed(firmware in firmware_strategy(), encrypted in any::<bool>()) {
        let plan = PartitionPlan::derive(firmware, encrypted);
        prop_assert!(plan.validate().is_ok());

        let root = plan.root().expect("every plan has a root");
        prop_assert_eq!(root.size, SizeSpec::Remainder);
        prop_assert_eq!(
            root.filesystem,
            if encrypted { FilesystemType::Luks2 } else { FilesystemType::Btrfs }
        );

        let numbers: Vec<u32> = plan.partitions.iter().map(|p| p.number).collect();
        let expected: Vec<u32> = (1..=plan.len() as u32).collect();
        prop_assert_eq!(numbers, expected);

        match firmware {
            FirmwareMode::Uefi => {
                prop_assert_eq!(plan.len(), 2);
                prop_assert!(plan.by_role(PartitionRole::Biosboot).is_none());
            }
            FirmwareMode::Bios => {
                prop_assert!(plan.by_role(PartitionRole::Biosboot).is_some());
                prop_assert_eq!(plan.by_role(PartitionRole::Boot).is_some(), encrypted);
            }
        }
    }
}

// =============================================================================
// Mount trees
// =============================================================================

proptest! {
    #[test]
    fn unmount_order_reverses_mount_order(rels in tree_strategy()) {
        let root = Path::new("/mnt");
        let entries: Vec<MountEntry> = rels
            .iter()
            .map(|rel| MountEntry {
                source: PathBuf::from("/dev/vda2"),
                mountpoint: root.join(rel),
                options: String::new(),
                subvolume: None,
            })
            .collect();
        let tree = MountTree::from_entries(root, entries);

        let forward: Vec<&PathBuf> = tree.mount_order().iter().map(|e| &e.mountpoint).collect();
        let mut backward: Vec<&PathBuf> = tree.unmount_order().map(|e| &e.mountpoint).collect();
        backward.reverse();
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn mount_then_unmount_releases_everything(with_boot in any::<bool>()) {
        let host = FakeHost::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("mnt");
        let boot = PathBuf::from("/dev/vda1");
        let tree = MountTree::standard(
            &root,
            Path::new("/dev/vda2"),
            with_boot.then_some(boot.as_path()),
        );

        layout::mount_tree(&host, &tree).expect("mount");
        prop_assert_eq!(host.mounted().len(), tree.len());

        // A second pass finds everything mounted and changes nothing.
        layout::mount_tree(&host, &tree).expect("remount");
        let mounts = host.log.borrow().iter().filter(|l| l.starts_with("mount ")).count();
        prop_assert_eq!(mounts, tree.len());

        let released = layout::unmount_tree(&host, &tree).expect("unmount");
        let expected: Vec<PathBuf> = tree.unmount_order().map(|e| e.mountpoint.clone()).collect();
        prop_assert_eq!(released, expected);
        prop_assert!(host.mounted().is_empty());
    }
}

// =============================================================================
// Partition naming
// =============================================================================

proptest! {
    #[test]
    fn letter_suffixed_disks_take_bare_number(name in "[sv]d[a-z]", n in 1u32..128) {
        let disk = PathBuf::from(format!("/dev/{}", name));
        prop_assert_eq!(partition_path(&disk, n), PathBuf::from(format!("/dev/{}{}", name, n)));
    }

    #[test]
    fn digit_suffixed_disks_take_p_separator(ctrl in 0u32..8, ns in 1u32..4, n in 1u32..128) {
        let disk = PathBuf::from(format!("/dev/nvme{}n{}", ctrl, ns));
        prop_assert_eq!(
            partition_path(&disk, n),
            PathBuf::from(format!("/dev/nvme{}n{}p{}", ctrl, ns, n))
        );
    }
}
