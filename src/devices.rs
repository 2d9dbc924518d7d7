//! Block device discovery and naming
//!
//! Lists candidate target disks from `lsblk -J` and derives partition node
//! paths from a disk path.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use crate::tool_args::ToolArgs;
use crate::tool_runner::{ToolRunner, run_checked};

/// Name prefixes of kernel devices that are never install targets.
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram", "sr", "fd"];

/// A disk the operator may install to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub model: String,
    pub size: String,
    pub transport: String,
    /// Carries at least one non-swap filesystem
    pub has_data: bool,
    /// Partition names that carry data, for the warning shown before wiping
    pub data_partitions: Vec<String>,
}

impl BlockDevice {
    /// Render a one-line description for the device menu.
    pub fn describe(&self) -> String {
        let mut traits = vec![self.size.clone()];
        if !self.model.is_empty() {
            traits.push(self.model.clone());
        }
        if !self.transport.is_empty() {
            traits.push(self.transport.clone());
        }
        if self.has_data {
            traits.push(format!("HAS DATA: {}", self.data_partitions.join(", ")));
        } else {
            traits.push("blank".to_string());
        }
        format!("{} ({})", self.path.display(), traits.join(", "))
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Arguments for `lsblk -J -o NAME,TYPE,SIZE,MODEL,TRAN,FSTYPE`.
#[derive(Debug, Clone, Default)]
pub struct LsblkArgs;

impl ToolArgs for LsblkArgs {
    fn program(&self) -> &str {
        "lsblk"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-J".to_string(),
            "-o".to_string(),
            "NAME,TYPE,SIZE,MODEL,TRAN,FSTYPE".to_string(),
        ]
    }
}

/// List candidate install disks.
pub fn list_disks(runner: &dyn ToolRunner) -> Result<Vec<BlockDevice>> {
    let output = run_checked(runner, &LsblkArgs)?;
    parse_lsblk(&output.stdout)
}

/// Parse `lsblk -J` output into install candidates.
pub fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk JSON")?;

    let disks = parsed
        .blockdevices
        .into_iter()
        .filter(|node| node.kind.as_deref() == Some("disk"))
        .filter(|node| !VIRTUAL_PREFIXES.iter().any(|p| node.name.starts_with(p)))
        .map(|node| {
            let data_partitions: Vec<String> = node
                .children
                .iter()
                .filter(|child| {
                    child
                        .fstype
                        .as_deref()
                        .is_some_and(|fs| !fs.is_empty() && fs != "swap")
                })
                .map(|child| child.name.clone())
                .collect();

            BlockDevice {
                path: PathBuf::from(format!("/dev/{}", node.name)),
                model: node.model.unwrap_or_default().trim().to_string(),
                size: node.size.unwrap_or_default(),
                transport: node.tran.unwrap_or_default(),
                has_data: !data_partitions.is_empty(),
                data_partitions,
                name: node.name,
            }
        })
        .collect();

    Ok(disks)
}

/// The disk to preselect: only when exactly one candidate exists and it is blank.
pub fn suggested_disk(disks: &[BlockDevice]) -> Option<&BlockDevice> {
    match disks {
        [only] if !only.has_data => Some(only),
        _ => None,
    }
}

/// Whether `path` exists and is a block special file.
pub fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

/// Generate a partition device path from a disk path and partition number.
///
/// Disks whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop0`) take a
/// `p` separator; others (`sda`, `vdb`) take the number directly.
pub fn partition_path(disk: &Path, partition_num: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, partition_num))
    } else {
        PathBuf::from(format!("{}{}", disk_str, partition_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
       "blockdevices": [
          {"name":"loop0", "type":"loop", "size":"700M", "model":null, "tran":null, "fstype":"squashfs"},
          {"name":"sda", "type":"disk", "size":"64G", "model":"QEMU HARDDISK   ", "tran":"sata", "fstype":null,
             "children": [
                {"name":"sda1", "type":"part", "size":"512M", "model":null, "tran":null, "fstype":"vfat"},
                {"name":"sda2", "type":"part", "size":"2G", "model":null, "tran":null, "fstype":"swap"}
             ]
          },
          {"name":"nvme0n1", "type":"disk", "size":"1T", "model":"Samsung SSD", "tran":"nvme", "fstype":null},
          {"name":"sr0", "type":"rom", "size":"1G", "model":"DVD", "tran":"sata", "fstype":"iso9660"}
       ]
    }"#;

    #[test]
    fn test_parse_lsblk_filters_and_flags_data() {
        let disks = parse_lsblk(SAMPLE).expect("parse");
        assert_eq!(disks.len(), 2);

        assert_eq!(disks[0].path, PathBuf::from("/dev/sda"));
        assert_eq!(disks[0].model, "QEMU HARDDISK");
        assert!(disks[0].has_data);
        assert_eq!(disks[0].data_partitions, vec!["sda1".to_string()]);

        assert_eq!(disks[1].path, PathBuf::from("/dev/nvme0n1"));
        assert!(!disks[1].has_data);
    }

    #[test]
    fn test_suggested_disk_only_single_blank() {
        let disks = parse_lsblk(SAMPLE).expect("parse");
        assert!(suggested_disk(&disks).is_none());
        assert_eq!(
            suggested_disk(&disks[1..]).map(|d| d.name.as_str()),
            Some("nvme0n1")
        );
        assert!(suggested_disk(&disks[..1]).is_none());
    }

    #[test]
    fn test_parse_lsblk_rejects_garbage() {
        assert!(parse_lsblk("not json").is_err());
    }

    #[test]
    fn test_describe_mentions_data() {
        let disks = parse_lsblk(SAMPLE).expect("parse");
        assert!(disks[0].describe().contains("HAS DATA: sda1"));
        assert!(disks[1].describe().contains("blank"));
    }

    #[test]
    fn test_partition_path_sda() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 1), PathBuf::from("/dev/sda1"));
        assert_eq!(partition_path(Path::new("/dev/vdb"), 3), PathBuf::from("/dev/vdb3"));
    }

    #[test]
    fn test_partition_path_nvme_and_mmc() {
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 2),
            PathBuf::from("/dev/nvme0n1p2")
        );
        assert_eq!(
            partition_path(Path::new("/dev/mmcblk0"), 1),
            PathBuf::from("/dev/mmcblk0p1")
        );
    }

    #[test]
    fn test_regular_file_is_not_block_device() {
        assert!(!is_block_device(Path::new("/proc/self/status")));
        assert!(!is_block_device(Path::new("/definitely/missing")));
    }
}
