//! Rollback controller
//!
//! Releases everything the install holds: mounts below the mount root and
//! the encrypted mapping. Partitions and their contents are never touched,
//! so a failed materialization can be inspected or retried.
//!
//! Every step checks current state first; running rollback twice, or on a
//! machine where nothing is mounted, is a no-op.

use std::path::{Path, PathBuf};

use crate::encryption::enrollment::{close_mapping, mapping_active};
use crate::error::{InstallError, Result, chain};
use crate::layout::{self, MountTree};
use crate::retry::RetryPolicy;
use crate::tool_runner::ToolRunner;

/// What a rollback released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Mountpoints unmounted, deepest first
    pub unmounted: Vec<PathBuf>,
    pub closed_mapping: Option<String>,
}

impl RollbackReport {
    pub fn is_noop(&self) -> bool {
        self.unmounted.is_empty() && self.closed_mapping.is_none()
    }
}

pub struct RollbackController<'a> {
    runner: &'a dyn ToolRunner,
    close_retry: RetryPolicy,
    close_escalate_after: u32,
}

impl<'a> RollbackController<'a> {
    pub fn new(runner: &'a dyn ToolRunner, close_retry: RetryPolicy, close_escalate_after: u32) -> Self {
        Self {
            runner,
            close_retry,
            close_escalate_after,
        }
    }

    /// Unmount `tree` in reverse order, then close `mapper_name` if active.
    pub fn rollback(&self, tree: &MountTree, mapper_name: Option<&str>) -> Result<RollbackReport> {
        tracing::info!("Rolling back mounts under {}", tree.root.display());

        let unmounted = layout::unmount_tree(self.runner, tree)
            .map_err(|e| InstallError::rollback(chain(&e)))?;
        for mountpoint in &unmounted {
            tracing::info!("Unmounted {}", mountpoint.display());
        }

        let mut closed_mapping = None;
        if let Some(name) = mapper_name {
            if mapping_active(self.runner, name) {
                close_mapping(self.runner, name, &self.close_retry, self.close_escalate_after)
                    .map_err(|e| InstallError::rollback(chain(&e)))?;
                tracing::info!("Closed mapping {}", name);
                closed_mapping = Some(name.to_string());
            }
        }

        let report = RollbackReport {
            unmounted,
            closed_mapping,
        };
        if report.is_noop() {
            tracing::info!("Nothing to roll back");
        }
        Ok(report)
    }
}

/// The mountpoints an install creates under `root`, for rollback without a
/// recorded tree. Sources are irrelevant to unmounting and left empty.
pub fn conventional_tree(root: &Path) -> MountTree {
    MountTree::standard(root, Path::new(""), Some(Path::new("")))
}
