//! easeinstall library
//!
//! Core of the guided easeOS installer: preflight, interactive collection,
//! disk provisioning, full-disk encryption enrollment, Btrfs layout,
//! descriptor generation, materializer invocation and rollback.

pub mod cli;
pub mod collector;
pub mod config;
pub mod descriptors;
pub mod devices;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod install_state;
pub mod installer;
pub mod layout;
pub mod materializer;
pub mod preflight;
pub mod process_guard;
pub mod prompt;
pub mod provision;
pub mod retry;
pub mod rollback;
pub mod tool_args;
pub mod tool_runner;
pub mod transcript;
pub mod types;

// Re-export main types for convenience
pub use config::InstallerConfig;
pub use engine::storage::{PartitionPlan, PartitionSpec, SizeSpec};
pub use error::{InstallError, Result};
pub use hardware::{HardwareInfo, HardwareSecurity, NetworkState};
pub use install_state::{InstallStage, InstallTransitionError, InstallerContext};
pub use installer::{InstallOptions, Installer};
pub use layout::{MountEntry, MountTree};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use prompt::{Prompter, ScriptedPrompter, TtyPrompter};
pub use rollback::{RollbackController, RollbackReport};
pub use tool_args::ToolArgs;
pub use tool_runner::{SystemRunner, ToolOutput, ToolRunner};
pub use transcript::Transcript;
pub use types::{FilesystemType, FirmwareMode, InstallOutcome, InstallTarget, PartitionRole};
