use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::FirmwareMode;

/// easeinstall - guided easeOS installer
#[derive(Parser, Debug)]
#[command(name = "easeinstall")]
#[command(about = "Provision a blank disk into a bootable, optionally encrypted easeOS system")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the guided installer (default)
    Install {
        /// Target disk (skips the disk prompt; still confirmed)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Installer configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the partition plan for a firmware mode without touching any disk
    Plan {
        /// Firmware mode (uefi or bios)
        #[arg(short, long)]
        firmware: FirmwareMode,

        /// Plan for an encrypted root
        #[arg(short, long)]
        encrypt: bool,

        /// Disk name shown in the summary
        #[arg(long, default_value = "/dev/sdX")]
        disk: PathBuf,
    },
    /// Validate an installer configuration file
    ValidateConfig {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Unmount the target tree and close the encrypted mapping
    Rollback {
        /// Installer configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// The subcommand to run; a bare invocation installs.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Install {
            device: None,
            config: None,
        })
    }
}
