//! Installer module
//!
//! Drives one install from preflight to finalization. Every stage is a
//! function of the values produced by the previous one; the
//! [`InstallerContext`] records where the run is and refuses out-of-order
//! progress.
//!
//! Failure policy:
//! - before the destructive confirmation, errors (and cancellation) leave
//!   the machine untouched;
//! - provisioning, enrollment, layout and descriptor errors abort at once
//!   with no continuation;
//! - any failure while the target root is mounted copies the transcript
//!   into it;
//! - a materializer failure then offers rollback of mounts and mappings.
//!   Partitions are kept.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::collector::{Collector, ConfirmedRequest};
use crate::config::InstallerConfig;
use crate::descriptors;
use crate::devices;
use crate::encryption::luks::mapper_path;
use crate::encryption::{EncryptionState, EnrollmentManager};
use crate::error::{InstallError, Result, chain};
use crate::hardware::HardwareInfo;
use crate::install_state::{InstallStage, InstallerContext};
use crate::layout::{self, MountTree};
use crate::materializer::{self, MaterializerArgs};
use crate::preflight::{self, PreflightOptions};
use crate::process_guard;
use crate::prompt::Prompter;
use crate::provision;
use crate::rollback::{RollbackController, RollbackReport};
use crate::tool_runner::ToolRunner;
use crate::transcript::{self, Transcript};
use crate::types::InstallOutcome;

/// Diagnostic artifact written when encryption finished degraded.
pub const DIAGNOSTICS_FILE: &str = "enrollment-diagnostics.txt";

/// Per-run inputs that are not part of the installer configuration.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Skip the disk prompt and use this device
    pub device: Option<PathBuf>,
    pub hardware: HardwareInfo,
    /// `None` skips preflight entirely
    pub preflight: Option<PreflightOptions>,
}

/// Installer instance
pub struct Installer<'a> {
    runner: &'a dyn ToolRunner,
    prompter: &'a mut dyn Prompter,
    config: &'a InstallerConfig,
    transcript: Transcript,
    ctx: InstallerContext,
    /// Mounts made so far, for teardown
    tree: Option<MountTree>,
    mapper: Option<String>,
}

impl<'a> Installer<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        prompter: &'a mut dyn Prompter,
        config: &'a InstallerConfig,
        transcript: Transcript,
    ) -> Self {
        Self {
            runner,
            prompter,
            config,
            transcript,
            ctx: InstallerContext::new(),
            tree: None,
            mapper: None,
        }
    }

    pub fn context(&self) -> &InstallerContext {
        &self.ctx
    }

    /// Run the whole install.
    pub fn run(&mut self, opts: &InstallOptions) -> Result<InstallOutcome> {
        let request = self.prepare(opts)?;

        process_guard::enter_point_of_no_return();
        match self.install_confirmed(&request, &opts.hardware) {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.handle_failure(err)),
        }
    }

    /// Everything up to and including the destructive confirmation.
    fn prepare(&mut self, opts: &InstallOptions) -> Result<ConfirmedRequest> {
        let result = self.preflight_and_collect(opts);
        if result.is_err() {
            let _ = self.ctx.fail();
        }
        result
    }

    fn preflight_and_collect(&mut self, opts: &InstallOptions) -> Result<ConfirmedRequest> {
        self.ctx.transition_to(InstallStage::Preflight)?;
        tracing::info!("{}", opts.hardware);
        match opts.preflight {
            Some(popts) => {
                preflight::run(self.config, popts).into_result()?;
            }
            None => tracing::warn!("Preflight checks skipped"),
        }

        self.ctx.transition_to(InstallStage::Collecting)?;
        let disks = match opts.device {
            Some(_) => Vec::new(),
            None => devices::list_disks(self.runner)
                .map_err(|e| InstallError::preflight(format!("listing disks: {}", chain(&e))))?,
        };

        let request = Collector::new(&mut *self.prompter, self.runner, &self.config.secrets_dir)
            .collect(&disks, opts.device.as_deref(), &opts.hardware)?;

        self.ctx
            .confirm_destructive_operations(request.target.encryption_requested());
        self.ctx.transition_to(InstallStage::Confirmed)?;
        Ok(request)
    }

    fn install_confirmed(
        &mut self,
        request: &ConfirmedRequest,
        hardware: &HardwareInfo,
    ) -> Result<InstallOutcome> {
        let config = self.config;
        let target = &request.target;
        let root = config.mount_root.as_path();

        self.ctx.transition_to(InstallStage::Provisioning)?;
        let disk = provision::provision(
            self.runner,
            target.device(),
            &request.plan,
            &config.settle_retry,
        )?;
        let boot = disk
            .boot
            .as_ref()
            .filter(|(_, fs)| layout::boot_is_mounted(*fs))
            .map(|(path, _)| path.as_path());

        let encryption = if target.encryption_requested() {
            self.ctx.transition_to(InstallStage::Encrypting)?;
            let tree = MountTree::standard(root, &mapper_path(&config.mapper_name), boot);
            self.tree = Some(tree.clone());
            self.mapper = Some(config.mapper_name.clone());

            let pcrs = hardware
                .security
                .pcrs(&config.tpm_pcrs_secure_boot, &config.tpm_pcrs);
            let state = EnrollmentManager::new(self.runner, config).run(
                &disk.root,
                &config.mapper_name,
                &tree,
                &hardware.security,
                pcrs,
                &mut *self.prompter,
            )?;

            self.ctx.transition_to(InstallStage::BuildingLayout)?;
            // Enrollment already remounted the tree; this only confirms it.
            layout::mount_tree(self.runner, &tree)?;
            Some(state)
        } else {
            self.ctx.transition_to(InstallStage::BuildingLayout)?;
            let tree = MountTree::standard(root, &disk.root, boot);
            self.tree = Some(tree.clone());
            layout::build(self.runner, &tree)?;
            None
        };

        self.ctx.transition_to(InstallStage::GeneratingDescriptors)?;
        let config_dir = descriptors::prepare_tree(
            self.runner,
            &config.template_dir,
            root,
            config.generate_hardware_config,
        )?;
        let descriptor_dir = config.in_target(&config.descriptor_dir);
        descriptors::write_descriptors(
            &descriptor_dir,
            target,
            &request.identity,
            encryption.as_ref(),
        )?;
        descriptors::verify_consistency(&config_dir, &descriptor_dir, target)?;

        self.ctx.transition_to(InstallStage::Materializing)?;
        let materialized = materializer::materialize(
            self.runner,
            &MaterializerArgs::from_config(config, root),
            &self.live_log_dir(),
        )?;

        self.ctx.transition_to(InstallStage::Finalizing)?;
        let artifacts = config.in_target(&config.artifact_dir);
        fs::create_dir_all(&artifacts)?;
        if let Some(state) = &encryption {
            self.persist_encryption_artifacts(state, &artifacts)?;
        }
        fs::copy(
            &materialized.log_path,
            artifacts.join(materializer::LOG_FILE),
        )?;
        self.copy_transcript()?;
        self.teardown()?;

        self.ctx.transition_to(InstallStage::Completed)?;
        tracing::info!("Installation complete. Remove the installation medium and reboot.");

        Ok(InstallOutcome {
            success: true,
            log_path: self.transcript.path().to_path_buf(),
            generated_artifacts_path: artifacts,
        })
    }

    /// Directory on the live medium that outlives a rollback.
    fn live_log_dir(&self) -> PathBuf {
        self.transcript
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.secrets_dir.clone())
    }

    fn persist_encryption_artifacts(&self, state: &EncryptionState, artifacts: &Path) -> Result<()> {
        if state.recovery_validated {
            if let Some(cred) = state.recovery() {
                let path = self.config.in_target(&self.config.recovery_key_path);
                write_read_only(&path, &format!("{}\n", cred.expose()))?;
                tracing::info!("Recovery key written to {}", path.display());
            }
        }

        if state.is_degraded() {
            let mut report = String::from("Encryption finished in degraded mode.\n\n");
            for d in &state.degradations {
                report.push_str(&format!("- {}\n", d));
            }
            report.push_str(&format!(
                "\nBootstrap key slot retained: {}\nRecovery key confirmed by operator: {}\nTPM2 enrolled: {}\n",
                !state.bootstrap_revoked, state.recovery_acknowledged, state.hardware_enrolled
            ));
            if let Some(raw) = state.enrollment_output() {
                report.push_str("\nRaw recovery enrollment output:\n");
                report.push_str(raw);
                if !raw.ends_with('\n') {
                    report.push('\n');
                }
            }
            let path = artifacts.join(DIAGNOSTICS_FILE);
            write_read_only(&path, &report)?;
            tracing::warn!("Enrollment diagnostics written to {}", path.display());
        }
        Ok(())
    }

    fn copy_transcript(&self) -> Result<()> {
        transcript::ensure_exists(self.transcript.path())
            .and_then(|()| {
                self.transcript
                    .copy_into(&self.config.mount_root, &self.config.transcript_target_path)
            })
            .map(|dest| tracing::info!("Transcript copied to {}", dest.display()))
            .map_err(|e| InstallError::Io(std::io::Error::other(chain(&e))))
    }

    /// Whether the target root is mounted, so files written under the mount
    /// root land in the installed system.
    fn target_mounted(&self) -> bool {
        self.tree.is_some() && layout::is_mounted(self.runner, &self.config.mount_root)
    }

    fn teardown(&mut self) -> Result<RollbackReport> {
        let Some(tree) = self.tree.clone() else {
            return Ok(RollbackReport::default());
        };
        RollbackController::new(
            self.runner,
            self.config.close_retry,
            self.config.close_escalate_after,
        )
        .rollback(&tree, self.mapper.as_deref())
    }

    fn handle_failure(&mut self, err: InstallError) -> InstallError {
        let _ = self.ctx.fail();
        tracing::error!("{}", err);

        if self.ctx.past_point_of_no_return() && self.target_mounted() {
            if let Err(e) = self.copy_transcript() {
                tracing::warn!("Could not copy transcript into the target: {}", e);
            }
        }

        if !matches!(err, InstallError::Materialization { .. }) {
            if self.tree.is_some() {
                tracing::warn!("Mounts were left in place; run `easeinstall rollback` to release them");
            }
            return err;
        }

        let answer = self
            .prompter
            .ask("Roll back mounts and encryption mappings now? [Y/n]")
            .unwrap_or_default();
        if matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no") {
            tracing::warn!("Rollback declined; mounts under {} remain", self.config.mount_root.display());
            return err;
        }

        match self.teardown() {
            Ok(report) => {
                tracing::info!(
                    "Rolled back {} mount(s){}",
                    report.unmounted.len(),
                    report
                        .closed_mapping
                        .map(|m| format!(" and closed {}", m))
                        .unwrap_or_default()
                );
                let _ = self.ctx.rolled_back();
            }
            Err(e) => tracing::error!("{}", e),
        }
        err
    }
}

/// Create `path` with mode 0400 and write `content`.
fn write_read_only(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _ = fs::remove_file(path);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
