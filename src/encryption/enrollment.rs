//! Encryption enrollment manager
//!
//! Drives the container through
//!
//! ```text
//! Unencrypted → Formatted → BootstrapOpen → SubvolumesCreated
//!   → ClosedForEnrollment → HardwareEnrollAttempted → RecoveryIssued
//!   → RecoveryValidated → Reopened → Done
//! ```
//!
//! `RecoveryIssued → Reopened` is the only skip: it is taken whenever the
//! recovery credential was not captured or did not unlock the container,
//! and the container is then reopened with the bootstrap secret.
//!
//! Each stage consumes an [`EncryptionState`] and returns the next one or an
//! [`InstallError`]. Soft failures never produce an error; they are pushed
//! onto [`EncryptionState::degradations`].
//!
//! The bootstrap secret is removed from the container ONLY after the
//! recovery credential alone has opened it and the operator has confirmed
//! writing it down ([`EnrollmentManager::revoke_bootstrap`] refuses
//! otherwise). Credentials are shown through the [`Prompter`], never the
//! logger.

use std::fmt;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use super::luks::{
    FuserKillArgs, LuksCipher, LuksCloseArgs, LuksFormatArgs, LuksOpenArgs, LuksRemoveKeyArgs,
    LuksStatusArgs, LuksUuidArgs, RecoveryEnrollArgs, TpmEnrollArgs, mapper_path,
};
use super::recovery::{RecoveryCredential, parse_recovery_output};
use super::secret::{BootstrapSecret, SecretFile};
use crate::config::InstallerConfig;
use crate::error::{InstallError, Result, chain};
use crate::hardware::HardwareSecurity;
use crate::layout::{self, MountTree};
use crate::prompt::Prompter;
use crate::provision;
use crate::retry::{RetryPolicy, retry};
use crate::tool_runner::{ToolRunner, run_checked};
use crate::types::PartitionRole;

/// Times the operator is asked to confirm a credential was recorded.
const ACK_ATTEMPTS: usize = 3;

/// Enrollment progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionPhase {
    Unencrypted,
    Formatted,
    BootstrapOpen,
    SubvolumesCreated,
    ClosedForEnrollment,
    HardwareEnrollAttempted,
    RecoveryIssued,
    RecoveryValidated,
    Reopened,
    Done,
}

impl EncryptionPhase {
    pub fn successor(self) -> Option<Self> {
        use EncryptionPhase::*;
        match self {
            Unencrypted => Some(Formatted),
            Formatted => Some(BootstrapOpen),
            BootstrapOpen => Some(SubvolumesCreated),
            SubvolumesCreated => Some(ClosedForEnrollment),
            ClosedForEnrollment => Some(HardwareEnrollAttempted),
            HardwareEnrollAttempted => Some(RecoveryIssued),
            RecoveryIssued => Some(RecoveryValidated),
            RecoveryValidated => Some(Reopened),
            Reopened => Some(Done),
            Done => None,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        self.successor() == Some(next)
            || (self == Self::RecoveryIssued && next == Self::Reopened)
    }
}

impl fmt::Display for EncryptionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A soft failure absorbed by a safe fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    /// TPM binding failed; unlock relies on the recovery credential
    HardwareEnrollFailed(String),
    /// The recovery enrollment tool itself failed
    RecoveryIssueFailed(String),
    /// Enrollment output did not yield a credential
    RecoveryParseFailed,
    /// The parsed credential did not open the container
    RecoveryValidationFailed(String),
    /// The operator did not confirm recording the recovery key
    RecoveryNotAcknowledged,
    /// The bootstrap key slot could not be removed
    RevocationFailed(String),
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareEnrollFailed(d) => {
                write!(f, "hardware unlock enrollment failed ({}); recovery-only unlock", d)
            }
            Self::RecoveryIssueFailed(d) => write!(f, "recovery key enrollment failed ({})", d),
            Self::RecoveryParseFailed => {
                write!(f, "recovery key could not be read from enrollment output")
            }
            Self::RecoveryValidationFailed(d) => {
                write!(f, "recovery key did not unlock the container ({})", d)
            }
            Self::RecoveryNotAcknowledged => {
                write!(f, "recovery key was not confirmed as recorded")
            }
            Self::RevocationFailed(d) => write!(f, "bootstrap key slot not removed ({})", d),
        }
    }
}

/// Encryption state threaded through the enrollment stages.
pub struct EncryptionState {
    pub phase: EncryptionPhase,
    /// Raw LUKS partition
    pub container: PathBuf,
    pub mapper_name: String,
    pub uuid: String,
    bootstrap: Option<BootstrapSecret>,
    pub bootstrap_revoked: bool,
    pub hardware_enrolled: bool,
    pub pcrs: Option<String>,
    recovery: Option<RecoveryCredential>,
    pub recovery_validated: bool,
    /// Operator confirmed writing the recovery key down
    pub recovery_acknowledged: bool,
    pub degradations: Vec<Degradation>,
    /// Raw recovery enrollment output, kept for the diagnostic artifact
    enrollment_output: Option<Zeroizing<String>>,
}

impl fmt::Debug for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionState")
            .field("phase", &self.phase)
            .field("container", &self.container)
            .field("mapper_name", &self.mapper_name)
            .field("uuid", &self.uuid)
            .field("bootstrap_revoked", &self.bootstrap_revoked)
            .field("hardware_enrolled", &self.hardware_enrolled)
            .field("recovery_validated", &self.recovery_validated)
            .field("recovery_acknowledged", &self.recovery_acknowledged)
            .field("degradations", &self.degradations)
            .finish_non_exhaustive()
    }
}

impl EncryptionState {
    fn advance(mut self, next: EncryptionPhase) -> Result<Self> {
        if !self.phase.can_advance_to(next) {
            return Err(InstallError::transition(format!(
                "encryption {} -> {}",
                self.phase, next
            )));
        }
        tracing::debug!("encryption phase {} -> {}", self.phase, next);
        self.phase = next;
        Ok(self)
    }

    fn degrade(&mut self, d: Degradation) {
        tracing::warn!("{}", d);
        self.degradations.push(d);
    }

    pub fn mapper_path(&self) -> PathBuf {
        mapper_path(&self.mapper_name)
    }

    /// The bootstrap secret while its key slot still exists.
    pub fn bootstrap(&self) -> Option<&BootstrapSecret> {
        self.bootstrap.as_ref()
    }

    pub fn recovery(&self) -> Option<&RecoveryCredential> {
        self.recovery.as_ref()
    }

    pub fn enrollment_output(&self) -> Option<&str> {
        self.enrollment_output.as_deref().map(String::as_str)
    }

    /// Whether the operator may not hold a working passphrase unless the
    /// bootstrap secret is handed over.
    pub fn needs_bootstrap_handover(&self) -> bool {
        self.bootstrap.is_some() && !(self.recovery_validated && self.recovery_acknowledged)
    }

    /// Whether any soft failure was absorbed.
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Whether mapping `name` is active.
pub fn mapping_active(runner: &dyn ToolRunner, name: &str) -> bool {
    runner
        .run(&LuksStatusArgs {
            mapper_name: name.to_string(),
        })
        .map(|o| o.success)
        .unwrap_or(false)
}

/// Close mapping `name` with bounded retries, killing holders from attempt
/// `escalate_after` on. Returns `false` if it was not active.
pub fn close_mapping(
    runner: &dyn ToolRunner,
    name: &str,
    policy: &RetryPolicy,
    escalate_after: u32,
) -> anyhow::Result<bool> {
    if !mapping_active(runner, name) {
        return Ok(false);
    }

    let node = mapper_path(name);
    retry(policy, &format!("closing {}", name), |attempt| {
        if !mapping_active(runner, name) {
            return Ok(());
        }
        if attempt >= escalate_after {
            tracing::warn!("{} still busy, killing holders", node.display());
            let _ = runner.run(&FuserKillArgs::new(&node));
        }
        let out = runner
            .run(&LuksCloseArgs {
                mapper_name: name.to_string(),
            })
            .map_err(|e| chain(&e))?;
        if out.success {
            Ok(())
        } else {
            Err(out.stderr.trim().to_string())
        }
    })
    .map_err(anyhow::Error::new)?;

    Ok(true)
}

/// Runs the enrollment stages against one container.
pub struct EnrollmentManager<'a> {
    runner: &'a dyn ToolRunner,
    secrets_dir: PathBuf,
    close_retry: RetryPolicy,
    close_escalate_after: u32,
}

impl<'a> EnrollmentManager<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: &InstallerConfig) -> Self {
        Self {
            runner,
            secrets_dir: config.secrets_dir.clone(),
            close_retry: config.close_retry,
            close_escalate_after: config.close_escalate_after,
        }
    }

    fn key_file(&self, secret: &str) -> Result<SecretFile> {
        SecretFile::new(&self.secrets_dir, secret).map_err(InstallError::from)
    }

    fn bootstrap_key(&self, state: &EncryptionState) -> Result<SecretFile> {
        let secret = state
            .bootstrap
            .as_ref()
            .ok_or_else(|| InstallError::enrollment("bootstrap secret no longer available"))?;
        self.key_file(secret.expose())
    }

    fn open(&self, state: &EncryptionState, key: &SecretFile) -> anyhow::Result<()> {
        run_checked(
            self.runner,
            &LuksOpenArgs {
                device: state.container.clone(),
                mapper_name: state.mapper_name.clone(),
                key_file: key.path().to_path_buf(),
            },
        )?;
        Ok(())
    }

    /// Create the container keyed by a fresh bootstrap secret.
    pub fn format(&self, container: &Path, mapper_name: &str) -> Result<EncryptionState> {
        let bootstrap = BootstrapSecret::generate();
        let key = self.key_file(bootstrap.expose())?;

        run_checked(
            self.runner,
            &LuksFormatArgs {
                device: container.to_path_buf(),
                cipher: LuksCipher::default(),
                key_file: key.path().to_path_buf(),
                label: Some(PartitionRole::Root.label().to_string()),
            },
        )
        .map_err(|e| InstallError::enrollment(chain(&e)))?;

        let uuid = run_checked(
            self.runner,
            &LuksUuidArgs {
                device: container.to_path_buf(),
            },
        )
        .map_err(|e| InstallError::enrollment(chain(&e)))?
        .stdout
        .trim()
        .to_string();

        tracing::info!("Created LUKS2 container on {} ({})", container.display(), uuid);

        EncryptionState {
            phase: EncryptionPhase::Unencrypted,
            container: container.to_path_buf(),
            mapper_name: mapper_name.to_string(),
            uuid,
            bootstrap: Some(bootstrap),
            bootstrap_revoked: false,
            hardware_enrolled: false,
            pcrs: None,
            recovery: None,
            recovery_validated: false,
            recovery_acknowledged: false,
            degradations: Vec::new(),
            enrollment_output: None,
        }
        .advance(EncryptionPhase::Formatted)
    }

    pub fn open_bootstrap(&self, state: EncryptionState) -> Result<EncryptionState> {
        let key = self.bootstrap_key(&state)?;
        self.open(&state, &key)
            .map_err(|e| InstallError::enrollment(chain(&e)))?;
        state.advance(EncryptionPhase::BootstrapOpen)
    }

    /// Format the opened mapping as the root pool and build the mount tree.
    pub fn create_subvolumes(
        &self,
        state: EncryptionState,
        tree: &MountTree,
    ) -> Result<EncryptionState> {
        provision::format_pool(self.runner, &state.mapper_path())
            .map_err(|e| InstallError::enrollment(e.to_string()))?;
        layout::build(self.runner, tree)?;
        state.advance(EncryptionPhase::SubvolumesCreated)
    }

    /// Unmount the tree (reverse order) and close the mapping.
    pub fn close_for_enrollment(
        &self,
        state: EncryptionState,
        tree: &MountTree,
    ) -> Result<EncryptionState> {
        layout::unmount_tree(self.runner, tree)
            .map_err(|e| InstallError::enrollment(format!("unmounting: {}", chain(&e))))?;

        close_mapping(
            self.runner,
            &state.mapper_name,
            &self.close_retry,
            self.close_escalate_after,
        )
        .map_err(|e| InstallError::enrollment(chain(&e)))?;

        state.advance(EncryptionPhase::ClosedForEnrollment)
    }

    /// Bind a TPM2 slot. Never fails the install.
    pub fn enroll_hardware(
        &self,
        mut state: EncryptionState,
        security: &HardwareSecurity,
        pcrs: &str,
    ) -> Result<EncryptionState> {
        if !security.available() {
            tracing::info!("No TPM2 device; unlock will rely on the recovery key");
            return state.advance(EncryptionPhase::HardwareEnrollAttempted);
        }

        let key = self.bootstrap_key(&state)?;
        let result = self.runner.run(&TpmEnrollArgs {
            device: state.container.clone(),
            unlock_key_file: key.path().to_path_buf(),
            pcrs: pcrs.to_string(),
        });

        match result {
            Ok(out) if out.success => {
                tracing::info!("TPM2 unlock enrolled (PCRs {})", pcrs);
                state.hardware_enrolled = true;
                state.pcrs = Some(pcrs.to_string());
            }
            Ok(out) => state.degrade(Degradation::HardwareEnrollFailed(
                out.stderr.trim().to_string(),
            )),
            Err(e) => state.degrade(Degradation::HardwareEnrollFailed(chain(&e))),
        }

        state.advance(EncryptionPhase::HardwareEnrollAttempted)
    }

    /// Generate a recovery key slot and capture the credential.
    pub fn issue_recovery(&self, mut state: EncryptionState) -> Result<EncryptionState> {
        let key = self.bootstrap_key(&state)?;
        let result = self.runner.run(&RecoveryEnrollArgs {
            device: state.container.clone(),
            unlock_key_file: key.path().to_path_buf(),
        });

        match result {
            Ok(out) => {
                let raw = Zeroizing::new(out.combined());
                if !out.success {
                    state.degrade(Degradation::RecoveryIssueFailed(format!(
                        "exit code {}",
                        out.exit_code.unwrap_or(-1)
                    )));
                } else if let Some(cred) = parse_recovery_output(&out.stdout, &out.stderr) {
                    tracing::info!("Recovery key captured ({:?} pattern)", cred.parsed_by);
                    state.recovery = Some(cred);
                } else {
                    state.degrade(Degradation::RecoveryParseFailed);
                }
                state.enrollment_output = Some(raw);
            }
            Err(e) => state.degrade(Degradation::RecoveryIssueFailed(chain(&e))),
        }

        state.advance(EncryptionPhase::RecoveryIssued)
    }

    /// Show the recovery key to the operator and ask them to confirm it was
    /// written down. Without confirmation the bootstrap slot is kept.
    pub fn present_recovery(
        &self,
        mut state: EncryptionState,
        prompter: &mut dyn Prompter,
    ) -> Result<EncryptionState> {
        let Some(cred) = state.recovery.clone() else {
            return Ok(state);
        };

        let shown = [
            "",
            "Recovery key for the encrypted disk. Write it down and keep it safe;",
            "it unlocks the disk when the TPM cannot:",
            "",
        ]
        .iter()
        .try_for_each(|line| prompter.say(line))
        .and_then(|()| prompter.say(&format!("    {}", cred.expose())))
        .and_then(|()| prompter.say(""));

        if shown.is_ok() {
            for _ in 0..ACK_ATTEMPTS {
                match prompter.ask("Type 'yes' once the recovery key is written down:") {
                    Ok(answer) if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") => {
                        state.recovery_acknowledged = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }

        if !state.recovery_acknowledged {
            state.degrade(Degradation::RecoveryNotAcknowledged);
        }
        Ok(state)
    }

    /// Show the bootstrap secret when it is the only passphrase the operator
    /// is sure to hold, with the raw enrollment output if the recovery key
    /// could not be confirmed.
    pub fn present_bootstrap(&self, state: &EncryptionState, prompter: &mut dyn Prompter) {
        if !state.needs_bootstrap_handover() {
            return;
        }
        let Some(secret) = state.bootstrap() else {
            return;
        };

        let mut lines = vec![
            String::new(),
            "The recovery key could not be confirmed. The disk can still be unlocked".to_string(),
            "with this setup passphrase. Write it down before rebooting:".to_string(),
            String::new(),
            format!("    {}", secret.expose()),
            String::new(),
        ];
        if !state.recovery_validated {
            if let Some(raw) = state.enrollment_output() {
                lines.push("Output of the recovery key enrollment:".to_string());
                lines.extend(raw.lines().map(|l| format!("    {}", l)));
                lines.push(String::new());
            }
        }

        if lines.iter().try_for_each(|l| prompter.say(l)).is_err() {
            tracing::error!("Could not show the setup passphrase on the terminal");
            return;
        }
        let _ = prompter.ask("Press Enter once the passphrase is written down:");
    }

    /// Open with the recovery credential alone. On success revoke the
    /// bootstrap secret if the operator confirmed recording the key;
    /// otherwise keep it and reopen with it.
    pub fn validate_and_reopen(&self, mut state: EncryptionState) -> Result<EncryptionState> {
        if let Some(cred) = state.recovery.clone() {
            let key = self.key_file(cred.expose())?;
            match self.open(&state, &key) {
                Ok(()) => {
                    tracing::info!("Recovery key unlocks the container");
                    state.recovery_validated = true;
                    let state = state.advance(EncryptionPhase::RecoveryValidated)?;
                    let state = if state.recovery_acknowledged {
                        self.revoke_bootstrap(state)?
                    } else {
                        tracing::warn!("Recovery key not confirmed; keeping bootstrap key slot");
                        state
                    };
                    return state.advance(EncryptionPhase::Reopened);
                }
                Err(e) => state.degrade(Degradation::RecoveryValidationFailed(chain(&e))),
            }
        }

        tracing::warn!("Keeping bootstrap key slot; reopening with it");
        let key = self.bootstrap_key(&state)?;
        self.open(&state, &key)
            .map_err(|e| InstallError::enrollment(format!("reopening: {}", chain(&e))))?;
        state.advance(EncryptionPhase::Reopened)
    }

    /// Remove the bootstrap key slot. Refused unless the recovery credential
    /// has been validated and acknowledged.
    pub fn revoke_bootstrap(&self, mut state: EncryptionState) -> Result<EncryptionState> {
        if !state.recovery_validated || !state.recovery_acknowledged {
            return Err(InstallError::RevocationRefused);
        }

        let key = self.bootstrap_key(&state)?;
        match run_checked(
            self.runner,
            &LuksRemoveKeyArgs {
                device: state.container.clone(),
                key_file: key.path().to_path_buf(),
            },
        ) {
            Ok(_) => {
                tracing::info!("Bootstrap key slot removed");
                state.bootstrap_revoked = true;
                drop(key);
                state.bootstrap = None;
            }
            Err(e) => state.degrade(Degradation::RevocationFailed(chain(&e))),
        }
        Ok(state)
    }

    pub fn remount(&self, state: EncryptionState, tree: &MountTree) -> Result<EncryptionState> {
        layout::mount_tree(self.runner, tree)?;
        state.advance(EncryptionPhase::Done)
    }

    /// Full enrollment: format through remount.
    pub fn run(
        &self,
        container: &Path,
        mapper_name: &str,
        tree: &MountTree,
        security: &HardwareSecurity,
        pcrs: &str,
        prompter: &mut dyn Prompter,
    ) -> Result<EncryptionState> {
        let state = self.format(container, mapper_name)?;
        let state = self.open_bootstrap(state)?;
        let state = self.create_subvolumes(state, tree)?;
        let state = self.close_for_enrollment(state, tree)?;
        let state = self.enroll_hardware(state, security, pcrs)?;
        let state = self.issue_recovery(state)?;
        let state = self.present_recovery(state, prompter)?;
        let state = self.validate_and_reopen(state)?;
        let state = self.remount(state, tree)?;
        self.present_bootstrap(&state, prompter);

        if state.is_degraded() {
            tracing::warn!(
                "Encryption finished in degraded mode: {}",
                state
                    .degradations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            );
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::recovery::ParsedBy;
    use crate::prompt::ScriptedPrompter;
    use crate::tool_args::ToolArgs;
    use crate::tool_runner::ToolOutput;
    use std::cell::RefCell;

    fn state(phase: EncryptionPhase) -> EncryptionState {
        EncryptionState {
            phase,
            container: PathBuf::from("/dev/sda2"),
            mapper_name: "cryptroot".to_string(),
            uuid: "u".to_string(),
            bootstrap: Some(BootstrapSecret::generate()),
            bootstrap_revoked: false,
            hardware_enrolled: false,
            pcrs: None,
            recovery: None,
            recovery_validated: false,
            recovery_acknowledged: false,
            degradations: Vec::new(),
            enrollment_output: None,
        }
    }

    /// Records commands; fails any whose description contains `fail_on`.
    struct Recorder {
        log: RefCell<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl ToolRunner for Recorder {
        fn run(&self, args: &dyn ToolArgs) -> anyhow::Result<ToolOutput> {
            let line = args.describe();
            self.log.borrow_mut().push(line.clone());
            match self.fail_on {
                Some(pat) if line.contains(pat) => Ok(ToolOutput::failed(1, "boom")),
                _ => Ok(ToolOutput::ok("")),
            }
        }
    }

    fn manager<'a>(runner: &'a Recorder, dir: &Path) -> EnrollmentManager<'a> {
        let mut config = InstallerConfig::default();
        config.secrets_dir = dir.to_path_buf();
        config.close_retry = RetryPolicy::new(2, 0);
        EnrollmentManager::new(runner, &config)
    }

    #[test]
    fn test_phase_order_and_single_skip() {
        use EncryptionPhase::*;
        assert!(Formatted.can_advance_to(BootstrapOpen));
        assert!(RecoveryIssued.can_advance_to(RecoveryValidated));
        assert!(RecoveryIssued.can_advance_to(Reopened));
        assert!(!HardwareEnrollAttempted.can_advance_to(Reopened));
        assert!(!Formatted.can_advance_to(SubvolumesCreated));
        assert!(!Done.can_advance_to(Unencrypted));
    }

    #[test]
    fn test_advance_rejects_skips() {
        let err = state(EncryptionPhase::Formatted)
            .advance(EncryptionPhase::Done)
            .expect_err("skip must fail");
        assert!(matches!(err, InstallError::Transition(_)));
    }

    #[test]
    fn test_revocation_refused_without_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let err = manager(&runner, dir.path())
            .revoke_bootstrap(state(EncryptionPhase::RecoveryValidated))
            .expect_err("must refuse");
        assert!(matches!(err, InstallError::RevocationRefused));
        assert!(runner.log.borrow().is_empty(), "no tool may run");
    }

    #[test]
    fn test_failed_tpm_enrollment_is_soft() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: Some("--tpm2-device"),
        };
        let security = HardwareSecurity {
            tpm_device: Some(PathBuf::from("/dev/tpmrm0")),
            secure_boot: true,
        };
        let st = manager(&runner, dir.path())
            .enroll_hardware(state(EncryptionPhase::ClosedForEnrollment), &security, "0+7")
            .expect("soft failure");
        assert_eq!(st.phase, EncryptionPhase::HardwareEnrollAttempted);
        assert!(!st.hardware_enrolled);
        assert!(matches!(
            st.degradations.as_slice(),
            [Degradation::HardwareEnrollFailed(_)]
        ));
    }

    #[test]
    fn test_unparseable_recovery_keeps_bootstrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mgr = manager(&runner, dir.path());
        let st = mgr
            .issue_recovery(state(EncryptionPhase::HardwareEnrollAttempted))
            .expect("soft failure");
        assert_eq!(st.degradations, vec![Degradation::RecoveryParseFailed]);

        let st = mgr.validate_and_reopen(st).expect("reopen");
        assert_eq!(st.phase, EncryptionPhase::Reopened);
        assert!(!st.recovery_validated);
        assert!(!st.bootstrap_revoked);
        assert!(st.bootstrap().is_some());
        assert!(
            !runner
                .log
                .borrow()
                .iter()
                .any(|l| l.contains("luksRemoveKey"))
        );
    }

    const KEY: &str = "fkrrgdbf-ihbjlnhu-vdejfktl-rbuhtuth-jflugnhj-vcclctdj-ilkjtlrj-dkjhulgh";

    fn issued() -> EncryptionState {
        let mut st = state(EncryptionPhase::RecoveryIssued);
        st.recovery = Some(RecoveryCredential::new(KEY, ParsedBy::Structured));
        st
    }

    #[test]
    fn test_revocation_refused_without_acknowledgement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mut st = state(EncryptionPhase::RecoveryValidated);
        st.recovery_validated = true;
        let err = manager(&runner, dir.path())
            .revoke_bootstrap(st)
            .expect_err("must refuse");
        assert!(matches!(err, InstallError::RevocationRefused));
        assert!(runner.log.borrow().is_empty());
    }

    #[test]
    fn test_recovery_key_shown_and_confirmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mut prompter = ScriptedPrompter::new(["later", "yes"]);
        let st = manager(&runner, dir.path())
            .present_recovery(issued(), &mut prompter)
            .expect("present");

        assert!(st.recovery_acknowledged);
        assert!(!st.is_degraded());
        assert!(prompter.shown.iter().any(|l| l.contains(KEY)));
        assert_eq!(prompter.remaining(), 0);
    }

    #[test]
    fn test_unconfirmed_recovery_keeps_bootstrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mgr = manager(&runner, dir.path());
        let mut prompter = ScriptedPrompter::new(["no", "no", "no"]);

        let st = mgr.present_recovery(issued(), &mut prompter).expect("present");
        assert_eq!(st.degradations, vec![Degradation::RecoveryNotAcknowledged]);

        let st = mgr.validate_and_reopen(st).expect("reopen");
        assert!(st.recovery_validated);
        assert!(!st.bootstrap_revoked);
        assert!(st.needs_bootstrap_handover());
        assert!(!runner.log.borrow().iter().any(|l| l.contains("luksRemoveKey")));
    }

    #[test]
    fn test_bootstrap_handed_over_with_raw_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mut st = state(EncryptionPhase::Done);
        st.enrollment_output = Some(Zeroizing::new("(key not shown)".to_string()));
        let secret = st.bootstrap().expect("bootstrap").expose().to_string();

        let mut prompter = ScriptedPrompter::default();
        manager(&runner, dir.path()).present_bootstrap(&st, &mut prompter);

        assert!(prompter.shown.iter().any(|l| l.contains(&secret)));
        assert!(prompter.shown.iter().any(|l| l.contains("(key not shown)")));
    }

    #[test]
    fn test_no_handover_after_revocation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: None,
        };
        let mut st = issued();
        st.recovery_acknowledged = true;
        let st = manager(&runner, dir.path()).validate_and_reopen(st).expect("reopen");
        assert!(st.bootstrap_revoked);
        assert!(!st.needs_bootstrap_handover());

        let mut prompter = ScriptedPrompter::default();
        manager(&runner, dir.path()).present_bootstrap(&st, &mut prompter);
        assert!(prompter.shown.is_empty());
    }

    #[test]
    fn test_close_mapping_gives_up_after_ceiling() {
        let runner = Recorder {
            log: RefCell::new(vec![]),
            fail_on: Some("close"),
        };
        let err = close_mapping(&runner, "cryptroot", &RetryPolicy::new(3, 0), 2)
            .expect_err("close keeps failing");
        assert!(err.to_string().contains("3 attempt"));
        let log = runner.log.borrow();
        assert_eq!(log.iter().filter(|l| l.starts_with("fuser")).count(), 2);
    }
}
