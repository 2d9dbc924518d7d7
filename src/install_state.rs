//! Install State Machine
//!
//! Authoritative record of install progress. Transitions are validated so a
//! stage cannot be skipped programmatically.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! Preflight
//!     ↓
//! Collecting
//!     ↓
//! Confirmed            (requires the destructive confirmation)
//!     ↓
//! Provisioning
//!     ↓
//! Encrypting           (only when encryption was requested)
//!     ↓
//! BuildingLayout
//!     ↓
//! GeneratingDescriptors
//!     ↓
//! Materializing
//!     ↓
//! Finalizing
//!     ↓
//! Completed
//!
//! (Any non-terminal stage can transition to Failed; Failed → RolledBack)
//! ```

use std::fmt;
use thiserror::Error;

/// Installation stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum InstallStage {
    #[default]
    NotStarted = 0,
    /// Privilege, tools, network and template integrity
    Preflight = 1,
    /// Interactive collection of target and identity
    Collecting = 2,
    /// Operator typed the destructive confirmation
    Confirmed = 3,
    /// Wipe, partition and format. DESTRUCTIVE.
    Provisioning = 4,
    Encrypting = 5,
    BuildingLayout = 6,
    GeneratingDescriptors = 7,
    Materializing = 8,
    /// Persisting artifacts and tearing down
    Finalizing = 9,
    Completed = 10,
    Failed = 254,
    /// Mounts and mappings released after a failure
    RolledBack = 255,
}

impl InstallStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if no forward transition exists (Completed, Failed, RolledBack)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Returns true if entering this stage destroys data on the target
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Provisioning)
    }

    /// Next stage in the full sequence (with encryption).
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Preflight),
            Self::Preflight => Some(Self::Collecting),
            Self::Collecting => Some(Self::Confirmed),
            Self::Confirmed => Some(Self::Provisioning),
            Self::Provisioning => Some(Self::Encrypting),
            Self::Encrypting => Some(Self::BuildingLayout),
            Self::BuildingLayout => Some(Self::GeneratingDescriptors),
            Self::GeneratingDescriptors => Some(Self::Materializing),
            Self::Materializing => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::RolledBack => None,
        }
    }

    /// Next stage given whether the disk is encrypted.
    pub const fn next_for(self, encrypted: bool) -> Option<Self> {
        match (self, encrypted) {
            (Self::Provisioning, false) => Some(Self::BuildingLayout),
            _ => self.next(),
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Preflight => "Checking environment",
            Self::Collecting => "Collecting settings",
            Self::Confirmed => "Settings confirmed",
            Self::Provisioning => "Partitioning disk",
            Self::Encrypting => "Setting up encryption",
            Self::BuildingLayout => "Building filesystem layout",
            Self::GeneratingDescriptors => "Generating configuration",
            Self::Materializing => "Installing system",
            Self::Finalizing => "Finalizing installation",
            Self::Completed => "Installation complete",
            Self::Failed => "Installation failed",
            Self::RolledBack => "Rolled back",
        }
    }

    /// Approximate progress for log lines
    pub const fn progress_percent(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Preflight => 2,
            Self::Collecting => 5,
            Self::Confirmed => 10,
            Self::Provisioning => 15,
            Self::Encrypting => 25,
            Self::BuildingLayout => 35,
            Self::GeneratingDescriptors => 40,
            Self::Materializing => 50,
            Self::Finalizing => 95,
            Self::Completed => 100,
            Self::Failed | Self::RolledBack => 0,
        }
    }

    /// All stages of a successful encrypted run, in order
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::Preflight,
            Self::Collecting,
            Self::Confirmed,
            Self::Provisioning,
            Self::Encrypting,
            Self::BuildingLayout,
            Self::GeneratingDescriptors,
            Self::Materializing,
            Self::Finalizing,
            Self::Completed,
        ]
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallTransitionError {
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage { from: InstallStage, to: InstallStage },

    #[error("Cannot go backwards from {from} to {to} (installation is forward-only)")]
    BackwardTransition { from: InstallStage, to: InstallStage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: InstallStage },

    #[error("Stage {stage} requires explicit confirmation (destructive operation)")]
    MissingConfirmation { stage: InstallStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: InstallStage },

    #[error("Only a failed install can be rolled back (currently {from})")]
    RollbackWithoutFailure { from: InstallStage },
}

/// Owns the current stage and validates every transition.
///
/// ```
/// use easeinstall::install_state::{InstallerContext, InstallStage};
///
/// let mut ctx = InstallerContext::new();
/// ctx.advance().unwrap();
/// assert_eq!(ctx.current_stage(), InstallStage::Preflight);
/// assert!(ctx.transition_to(InstallStage::Provisioning).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InstallerContext {
    current: InstallStage,
    failed_at: Option<InstallStage>,
    /// (stage, unix timestamp)
    stage_history: Vec<(InstallStage, u64)>,
    destructive_confirmed: bool,
    encrypted: bool,
}

impl InstallerContext {
    pub fn new() -> Self {
        Self {
            stage_history: Vec::with_capacity(InstallStage::all_stages().len()),
            ..Self::default()
        }
    }

    #[inline]
    pub fn current_stage(&self) -> InstallStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<InstallStage> {
        self.failed_at
    }

    /// True once anything on the target may have been changed.
    #[inline]
    pub fn past_point_of_no_return(&self) -> bool {
        self.failed_at.unwrap_or(self.current).order() >= InstallStage::Provisioning.order()
    }

    pub fn stage_history(&self) -> &[(InstallStage, u64)] {
        &self.stage_history
    }

    /// Record the operator's destructive confirmation and whether the disk
    /// will be encrypted. One-way.
    pub fn confirm_destructive_operations(&mut self, encrypted: bool) {
        self.destructive_confirmed = true;
        self.encrypted = encrypted;
    }

    fn expected_next(&self) -> Option<InstallStage> {
        self.current.next_for(self.encrypted)
    }

    fn requires_confirmation(stage: InstallStage) -> bool {
        stage == InstallStage::Confirmed || stage.is_destructive()
    }

    /// Advance to the next stage in sequence.
    pub fn advance(&mut self) -> Result<InstallStage, InstallTransitionError> {
        let next = self
            .expected_next()
            .ok_or(InstallTransitionError::FromTerminalState { from: self.current })?;
        self.transition_to(next)
    }

    /// Transition to `target`, which must be the next stage in sequence.
    pub fn transition_to(
        &mut self,
        target: InstallStage,
    ) -> Result<InstallStage, InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(InstallTransitionError::AlreadyAtStage { stage: target });
        }
        if matches!(target, InstallStage::Failed | InstallStage::RolledBack) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if target.order() < self.current.order() {
            return Err(InstallTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.expected_next() != Some(target) {
            return Err(InstallTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }
        if Self::requires_confirmation(target) && !self.destructive_confirmed {
            return Err(InstallTransitionError::MissingConfirmation { stage: target });
        }

        self.record_stage_transition(target);
        self.current = target;
        tracing::info!("==> {} ({}%)", target, target.progress_percent());
        Ok(target)
    }

    /// Mark the installation as failed at the current stage.
    pub fn fail(&mut self) -> Result<(), InstallTransitionError> {
        if self.current.is_terminal() {
            return Err(InstallTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record_stage_transition(InstallStage::Failed);
        self.current = InstallStage::Failed;
        Ok(())
    }

    /// Record that a failed install was rolled back.
    pub fn rolled_back(&mut self) -> Result<(), InstallTransitionError> {
        if self.current != InstallStage::Failed {
            return Err(InstallTransitionError::RollbackWithoutFailure { from: self.current });
        }
        self.record_stage_transition(InstallStage::RolledBack);
        self.current = InstallStage::RolledBack;
        Ok(())
    }

    fn record_stage_transition(&mut self, stage: InstallStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.stage_history.push((stage, timestamp));
    }
}

impl From<InstallTransitionError> for crate::error::InstallError {
    fn from(err: InstallTransitionError) -> Self {
        crate::error::InstallError::Transition(err.to_string())
    }
}
