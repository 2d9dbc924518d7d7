//! Error handling module for the installer
//!
//! Provides the fatal error taxonomy using thiserror. Soft failures
//! (hardware enrollment, recovery parsing/validation) are not errors: they
//! are recorded as [`crate::encryption::Degradation`] values and the run
//! continues on a safe fallback path.

use thiserror::Error;

/// Main error type for the installer
#[derive(Error, Debug)]
pub enum InstallError {
    /// Preflight checks failed (privilege, binaries, connectivity, integrity)
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// Bad user input (device path, hostname, password mismatch)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operator declined before the destructive confirmation completed
    #[error("Installation cancelled before any destructive operation")]
    Cancelled,

    /// Wipe, partition or format failure
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Fatal encryption failure (format, open, close retries exhausted)
    #[error("Encryption setup failed: {0}")]
    Enrollment(String),

    /// Subvolume creation or mount failure
    #[error("Filesystem layout failed: {0}")]
    Layout(String),

    /// Descriptor generation or consistency failure
    #[error("Descriptor error: {0}")]
    Descriptor(String),

    /// The materializer exited unsuccessfully
    #[error("Materialization failed (exit code {exit_code:?})")]
    Materialization {
        exit_code: Option<i32>,
        log_tail: Vec<String>,
    },

    /// Teardown of mounts or mappings failed
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// Revoking the bootstrap secret was requested without a validated recovery credential
    #[error("Refusing to revoke bootstrap secret: recovery credential not validated")]
    RevocationRefused,

    /// Install or encryption state machine misuse
    #[error("Invalid stage transition: {0}")]
    Transition(String),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (file operations, terminal, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a preflight error
    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a fatal enrollment error
    pub fn enrollment(msg: impl Into<String>) -> Self {
        Self::Enrollment(msg.into())
    }

    /// Create a layout error
    pub fn layout(msg: impl Into<String>) -> Self {
        Self::Layout(msg.into())
    }

    /// Create a descriptor error
    pub fn descriptor(msg: impl Into<String>) -> Self {
        Self::Descriptor(msg.into())
    }

    /// Create a rollback error
    pub fn rollback(msg: impl Into<String>) -> Self {
        Self::Rollback(msg.into())
    }

    /// Create a transition error
    pub fn transition(msg: impl Into<String>) -> Self {
        Self::Transition(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Only validation errors are fixed by asking again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Concrete guidance printed with every fatal error.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Preflight(_) => {
                "Run the installer as root from the live medium, connect to a network, \
                 and make sure the installer image is not corrupted."
            }
            Self::Validation(_) => "Correct the highlighted input and try again.",
            Self::Cancelled => "Nothing was changed. Re-run the installer when ready.",
            Self::Provisioning(_) => {
                "The disk is in an unknown state. Check `dmesg` for I/O errors, make sure \
                 nothing on the target disk is mounted, then re-run the installer from the start."
            }
            Self::Enrollment(_) => {
                "Encryption setup did not complete. Close any open mapping with \
                 `cryptsetup close cryptroot`, then re-run the installer."
            }
            Self::Layout(_) => {
                "Subvolume creation or mounting failed. Run `easeinstall rollback` and re-run \
                 the installer."
            }
            Self::Descriptor(_) => {
                "Generated configuration was inconsistent. Check the configuration template \
                 directory, run `easeinstall rollback`, then re-run the installer."
            }
            Self::Materialization { .. } => {
                "Partitions were left intact. Inspect the materializer log, fix the \
                 configuration or network problem, then re-run the installer."
            }
            Self::Rollback(_) => {
                "Unmount everything below the mount root with `umount -R /mnt` and close \
                 mappings with `cryptsetup close cryptroot` before retrying."
            }
            Self::RevocationRefused | Self::Transition(_) => {
                "This is an installer bug. Please report it together with the transcript."
            }
            Self::Config(_) => "Fix the installer configuration file and try again.",
            Self::Io(_) | Self::Json(_) => "Check free space and permissions, then try again.",
        }
    }
}

/// Flatten an anyhow chain into a single line for an error message.
pub fn chain(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
