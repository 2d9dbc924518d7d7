//! Interactive collector
//!
//! Gathers target device, hostname, admin identity, passwords and the
//! encryption choice, then asks for the two-stage destructive confirmation.
//! Invalid input re-prompts; end of input or a declined confirmation
//! cancels before anything touches the disk.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use zeroize::Zeroizing;

use crate::devices::{BlockDevice, suggested_disk};
use crate::encryption::SecretFile;
use crate::engine::storage::PartitionPlan;
use crate::error::{InstallError, Result, chain};
use crate::hardware::HardwareInfo;
use crate::prompt::Prompter;
use crate::tool_args::ToolArgs;
use crate::tool_runner::{ToolRunner, run_checked};
use crate::types::InstallTarget;

/// Literal the operator must type to allow erasing the disk.
pub const ERASE_TOKEN: &str = "ERASE";

pub const MIN_PASSWORD_LEN: usize = 8;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static pattern")
});

static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static pattern"));

/// Names the admin account may not take.
const RESERVED_USERS: &[&str] = &["root", "nobody", "nixbld", "daemon"];

/// Who the installed system is for. Only hashes are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub hostname: String,
    pub admin_user: String,
    pub admin_hash: String,
    pub root_hash: String,
}

/// Everything needed to run the destructive stages.
#[derive(Debug, Clone)]
pub struct ConfirmedRequest {
    pub target: InstallTarget,
    pub identity: Identity,
    pub plan: PartitionPlan,
}

/// `openssl passwd -6 -in FILE`
#[derive(Debug, Clone)]
pub struct OpensslPasswdArgs {
    pub input: PathBuf,
}

impl ToolArgs for OpensslPasswdArgs {
    fn program(&self) -> &str {
        "openssl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "passwd".to_string(),
            "-6".to_string(),
            "-in".to_string(),
            self.input.display().to_string(),
        ]
    }
}

pub fn validate_hostname(input: &str) -> Result<String> {
    let name = input.trim();
    if HOSTNAME_RE.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(InstallError::validation(
            "hostname must be 1-63 characters of a-z, 0-9 and '-', not starting or ending with '-'",
        ))
    }
}

pub fn validate_username(input: &str) -> Result<String> {
    let name = input.trim();
    if RESERVED_USERS.contains(&name) {
        return Err(InstallError::validation(format!("'{}' is reserved", name)));
    }
    if USERNAME_RE.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(InstallError::validation(
            "user name must start with a-z or '_' and use only a-z, 0-9, '_' and '-' (max 32)",
        ))
    }
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(InstallError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if password.contains(char::is_whitespace) {
        return Err(InstallError::validation("password cannot contain spaces"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(InstallError::validation(
            "password must contain at least 1 uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(InstallError::validation("password must contain at least 1 number"));
    }
    if !password.chars().any(|c| c.is_ascii_punctuation()) {
        return Err(InstallError::validation(
            "password must contain at least 1 symbol (!@#$%^&* etc.)",
        ));
    }
    Ok(())
}

/// The path must exist and be a block special file.
pub fn validate_device(runner: &dyn ToolRunner, input: &str) -> Result<PathBuf> {
    let path = PathBuf::from(input.trim());
    if !path.is_absolute() {
        return Err(InstallError::validation(format!(
            "{} is not an absolute device path",
            path.display()
        )));
    }
    if !runner.is_block_device(&path) {
        return Err(InstallError::validation(format!(
            "{} is not a block device",
            path.display()
        )));
    }
    Ok(path)
}

/// SHA-512 crypt hash via openssl. Any failure is fatal: there is no
/// fallback password.
pub fn hash_password(runner: &dyn ToolRunner, secrets_dir: &Path, password: &str) -> Result<String> {
    let input = SecretFile::new(secrets_dir, password)?;
    let output = run_checked(
        runner,
        &OpensslPasswdArgs {
            input: input.path().to_path_buf(),
        },
    )
    .map_err(|e| InstallError::descriptor(format!("password hashing failed: {}", chain(&e))))?;

    let hash = output.stdout.trim().to_string();
    if !hash.starts_with("$6$") {
        return Err(InstallError::descriptor(
            "password hashing produced an unexpected result",
        ));
    }
    Ok(hash)
}

/// Interactive collection session.
pub struct Collector<'a> {
    prompter: &'a mut dyn Prompter,
    runner: &'a dyn ToolRunner,
    secrets_dir: PathBuf,
}

impl<'a> Collector<'a> {
    pub fn new(prompter: &'a mut dyn Prompter, runner: &'a dyn ToolRunner, secrets_dir: &Path) -> Self {
        Self {
            prompter,
            runner,
            secrets_dir: secrets_dir.to_path_buf(),
        }
    }

    /// Ask until `parse` accepts the answer. Only validation errors re-prompt.
    fn ask_valid<T>(&mut self, prompt: &str, parse: impl Fn(&str) -> Result<T>) -> Result<T> {
        loop {
            let answer = self.prompter.ask(prompt)?;
            match parse(&answer) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() => self.prompter.say(&format!("  {}", e))?,
                Err(e) => return Err(e),
            }
        }
    }

    fn choose_device(&mut self, disks: &[BlockDevice], preset: Option<&Path>) -> Result<PathBuf> {
        if let Some(preset) = preset {
            let runner = self.runner;
            return validate_device(runner, &preset.display().to_string());
        }

        self.prompter.say("Available disks:")?;
        for (i, disk) in disks.iter().enumerate() {
            self.prompter.say(&format!("  {}) {}", i + 1, disk.describe()))?;
        }
        let suggestion = suggested_disk(disks).map(|d| d.path.clone());
        let prompt = match &suggestion {
            Some(p) => format!("Install to which disk? [{}]", p.display()),
            None => "Install to which disk? (number or path)".to_string(),
        };

        let runner = self.runner;
        let device = self.ask_valid(&prompt, |answer| {
            let answer = answer.trim();
            if answer.is_empty() {
                return match &suggestion {
                    Some(p) => validate_device(runner, &p.display().to_string()),
                    None => Err(InstallError::validation("choose a disk")),
                };
            }
            if let Ok(n) = answer.parse::<usize>() {
                return match disks.get(n.wrapping_sub(1)) {
                    Some(d) => validate_device(runner, &d.path.display().to_string()),
                    None => Err(InstallError::validation(format!("no disk numbered {}", n))),
                };
            }
            validate_device(runner, answer)
        })?;

        if let Some(disk) = disks.iter().find(|d| d.path == device && d.has_data) {
            self.prompter.say(&format!(
                "WARNING: {} contains data ({}). It will be destroyed.",
                device.display(),
                disk.data_partitions.join(", ")
            ))?;
        }
        Ok(device)
    }

    fn ask_new_password(&mut self, label: &str, allow_empty: bool) -> Result<Option<Zeroizing<String>>> {
        loop {
            let first = self.prompter.ask_secret(&format!("{} password:", label))?;
            if first.is_empty() && allow_empty {
                return Ok(None);
            }
            if let Err(e) = validate_password(&first) {
                self.prompter.say(&format!("  {}", e))?;
                continue;
            }
            let second = self.prompter.ask_secret(&format!("Repeat {} password:", label))?;
            if *first != *second {
                self.prompter.say("  passwords do not match")?;
                continue;
            }
            return Ok(Some(first));
        }
    }

    fn ask_yes_no(&mut self, prompt: &str, default: bool) -> Result<bool> {
        self.ask_valid(prompt, |answer| match answer.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "y" | "yes" => Ok(true),
            "n" | "no" => Ok(false),
            _ => Err(InstallError::validation("answer yes or no")),
        })
    }

    /// Two-stage confirmation; anything but `y`/`yes` then `ERASE` cancels.
    fn confirm(&mut self, device: &Path) -> Result<()> {
        let ack = self.prompter.ask("Continue with these settings? [y/N]")?;
        if !matches!(ack.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            return Err(InstallError::Cancelled);
        }

        let token = self.prompter.ask(&format!(
            "ALL DATA ON {} WILL BE LOST. Type {} to proceed:",
            device.display(),
            ERASE_TOKEN
        ))?;
        if token != ERASE_TOKEN {
            return Err(InstallError::Cancelled);
        }
        Ok(())
    }

    /// Run the whole session.
    pub fn collect(
        &mut self,
        disks: &[BlockDevice],
        preset_device: Option<&Path>,
        hardware: &HardwareInfo,
    ) -> Result<ConfirmedRequest> {
        let device = self.choose_device(disks, preset_device)?;
        let hostname = self.ask_valid("Hostname:", validate_hostname)?;
        let admin_user = self.ask_valid("Admin user name:", validate_username)?;

        let admin_password = self
            .ask_new_password("Admin", false)?
            .ok_or_else(|| InstallError::validation("admin password is required"))?;
        let root_password = self.ask_new_password("Root (empty to reuse admin)", true)?;

        let tpm_note = if hardware.security.available() {
            "TPM2 found: unlock will be automatic on this machine"
        } else {
            "no TPM2: the recovery key will be needed at every boot"
        };
        let encrypt = self.ask_yes_no(&format!("Encrypt the disk? ({}) [y/N]", tpm_note), false)?;

        let target = InstallTarget::new(
            device,
            hardware.firmware,
            encrypt,
            hardware.security.available(),
        );
        let plan = PartitionPlan::derive(target.firmware(), target.encryption_requested());

        self.prompter.say("")?;
        self.prompter.say(&format!("Host: {}  Admin: {}", hostname, admin_user))?;
        self.prompter.say(&plan.summary(target.device()))?;
        self.confirm(target.device())?;

        // Hashing happens after confirmation but before anything destructive.
        let admin_hash = hash_password(self.runner, &self.secrets_dir, &admin_password)?;
        let root_hash = match root_password {
            Some(ref pw) => hash_password(self.runner, &self.secrets_dir, pw)?,
            None => admin_hash.clone(),
        };

        tracing::info!(
            "Confirmed: device={}, firmware={}, encrypt={}, host={}, user={}",
            target.device().display(),
            target.firmware(),
            target.encryption_requested(),
            hostname,
            admin_user
        );

        Ok(ConfirmedRequest {
            target,
            identity: Identity {
                hostname,
                admin_user,
                admin_hash,
                root_hash,
            },
            plan,
        })
    }
}
