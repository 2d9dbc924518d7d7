//! Type-Safe Tool Execution
//!
//! [`ToolRunner`] is the only sanctioned way to execute external tools. The
//! production implementation, [`SystemRunner`], guarantees:
//!
//! - Process group isolation with a parent-death signal
//! - PID registration for cleanup on signals
//! - Type-safe argument passing via the [`ToolArgs`] trait
//!
//! Stage modules only ever see `&dyn ToolRunner`, which is also the seam the
//! integration tests use to simulate a disk, a TPM and the materializer.

use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::tool_args::ToolArgs;
use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Executes external tools on behalf of the installer stages.
pub trait ToolRunner {
    /// Run a tool to completion, capturing its output.
    ///
    /// A non-zero exit status is NOT an error here: it is reported through
    /// [`ToolOutput::success`]. `Err` means the tool could not be run at all.
    fn run(&self, args: &dyn ToolArgs) -> Result<ToolOutput>;

    /// Whether `path` exists and is a block special file.
    fn is_block_device(&self, path: &Path) -> bool {
        crate::devices::is_block_device(path)
    }
}

/// Runs tools on the live system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, args: &dyn ToolArgs) -> Result<ToolOutput> {
        let program = args.program().to_string();
        let cli_args = args.to_cli_args();
        let env_vars = args.get_env_vars();

        if args.is_destructive() {
            warn!("destructive: {}", args.describe());
        } else {
            info!("run: {}", args.describe());
        }

        let mut cmd = Command::new(&program);
        cmd.args(&cli_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        for (key, value) in &env_vars {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        let pid = child.id();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        let output = child.wait_with_output();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let output = output.with_context(|| format!("Failed waiting for {}", program))?;

        let result = ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        if !result.success {
            info!(
                "{} exited with code {}",
                program,
                result.exit_code.unwrap_or(-1)
            );
        }

        Ok(result)
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Standard output from the tool.
    pub stdout: String,
    /// Standard error from the tool.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl ToolOutput {
    /// Build a successful output, mostly for simulated runners.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Build a failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Check if the tool succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            anyhow::bail!("{} failed (exit code {}): {}", context, code, self.stderr.trim())
        }
    }

    /// Stdout and stderr interleaved as one block, for logs and artifacts.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Run a tool and turn a non-zero exit into an error.
pub fn run_checked(runner: &dyn ToolRunner, args: &dyn ToolArgs) -> Result<ToolOutput> {
    let output = runner.run(args)?;
    output.ensure_success(&args.describe())?;
    Ok(output)
}
