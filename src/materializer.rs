//! Materializer invocation
//!
//! The materializer (`nixos-install` by default) turns the prepared tree
//! into an installed system. It is run exactly once per install; its full
//! output is kept in `materializer.log` under the artifact directory and
//! the tail is attached to the error on failure.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::InstallerConfig;
use crate::error::{InstallError, Result, chain};
use crate::tool_args::ToolArgs;
use crate::tool_runner::ToolRunner;
use crate::transcript::tail_lines;

pub const LOG_FILE: &str = "materializer.log";

/// Lines of materializer output attached to a failure.
pub const TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct MaterializerArgs {
    pub program: String,
    pub args: Vec<String>,
}

impl MaterializerArgs {
    pub fn from_config(config: &InstallerConfig, root: &Path) -> Self {
        Self {
            program: config.materializer_program.clone(),
            args: config.materializer_args_for(root),
        }
    }
}

impl ToolArgs for MaterializerArgs {
    fn program(&self) -> &str {
        &self.program
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// What a successful run left behind.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub log_path: PathBuf,
}

/// Run the materializer against `root` and record its output in `log_dir`.
pub fn materialize(
    runner: &dyn ToolRunner,
    args: &MaterializerArgs,
    log_dir: &Path,
) -> Result<Materialized> {
    tracing::info!("Materializing system: {}", args.describe());

    let output = match runner.run(args) {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Materializer could not be started: {}", chain(&e));
            return Err(InstallError::Materialization {
                exit_code: None,
                log_tail: vec![chain(&e)],
            });
        }
    };

    let combined = output.combined();
    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    fs::write(&log_path, &combined)?;

    if !output.success {
        tracing::error!(
            "Materializer exited with code {:?}, log at {}",
            output.exit_code,
            log_path.display()
        );
        return Err(InstallError::Materialization {
            exit_code: output.exit_code,
            log_tail: tail_lines(&combined, TAIL_LINES),
        });
    }

    tracing::info!("Materializer finished, log at {}", log_path.display());
    Ok(Materialized { log_path })
}
