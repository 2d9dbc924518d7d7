//! easeinstall - main entry point
//!
//! Parses the command line, sets up the transcript and signal handling,
//! runs the command and maps the outcome to an exit status: 0 on success,
//! 1 on any failure that aborted the run.

use std::path::Path;
use std::process::ExitCode;

use easeinstall::cli::{Cli, Commands};
use easeinstall::error::{InstallError, chain};
use easeinstall::installer::{InstallOptions, Installer};
use easeinstall::preflight::PreflightOptions;
use easeinstall::rollback::{RollbackController, conventional_tree};
use easeinstall::{
    HardwareInfo, InstallerConfig, PartitionPlan, ProcessGuard, SystemRunner, Transcript,
    TtyPrompter, process_guard,
};

/// Transcript lines printed with a fatal error.
const ERROR_TAIL_LINES: usize = 20;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match cli.command() {
        Commands::Plan {
            firmware,
            encrypt,
            disk,
        } => {
            let plan = PartitionPlan::derive(firmware, encrypt);
            println!("{}", plan.summary(&disk));
            ExitCode::SUCCESS
        }
        Commands::ValidateConfig { config } => validate_config(&config),
        Commands::Install { device, config } => {
            with_session(config.as_deref(), |config, transcript| {
                let runner = SystemRunner::new();
                let mut prompter = TtyPrompter::open()?;
                let opts = InstallOptions {
                    device,
                    hardware: HardwareInfo::detect(&config.tpm_device),
                    preflight: Some(PreflightOptions::default()),
                };

                let outcome = Installer::new(&runner, &mut prompter, config, transcript.clone())
                    .run(&opts)?;

                println!();
                println!("✓ Installation complete");
                println!("  Transcript: {}", outcome.log_path.display());
                println!(
                    "  Artifacts:  {}",
                    outcome.generated_artifacts_path.display()
                );
                Ok(())
            })
        }
        Commands::Rollback { config } => with_session(config.as_deref(), |config, _| {
            let runner = SystemRunner::new();
            let report = RollbackController::new(
                &runner,
                config.close_retry,
                config.close_escalate_after,
            )
            .rollback(
                &conventional_tree(&config.mount_root),
                Some(&config.mapper_name),
            )?;

            if report.is_noop() {
                println!("Nothing to roll back");
            } else {
                for mountpoint in &report.unmounted {
                    println!("unmounted {}", mountpoint.display());
                }
                if let Some(mapping) = &report.closed_mapping {
                    println!("closed {}", mapping);
                }
            }
            Ok(())
        }),
    }
}

fn load_config(path: Option<&Path>) -> Result<InstallerConfig, InstallError> {
    let config = InstallerConfig::resolve(path).map_err(|e| InstallError::config(chain(&e)))?;
    config
        .validate()
        .map_err(|e| InstallError::config(chain(&e)))?;
    Ok(config)
}

fn validate_config(path: &Path) -> ExitCode {
    match load_config(Some(path)) {
        Ok(_) => {
            println!("✓ Configuration file is valid: {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run `body` with the transcript logger, signal handlers and process guard
/// in place, then report the outcome.
fn with_session<F>(config_path: Option<&Path>, body: F) -> ExitCode
where
    F: FnOnce(&InstallerConfig, &Transcript) -> Result<(), InstallError>,
{
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}", e);
            eprintln!("  {}", e.remediation());
            return ExitCode::FAILURE;
        }
    };

    let transcript = match Transcript::init(&config.transcript_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("✗ Cannot start transcript: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("easeinstall {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = process_guard::init_signal_handlers() {
        tracing::warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    match body(&config, &transcript) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InstallError::Cancelled) => {
            tracing::info!("{}", InstallError::Cancelled);
            eprintln!("{}", InstallError::Cancelled.remediation());
            ExitCode::FAILURE
        }
        Err(e) => {
            report_fatal(&e, &transcript);
            ExitCode::FAILURE
        }
    }
}

fn report_fatal(err: &InstallError, transcript: &Transcript) {
    tracing::error!("{}", err);

    eprintln!();
    eprintln!("--- last {} transcript lines ---", ERROR_TAIL_LINES);
    for line in transcript.tail(ERROR_TAIL_LINES) {
        eprintln!("{}", line);
    }

    if let InstallError::Materialization { log_tail, .. } = err {
        if !log_tail.is_empty() {
            eprintln!("--- materializer output ---");
            for line in log_tail {
                eprintln!("{}", line);
            }
        }
    }

    eprintln!();
    eprintln!("✗ {}", err);
    eprintln!("  {}", err.remediation());
    eprintln!("  Full transcript: {}", transcript.path().display());
}
