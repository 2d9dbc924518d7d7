//! Session transcript
//!
//! Every `tracing` event goes to stderr and to the transcript file. The
//! transcript is tailed on fatal errors and copied into the installed
//! system on both the success and the failure path.
//!
//! Interactive prompts are written to the terminal directly (see
//! [`crate::prompt`]) and never pass through here.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Handle to the transcript file.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
}

impl Transcript {
    /// Handle for an existing (or not yet written) transcript file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Install the global subscriber writing to stderr and `path`.
    ///
    /// `RUST_LOG` overrides the default `info` filter. If a subscriber is
    /// already installed the existing one is kept.
    pub fn init(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;

        let writer = std::io::stderr.and(Arc::new(file));
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .try_init()
            .is_err()
        {
            eprintln!("Warning: logger already initialized; transcript may be incomplete");
        }

        tracing::info!("Transcript: {}", path.display());
        Ok(Self::at(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last `n` lines of the transcript (fewer if it is shorter).
    pub fn tail(&self, n: usize) -> Vec<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => tail_lines(&content, n),
            Err(_) => Vec::new(),
        }
    }

    /// Copy the transcript to `root/relative`, creating parent directories.
    pub fn copy_into(&self, root: &Path, relative: &Path) -> Result<PathBuf> {
        let dest = root.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::copy(&self.path, &dest).with_context(|| {
            format!(
                "Failed to copy transcript {} to {}",
                self.path.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }
}

/// Last `n` lines of `content`.
pub fn tail_lines(content: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

/// Touch a file so it can be copied even if nothing was logged.
pub fn ensure_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    }
    Ok(())
}
