//! Type-safe external tool argument contracts.
//!
//! Every external command the installer runs (`sgdisk`, `cryptsetup`,
//! `systemd-cryptenroll`, `mount`, the materializer, ...) is described by a
//! struct implementing [`ToolArgs`]. The struct definition is the contract:
//! flag spelling lives in exactly one place and secrets only ever appear as
//! key file paths, never as argument values.

/// Trait for typed tool arguments.
///
/// # Contract
///
/// - `program()`: executable name, resolved through `PATH` at spawn time.
/// - `to_cli_args()`: arguments exactly as the tool expects them.
/// - `get_env_vars()`: extra environment for the tool.
/// - `is_destructive()`: true if the tool can destroy data on the target.
///
/// # Invariants
///
/// - Returned arguments MUST NOT contain secret material.
pub trait ToolArgs {
    /// Executable name (e.g. `"cryptsetup"`).
    fn program(&self) -> &str;

    /// Convert struct fields to CLI arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Environment variables the tool requires.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![]
    }

    /// Whether running this tool can destroy data.
    fn is_destructive(&self) -> bool {
        false
    }

    /// One-line rendering for logs.
    fn describe(&self) -> String {
        let args = self.to_cli_args();
        if args.is_empty() {
            self.program().to_string()
        } else {
            format!("{} {}", self.program(), args.join(" "))
        }
    }
}
