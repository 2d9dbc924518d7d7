//! Recovery credential extraction from enrollment output
//!
//! `systemd-cryptenroll --recovery-key` prints the key between prose, often
//! decorated (an emoji prefix, indentation), and the wording differs across
//! versions. Parsing is two-tier:
//!
//! 1. Structured: a line (or token) that is entirely a grouped credential,
//!    either alphanumeric groups joined by `-` or numeric groups joined by
//!    `-` or spaces, every group the same width.
//! 2. Marker: the first non-empty line after a known marker phrase, accepted
//!    only if it is a single token of plausible length. The tool writes its
//!    prose to stderr and the key to stdout, so a marker seen on stderr
//!    points at the first non-empty stdout line.
//!
//! A miss returns `None`; the caller keeps the bootstrap secret.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use zeroize::Zeroizing;

static ALNUM_GROUPS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]{4,8}(?:-[A-Za-z0-9]{4,8}){3,}$").expect("static pattern")
});

static NUMERIC_GROUPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{3,8}(?:[- ][0-9]{3,8}){3,}$").expect("static pattern"));

/// Lowercase phrases after which the credential is printed.
const MARKERS: &[&str] = &[
    "secret recovery key",
    "recovery key has been generated",
    "recovery key:",
    "recovery passphrase",
];

const MIN_MARKER_TOKEN_LEN: usize = 16;

/// Which tier produced the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedBy {
    Structured,
    Marker,
}

/// A parsed recovery credential. Never printed by `Debug`.
#[derive(Clone)]
pub struct RecoveryCredential {
    value: Zeroizing<String>,
    pub parsed_by: ParsedBy,
}

impl RecoveryCredential {
    pub fn new(value: impl Into<String>, parsed_by: ParsedBy) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            parsed_by,
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for RecoveryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryCredential")
            .field("value", &"<redacted>")
            .field("parsed_by", &self.parsed_by)
            .finish()
    }
}

/// Extract the recovery credential from the enrollment tool's two streams.
pub fn parse_recovery_output(stdout: &str, stderr: &str) -> Option<RecoveryCredential> {
    parse_structured(stdout)
        .or_else(|| parse_structured(stderr))
        .map(|v| RecoveryCredential::new(v, ParsedBy::Structured))
        .or_else(|| {
            parse_after_marker(stdout, stderr).map(|v| RecoveryCredential::new(v, ParsedBy::Marker))
        })
}

fn trim_decoration(s: &str) -> &str {
    s.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}

fn uniform_groups(candidate: &str) -> bool {
    let mut widths = candidate
        .split(|c: char| c == '-' || c == ' ')
        .map(str::len);
    match widths.next() {
        Some(first) => widths.all(|w| w == first),
        None => false,
    }
}

fn parse_structured(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = trim_decoration(line);
        if line.is_empty() {
            continue;
        }

        if NUMERIC_GROUPS.is_match(line) && uniform_groups(line) {
            return Some(line.to_string());
        }

        for token in line.split_whitespace().map(trim_decoration) {
            if ALNUM_GROUPS.is_match(token) && uniform_groups(token) {
                return Some(token.to_string());
            }
        }
    }
    None
}

fn is_marker(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

fn plausible_token(line: &str) -> Option<String> {
    (line.len() >= MIN_MARKER_TOKEN_LEN && !line.contains(char::is_whitespace))
        .then(|| line.to_string())
}

fn first_content_line<'a>(mut lines: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    lines.find_map(|l| Some(trim_decoration(l)).filter(|l| !l.is_empty()))
}

fn parse_after_marker(stdout: &str, stderr: &str) -> Option<String> {
    if stderr.lines().any(is_marker) {
        if let Some(token) = first_content_line(stdout.lines()).and_then(plausible_token) {
            return Some(token);
        }
    }

    let mut lines = stdout.lines();
    lines.find(|l| is_marker(l))?;
    first_content_line(lines).and_then(plausible_token)
}
