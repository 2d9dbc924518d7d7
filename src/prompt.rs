//! Operator input channel
//!
//! Prompts go straight to the controlling terminal, not through stdout or
//! the logger, so transcript writes on stderr never interleave with what
//! the operator is typing. End of input is treated as cancellation.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};

use zeroize::Zeroizing;

use crate::error::{InstallError, Result};

/// Interactive question/answer channel.
pub trait Prompter {
    /// Show `prompt` and read one line (without the newline).
    fn ask(&mut self, prompt: &str) -> Result<String>;

    /// Read a secret without echo.
    fn ask_secret(&mut self, prompt: &str) -> Result<Zeroizing<String>>;

    /// Show an informational message.
    fn say(&mut self, message: &str) -> Result<()>;
}

/// Prompter bound to `/dev/tty`.
pub struct TtyPrompter {
    reader: BufReader<File>,
    writer: File,
}

impl TtyPrompter {
    pub fn open() -> Result<Self> {
        let tty = OpenOptions::new().read(true).write(true).open("/dev/tty")?;
        let writer = tty.try_clone()?;
        Ok(Self {
            reader: BufReader::new(tty),
            writer,
        })
    }
}

impl Prompter for TtyPrompter {
    fn ask(&mut self, prompt: &str) -> Result<String> {
        write!(self.writer, "{} ", prompt)?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(InstallError::Cancelled);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn ask_secret(&mut self, prompt: &str) -> Result<Zeroizing<String>> {
        match rpassword::prompt_password(format!("{} ", prompt)) {
            Ok(secret) => Ok(Zeroizing::new(secret)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(InstallError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn say(&mut self, message: &str) -> Result<()> {
        writeln!(self.writer, "{}", message)?;
        Ok(())
    }
}

/// Prompter replaying a fixed list of answers; records everything shown.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub shown: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            shown: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }

    fn next(&mut self, prompt: &str) -> Result<String> {
        self.shown.push(prompt.to_string());
        self.answers.pop_front().ok_or(InstallError::Cancelled)
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, prompt: &str) -> Result<String> {
        self.next(prompt)
    }

    fn ask_secret(&mut self, prompt: &str) -> Result<Zeroizing<String>> {
        self.next(prompt).map(Zeroizing::new)
    }

    fn say(&mut self, message: &str) -> Result<()> {
        self.shown.push(message.to_string());
        Ok(())
    }
}
