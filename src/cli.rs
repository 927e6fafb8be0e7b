//! CLI utilities for clusterdb.
//!
//! The utilities present in this module drive the interactive debug shell.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::command::{Command, CommandError};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("end of input")]
    Eof,
}

/// Prompt user for a valid command.
///
/// Returns [`PromptError::Eof`] once the reader is exhausted.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Err(PromptError::Eof);
    }

    Ok(Command::try_from(s.as_str())?)
}
