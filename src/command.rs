//! High-level command module for the debug shell.
//!
//! This module defines the [`Command`] enum, which encapsulates one line of
//! user input: either a data [`Statement`] or a dot-command inspecting the
//! store. Commands are executed through
//! [`StorageEngine::execute`](crate::storage::StorageEngine::execute).
//!
//! # Example
//! ```rust
//! use clusterdb::{Command, Statement};
//!
//! let cmd: Command = "scan people".try_into().unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Statement(Statement::Scan { table: "people".into() })
//! );
//! ```
use thiserror::Error;

use crate::statement::{Statement, StatementError};

/// List of possible error that a command can throw.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("invalid statement, {0}")]
    InvalidStatement(#[from] StatementError),

    #[error("no command provided")]
    Empty,
}

/// High-level user supplied commands to execute on a StorageEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Data statement, run in its own transaction.
    Statement(Statement),
    /// Lists every table of the current version.
    Tables,
    /// Dumps the cluster tree of a table.
    Structure(String),
    /// Adds `count` generated objects to a table, creating it if needed.
    Populate { table: String, count: usize },
    /// Prints version and arena statistics.
    Stats,
    /// Runs a reclaim pass.
    Reclaim,
    /// Closes the store and terminates the shell.
    Exit,
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let parts = value.split_whitespace().collect::<Vec<&str>>();

        match parts.as_slice() {
            [] => Err(CommandError::Empty),
            [".exit"] => Ok(Command::Exit),
            [".tables"] => Ok(Command::Tables),
            [".stats"] => Ok(Command::Stats),
            [".reclaim"] => Ok(Command::Reclaim),
            [".structure", table] => Ok(Command::Structure(table.to_string())),
            [".structure", ..] => Err(CommandError::InvalidCommandArguments {
                command: ".structure".to_string(),
                reason: "requires a table name. Example: .structure people".to_string(),
            }),
            [".populate", table, count] => {
                let count = count.parse::<usize>().map_err(|_| {
                    CommandError::InvalidCommandArguments {
                        command: ".populate".to_string(),
                        reason: "invalid integer argument; argument should be a non-negative number."
                            .to_string(),
                    }
                })?;
                Ok(Command::Populate {
                    table: table.to_string(),
                    count,
                })
            }
            [".populate", ..] => Err(CommandError::InvalidCommandArguments {
                command: ".populate".to_string(),
                reason: "requires a table and a number of records. Example: .populate people 10"
                    .to_string(),
            }),
            [s, ..] if s.starts_with('.') => {
                Err(CommandError::UnrecognizedCommand(value.trim().to_string()))
            }
            _ => Ok(Command::Statement(Statement::try_from(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::ObjectKey;

    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            (".tables", Command::Tables),
            (".stats", Command::Stats),
            (".reclaim", Command::Reclaim),
            (".structure people", Command::Structure("people".to_string())),
            (
                ".populate people 10",
                Command::Populate {
                    table: "people".to_string(),
                    count: 10,
                },
            ),
            (
                "get people 3",
                Command::Statement(Statement::Get {
                    table: "people".to_string(),
                    key: ObjectKey::new(3),
                }),
            ),
        ];

        for (cmd, expected) in inputs {
            let command: Command = cmd.try_into().unwrap();
            assert_eq!(command, expected);
        }
    }

    #[test]
    #[should_panic(expected = "UnrecognizedCommand")]
    fn unrecognized_command() {
        let _: Command = ".something_wrong".try_into().unwrap();
    }

    #[test]
    fn populate_needs_count() {
        assert!(matches!(
            Command::try_from(".populate people"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
        assert!(matches!(
            Command::try_from(".populate people -3"),
            Err(CommandError::InvalidCommandArguments { .. })
        ));
    }

    #[test]
    fn statement_errors_are_wrapped() {
        assert_eq!(
            Command::try_from("upsert people 1 x"),
            Err(CommandError::InvalidStatement(StatementError::Unsupported(
                "upsert people 1 x".to_string()
            )))
        );
        assert_eq!(Command::try_from(""), Err(CommandError::Empty));
    }
}
