//! Data statements understood by the debug shell.
//!
//! A statement names its table by name; the engine resolves the name against
//! the version it runs on.
use thiserror::Error;

use crate::storage::ObjectKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `create <table>`
    CreateTable { table: String },
    /// `drop <table>`
    DropTable { table: String },
    /// `insert <table> <key> <value>`
    Insert {
        table: String,
        key: ObjectKey,
        value: String,
    },
    /// `add <table> <value>`: insert under the next unused key.
    Add { table: String, value: String },
    /// `get <table> <key>`
    Get { table: String, key: ObjectKey },
    /// `erase <table> <key>`
    Erase { table: String, key: ObjectKey },
    /// `scan <table>`
    Scan { table: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("'{statement}' expects: {usage}")]
    Usage {
        statement: String,
        usage: &'static str,
    },

    #[error("'{0}' is not an object key")]
    InvalidKey(String),
}

fn usage(statement: &str) -> &'static str {
    match statement {
        "create" => "create <table>",
        "drop" => "drop <table>",
        "insert" => "insert <table> <key> <value>",
        "add" => "add <table> <value>",
        "get" => "get <table> <key>",
        "erase" => "erase <table> <key>",
        _ => "scan <table>",
    }
}

fn parse_key(s: &str) -> Result<ObjectKey, StatementError> {
    s.parse::<i64>()
        .map(ObjectKey::new)
        .map_err(|_| StatementError::InvalidKey(s.to_string()))
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let parts = value.split_whitespace().collect::<Vec<&str>>();
        let Some(kind) = parts.first() else {
            return Err(StatementError::EmptyStatement);
        };
        let kind = kind.to_lowercase();

        let expect = |count: usize| {
            if parts.len() < count {
                Err(StatementError::Usage {
                    statement: kind.clone(),
                    usage: usage(&kind),
                })
            } else {
                Ok(())
            }
        };
        // values may contain spaces
        let rest = |from: usize| parts[from..].join(" ");

        match kind.as_str() {
            "create" => {
                expect(2)?;
                Ok(Statement::CreateTable {
                    table: parts[1].to_string(),
                })
            }
            "drop" => {
                expect(2)?;
                Ok(Statement::DropTable {
                    table: parts[1].to_string(),
                })
            }
            "insert" => {
                expect(4)?;
                Ok(Statement::Insert {
                    table: parts[1].to_string(),
                    key: parse_key(parts[2])?,
                    value: rest(3),
                })
            }
            "add" => {
                expect(3)?;
                Ok(Statement::Add {
                    table: parts[1].to_string(),
                    value: rest(2),
                })
            }
            "get" => {
                expect(3)?;
                Ok(Statement::Get {
                    table: parts[1].to_string(),
                    key: parse_key(parts[2])?,
                })
            }
            "erase" => {
                expect(3)?;
                Ok(Statement::Erase {
                    table: parts[1].to_string(),
                    key: parse_key(parts[2])?,
                })
            }
            "scan" => {
                expect(2)?;
                Ok(Statement::Scan {
                    table: parts[1].to_string(),
                })
            }
            _ => Err(StatementError::Unsupported(value.trim().to_string())),
        }
    }
}
