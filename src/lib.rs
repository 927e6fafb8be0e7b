pub mod cli;
pub mod command;
pub mod config;
pub mod statement;
pub mod storage;

pub use cli::{PromptError, prompt};
pub use command::{Command, CommandError};
pub use config::{StoreConfig, WritePolicy};
pub use statement::Statement;
pub use storage::{StorageEngine, StorageError, VersionedStore};
