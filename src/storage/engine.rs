//! Command execution on top of a [`VersionedStore`].
//!
//! Every data statement runs in a transaction of its own: reads pin the
//! current version, writes commit immediately and report the version they
//! published.
use std::{fmt::Write, ops::ControlFlow};

use log::debug;

use super::{
    StorageError,
    backend::StorageBackend,
    keys::TableKey,
    store::{ReadHandle, VersionedStore, WriteHandle},
};
use crate::{command::Command, statement::Statement};

pub trait StorageEngine {
    type Error;

    /// Runs one command and returns the text to show for it, if any.
    fn execute(&self, command: Command) -> Result<Option<String>, Self::Error>;
}

fn read_table<B: StorageBackend>(
    r: &ReadHandle<'_, B>,
    name: &str,
) -> Result<TableKey, StorageError> {
    r.table_key(name)
        .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
}

fn write_table<B: StorageBackend>(
    w: &WriteHandle<'_, B>,
    name: &str,
) -> Result<TableKey, StorageError> {
    w.table_key(name)
        .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
}

impl<B: StorageBackend> VersionedStore<B> {
    fn run(&self, statement: Statement) -> Result<Option<String>, StorageError> {
        match statement {
            Statement::CreateTable { table } => {
                let mut w = self.begin_write()?;
                let key = w.create_table(&table)?;
                let version = w.commit()?;
                Ok(Some(format!("created {table} as {key} (version {version})")))
            }
            Statement::DropTable { table } => {
                let mut w = self.begin_write()?;
                let key = write_table(&w, &table)?;
                w.drop_table(key)?;
                let version = w.commit()?;
                Ok(Some(format!("dropped {table} (version {version})")))
            }
            Statement::Insert { table, key, value } => {
                let mut w = self.begin_write()?;
                let table = write_table(&w, &table)?;
                w.insert(table, key, value.into_bytes())?;
                let version = w.commit()?;
                Ok(Some(format!("inserted {key} (version {version})")))
            }
            Statement::Add { table, value } => {
                let mut w = self.begin_write()?;
                let table = write_table(&w, &table)?;
                let key = w.create_object(table, value.into_bytes())?;
                let version = w.commit()?;
                Ok(Some(format!("inserted {key} (version {version})")))
            }
            Statement::Get { table, key } => {
                let r = self.begin_read()?;
                let table = read_table(&r, &table)?;
                let values = r.get(table, key)?;
                Ok(Some(String::from_utf8_lossy(&values).into_owned()))
            }
            Statement::Erase { table, key } => {
                let mut w = self.begin_write()?;
                let table = write_table(&w, &table)?;
                w.erase(table, key)?;
                let version = w.commit()?;
                Ok(Some(format!("erased {key} (version {version})")))
            }
            Statement::Scan { table } => {
                let r = self.begin_read()?;
                let table = read_table(&r, &table)?;
                let mut out = String::default();
                r.iterate(table, |key, values| {
                    // writing into a String cannot fail
                    let _ = writeln!(out, "{key}: {}", String::from_utf8_lossy(values));
                    ControlFlow::Continue(())
                })?;
                out.push_str(&format!(
                    "({} objects, version {})",
                    r.size(table)?,
                    r.version()
                ));
                Ok(Some(out))
            }
        }
    }

    fn populate(&self, table: &str, count: usize) -> Result<Option<String>, StorageError> {
        let mut w = self.begin_write()?;
        let key = match w.table_key(table) {
            Some(key) => key,
            None => w.create_table(table)?,
        };
        for _ in 0..count {
            let next = w.size(key)?;
            w.create_object(key, format!("object-{next}").into_bytes())?;
        }
        let version = w.commit()?;
        debug!("populated {table} with {count} objects");
        Ok(Some(format!(
            "inserted {count} objects into {table} (version {version})"
        )))
    }
}

impl<B: StorageBackend> StorageEngine for VersionedStore<B> {
    type Error = StorageError;

    fn execute(&self, command: Command) -> Result<Option<String>, Self::Error> {
        match command {
            Command::Statement(statement) => self.run(statement),
            Command::Tables => {
                let r = self.begin_read()?;
                let mut out = String::default();
                for (key, name) in r.tables() {
                    // writing into a String cannot fail
                    let _ = writeln!(out, "{key} {name} ({} objects)", r.size(key)?);
                }
                Ok(Some(out.trim_end().to_string()))
            }
            Command::Structure(table) => {
                let r = self.begin_read()?;
                let key = read_table(&r, &table)?;
                Ok(Some(r.structure(key)?.trim_end().to_string()))
            }
            Command::Populate { table, count } => self.populate(&table, count),
            Command::Stats => {
                let stats = self.stats()?;
                Ok(Some(format!(
                    "version: {}\noldest reachable: {}\nreaders: {}\ntables: {}\narena: {} bytes ({} allocated, {} free)\npending frees: {}\ndirectory: {} bytes",
                    stats.version,
                    stats.oldest_reachable,
                    stats.readers,
                    stats.tables,
                    stats.arena_len,
                    stats.allocated_bytes,
                    stats.free_bytes,
                    stats.pending_frees,
                    stats.directory_bytes
                )))
            }
            Command::Reclaim => Ok(Some(format!("reclaimed {} regions", self.reclaim()?))),
            Command::Exit => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StoreConfig;

    use super::*;

    fn run(store: &VersionedStore, line: &str) -> Result<Option<String>, StorageError> {
        let command: Command = line.try_into().unwrap();
        store.execute(command)
    }

    fn store() -> VersionedStore {
        VersionedStore::in_memory(StoreConfig::default().with_fanout(4)).unwrap()
    }

    #[test]
    fn statements_round_trip_through_the_store() {
        let store = store();

        assert_eq!(
            run(&store, "create people").unwrap().unwrap(),
            "created people as t0 (version 1)"
        );
        run(&store, "insert people 4 Ada Lovelace").unwrap();
        assert_eq!(
            run(&store, "add people Grace").unwrap().unwrap(),
            "inserted 5 (version 3)"
        );
        assert_eq!(
            run(&store, "get people 4").unwrap().unwrap(),
            "Ada Lovelace"
        );
        assert_eq!(
            run(&store, "scan people").unwrap().unwrap(),
            "4: Ada Lovelace\n5: Grace\n(2 objects, version 3)"
        );

        run(&store, "erase people 4").unwrap();
        assert!(matches!(
            run(&store, "get people 4"),
            Err(StorageError::KeyNotFound(_))
        ));
    }

    #[test]
    fn unknown_table() {
        let store = store();
        assert!(matches!(
            run(&store, "scan nothing"),
            Err(StorageError::UnknownTable(name)) if name == "nothing"
        ));
        assert!(matches!(
            run(&store, "insert nothing 1 x"),
            Err(StorageError::UnknownTable(_))
        ));
    }

    #[test]
    fn populate_and_inspect() {
        let store = store();

        run(&store, ".populate people 30").unwrap();
        run(&store, ".populate people 5").unwrap();
        assert_eq!(
            run(&store, ".tables").unwrap().unwrap(),
            "t0 people (35 objects)"
        );

        let structure = run(&store, ".structure people").unwrap().unwrap();
        assert!(structure.starts_with("inner"));

        let stats = run(&store, ".stats").unwrap().unwrap();
        assert!(stats.starts_with("version: 2\n"));
        assert_eq!(
            run(&store, ".reclaim").unwrap().unwrap(),
            "reclaimed 0 regions"
        );
        assert_eq!(run(&store, ".exit").unwrap(), None);
    }

    #[test]
    fn drop_table_statement() {
        let store = store();
        run(&store, "create people").unwrap();
        run(&store, "drop people").unwrap();
        assert_eq!(run(&store, ".tables").unwrap().unwrap(), "");
        run(&store, "create people").unwrap();
        assert_eq!(
            run(&store, ".tables").unwrap().unwrap(),
            "t1 people (0 objects)"
        );
    }
}
