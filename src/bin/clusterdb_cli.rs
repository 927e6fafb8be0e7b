use std::{
    error::Error,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use clap::Parser;
use log::{error, info};

use clusterdb::{
    Command, CommandError, PromptError, StorageEngine, StoreConfig, VersionedStore,
    config::{DEFAULT_MAX_ARENA_SIZE, DEFAULT_MAX_FANOUT},
    prompt,
    storage::FileBackend,
};

const DATABASE_NAME: &str = "cluster.db";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to storage directory
    path: PathBuf,
    /// Entries a cluster node holds before it splits
    #[arg(long, default_value_t = DEFAULT_MAX_FANOUT)]
    max_fanout: usize,
    /// Upper bound of the store file in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_ARENA_SIZE)]
    max_arena_size: u64,
    /// Keep freed space until the next version instead of backdating it
    #[arg(long)]
    no_backdating: bool,
}

type SharedStore = Arc<Mutex<Option<VersionedStore<FileBackend>>>>;

fn close(store: &SharedStore) {
    let taken = match store.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(store) = taken {
        match store.close() {
            Ok(_) => info!("store closed"),
            Err(e) => eprintln!("failed to safely close database. error: {e}"),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    if !cli.path.is_dir() {
        return Err(format!("'{}' is not a directory", cli.path.display()).into());
    }

    let config = StoreConfig::default()
        .with_fanout(cli.max_fanout)
        .with_max_arena_size(cli.max_arena_size)
        .with_backdating(!cli.no_backdating);
    let store: SharedStore = Arc::new(Mutex::new(Some(VersionedStore::open(
        cli.path.join(DATABASE_NAME),
        config,
    )?)));

    let handle = Arc::clone(&store);
    ctrlc::set_handler(move || {
        close(&handle);
        std::process::exit(0);
    })?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(cmd) => cmd,
            Err(PromptError::Eof) => break,
            Err(PromptError::Command(CommandError::Empty)) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };
        if cmd == Command::Exit {
            break;
        }

        let guard = match store.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("store lock poisoned");
                break;
            }
        };
        let Some(db) = guard.as_ref() else {
            break;
        };
        match db.execute(cmd) {
            Ok(None) => {}
            Ok(Some(out)) => println!("{out}"),
            Err(e) => eprintln!("query error: {e}"),
        }
    }

    close(&store);
    Ok(())
}
