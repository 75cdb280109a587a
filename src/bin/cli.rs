//! ChainKV CLI
//!
//! Command-line access to a ChainKV database file.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use chainkv::{Config, Context, Database, HashFunction, KvError, StoreMode, Visit};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

/// ChainKV CLI
#[derive(Parser, Debug)]
#[command(name = "chainkv-cli")]
#[command(about = "Inspect and modify ChainKV database files")]
#[command(version)]
struct Args {
    /// Database file
    #[arg(short, long, default_value = "chainkv.db")]
    file: PathBuf,

    /// Hash chains when creating a file
    #[arg(long, default_value_t = chainkv::DEFAULT_HASH_SIZE)]
    hash_size: u32,

    /// Hash function when creating a file
    #[arg(long, value_enum, default_value_t = HashChoice::Classic)]
    hash: HashChoice,

    /// Use positional I/O instead of a memory map
    #[arg(long)]
    no_mmap: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HashChoice {
    Classic,
    Xxh3,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create (or reinitialize) the database file
    Create {
        /// Discard existing contents
        #[arg(long)]
        truncate: bool,
    },

    /// Store a value
    Store {
        key: String,
        value: String,

        /// Fail if the key already exists
        #[arg(long, conflicts_with = "replace")]
        insert: bool,

        /// Fail if the key does not exist
        #[arg(long)]
        replace: bool,
    },

    /// Print the value stored under a key
    Fetch { key: String },

    /// Delete a key
    Delete { key: String },

    /// Print every record as key<TAB>value
    Dump,

    /// Verify the structure of the file
    Check,

    /// Rewrite all records densely
    Repack,

    /// Remove every record
    Wipe,

    /// Show header information
    Info,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chainkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(match e {
            KvError::NotFound => 2,
            _ => 1,
        });
    }
}

fn run(args: Args) -> chainkv::Result<()> {
    let hash = match args.hash {
        HashChoice::Classic => HashFunction::Classic,
        HashChoice::Xxh3 => HashFunction::Xxh3,
    };
    let read_only = matches!(
        args.command,
        Commands::Fetch { .. } | Commands::Dump | Commands::Check | Commands::Info
    );

    let mut builder = Config::builder()
        .hash_size(args.hash_size)
        .hash(hash)
        .no_mmap(args.no_mmap)
        .create(matches!(args.command, Commands::Create { .. } | Commands::Store { .. }));
    if read_only {
        builder = builder.read_only();
    }
    if let Commands::Create { truncate } = args.command {
        builder = builder.truncate(truncate);
    }

    let context = Context::new();
    let mut db = context.open(&args.file, builder.build())?;

    match args.command {
        Commands::Create { .. } => {
            println!("{}: {} hash chains", args.file.display(), db.hash_size());
        }
        Commands::Store {
            key,
            value,
            insert,
            replace,
        } => {
            let mode = if insert {
                StoreMode::Insert
            } else if replace {
                StoreMode::Replace
            } else {
                StoreMode::Upsert
            };
            db.store(key.as_bytes(), value.as_bytes(), mode)?;
        }
        Commands::Fetch { key } => match db.fetch(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => return Err(KvError::NotFound),
        },
        Commands::Delete { key } => db.delete(key.as_bytes())?,
        Commands::Dump => dump(&mut db)?,
        Commands::Check => {
            db.check()?;
            println!("ok");
        }
        Commands::Repack => db.repack()?,
        Commands::Wipe => db.wipe_all()?,
        Commands::Info => {
            println!("file:        {}", args.file.display());
            println!("size:        {} bytes", db.file_len()?);
            println!("hash chains: {}", db.hash_size());
            println!("hash:        {}", db.hash_function().name());
            println!("byte order:  {:?}", db.byte_order());
            println!("records:     {}", db.allocated_records()?);
        }
    }
    db.close()
}

fn dump(db: &mut Database) -> chainkv::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut write_error = None;
    let count = db.traverse_read(|key, value| {
        match writeln!(
            out,
            "{}\t{}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        ) {
            Ok(()) => Visit::Continue,
            Err(e) => {
                write_error = Some(e);
                Visit::Stop
            }
        }
    })?;
    if let Some(e) = write_error {
        return Err(e.into());
    }
    tracing::debug!(records = count, "dump complete");
    Ok(())
}
