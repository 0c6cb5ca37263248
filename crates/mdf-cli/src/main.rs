//! # mdfstore CLI
//!
//! Operator command-line interface for the mdfstore upload backend.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mdf_config::{log_cli_info, Config};
use mdf_store::{FileInfo, MdfStore};

/// mdfstore - durable storage for resumable uploads
#[derive(Parser)]
#[command(name = "mdfstore")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Upload directory (overrides config and MDF_UPLOAD_DIR)
    #[arg(long, global = true)]
    upload_dir: Option<PathBuf>,

    /// Read configuration from this file only
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default configuration
    Init,

    /// Create a new upload and print its ID
    Create {
        /// Use this ID instead of generating one
        #[arg(long)]
        id: Option<String>,

        /// Declared total size in bytes
        #[arg(long, conflicts_with = "defer")]
        size: Option<u64>,

        /// Leave the size undeclared until `declare-length`
        #[arg(long)]
        defer: bool,

        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Append a file (or stdin) to an upload
    Write {
        id: String,

        /// Source file, `-` for stdin
        #[arg(value_name = "FILE", default_value = "-")]
        file: PathBuf,
    },

    /// Print the upload's metadata record as JSON
    Info { id: String },

    /// Copy the upload's content to stdout or a file
    Read {
        id: String,

        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },

    /// Fix the total size of a deferred-length upload
    DeclareLength { id: String, length: u64 },

    /// Show whether an upload is locked, or hold its lock while a command runs
    Lock {
        id: String,

        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Remove a lock left behind by a holder that is gone
    Unlock { id: String },

    /// Append finished uploads, in order, to a destination upload
    Concat {
        dest: String,

        #[arg(required = true)]
        sources: Vec<String>,
    },

    /// Run the post-processing converter over a finished upload
    Finish { id: String },

    /// Delete an upload
    Terminate { id: String },

    /// List the capabilities the store offers to a protocol layer
    Capabilities,
}

fn parse_meta(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => mdf_config::config().clone(),
    };

    if let Some(dir) = &cli.upload_dir {
        config.storage.upload_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    mdf_config::logging::init_logging(config.logging.level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async_main(cli.command, config))
}

async fn async_main(command: Commands, config: Config) -> Result<()> {
    let store = MdfStore::from_config(&config).context("Failed to open upload directory")?;
    log_cli_info!(
        "Using upload directory",
        root = tracing::field::display(store.root().display())
    );

    match command {
        Commands::Init => {
            print!("{}", Config::default_toml());
            Ok(())
        }
        Commands::Create {
            id,
            size,
            defer,
            meta,
        } => cmd_create(&store, id, size, defer, meta),
        Commands::Write { id, file } => cmd_write(&store, &id, &file),
        Commands::Info { id } => {
            let info = store.get_info(&id)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Read { id, out } => cmd_read(&store, &id, out),
        Commands::DeclareLength { id, length } => {
            store.declare_length(&id, length)?;
            println!("{}: size {}", id, length);
            Ok(())
        }
        Commands::Lock { id, command } => cmd_lock(&store, &id, &command).await,
        Commands::Unlock { id } => {
            store.unlock_upload(&id)?;
            println!("{}: unlocked", id);
            Ok(())
        }
        Commands::Concat { dest, sources } => {
            let copied = store.concat_uploads(&dest, &sources)?;
            println!("{}: appended {} bytes from {} uploads", dest, copied, sources.len());
            Ok(())
        }
        Commands::Finish { id } => cmd_finish(&store, &id).await,
        Commands::Terminate { id } => {
            store.terminate(&id)?;
            println!("{}: terminated", id);
            Ok(())
        }
        Commands::Capabilities => {
            for name in store.capabilities() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn cmd_create(
    store: &MdfStore,
    id: Option<String>,
    size: Option<u64>,
    defer: bool,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let mut info = match (size, defer) {
        (Some(size), _) => FileInfo::with_size(size),
        (None, true) => FileInfo::deferred(),
        (None, false) => bail!("either --size or --defer is required"),
    };
    if let Some(id) = id {
        info = info.with_id(id);
    }
    info.metadata.extend(meta);

    let id = store.new_upload(info)?;
    println!("{}", id);
    Ok(())
}

fn cmd_write(store: &MdfStore, id: &str, file: &Path) -> Result<()> {
    let offset = store.get_info(id)?.offset;
    let written = if file.as_os_str() == "-" {
        store.write_chunk(id, offset, io::stdin().lock())?
    } else {
        let src = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
        store.write_chunk(id, offset, src)?
    };

    println!("{}: wrote {} bytes (offset {})", id, written, offset + written);
    Ok(())
}

fn cmd_read(store: &MdfStore, id: &str, out: Option<PathBuf>) -> Result<()> {
    let mut reader = store.get_reader(id)?;
    match out {
        Some(path) => {
            let mut dest =
                File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            io::copy(&mut reader, &mut dest)?;
            dest.sync_all()?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn cmd_lock(store: &MdfStore, id: &str, command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        let state = if store.locks().is_locked(id)? {
            "locked"
        } else {
            "free"
        };
        println!("{}: {}", id, state);
        return Ok(());
    };

    store.lock_upload(id)?;
    log_cli_info!("Holding lock", id = id, program = program.as_str());

    let status = tokio::process::Command::new(program)
        .args(args)
        .env("MDF_UPLOAD_ID", id)
        .status()
        .await;

    store.unlock_upload(id)?;

    let status = status.with_context(|| format!("Failed to run {}", program))?;
    if !status.success() {
        bail!("{} exited with {}", program, status);
    }
    Ok(())
}

async fn cmd_finish(store: &MdfStore, id: &str) -> Result<()> {
    // make sure the upload exists even when no converter is configured
    store.get_info(id)?;

    match store.finish_upload(id).await? {
        Some(report) => println!(
            "{}: converter exited with {} ({} stdout lines, {} stderr lines)",
            id, report.status, report.stdout_lines, report.stderr_lines
        ),
        None => println!("{}: finished (no converter configured)", id),
    }
    Ok(())
}
