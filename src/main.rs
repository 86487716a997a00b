//! cryptsync - Encrypted mirror of a directory tree
//!
//! Usage:
//!   cryptsync init --source <dir> --destination <dir>  - Create a configuration
//!   cryptsync watch                                     - Queue source changes until Ctrl-C
//!   cryptsync ls [path]                                 - List the encrypted tree
//!   cryptsync cat <path>                                - Print a decrypted file
//!   cryptsync put <file> [dir]                          - Store a local file encrypted
//!   cryptsync mkdir <path>                              - Create a directory
//!   cryptsync rm <path>                                 - Remove a file or directory

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cryptsync::{
    config::{Config, LoggingConfig},
    crypto::CrypterParams,
    metadata::MetaIndex,
    sync::SyncContext,
    task::{Task, TaskRunner},
    vfs::{Container, CryptedFileSystem, Directory, File, FileSystem},
};
use rand::RngCore;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "cryptsync")]
#[command(author = "cryptsync Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted mirror of a directory tree")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read the encryption password from this file
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a configuration and an empty encrypted destination
    Init {
        /// Plaintext directory to mirror
        #[arg(long)]
        source: PathBuf,

        /// Directory holding the encrypted mirror
        #[arg(long)]
        destination: PathBuf,

        /// PBKDF2 iteration count
        #[arg(long)]
        iterations: Option<u32>,

        /// Salt as hex (random when omitted)
        #[arg(long)]
        salt_hex: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Watch the source and drain queued changes until interrupted
    Watch,

    /// List the encrypted tree
    Ls {
        /// Logical directory to list
        #[arg(default_value = "/")]
        path: String,
    },

    /// Decrypt a file to stdout
    Cat {
        /// Logical file path
        path: String,
    },

    /// Encrypt a local file into the destination
    Put {
        /// Local file to store
        file: PathBuf,

        /// Logical directory to store it in (created if missing)
        #[arg(default_value = "/")]
        dir: String,

        /// Logical file name (defaults to the local name)
        #[arg(long)]
        name: Option<String>,

        /// Store content without a per-file key
        #[arg(long)]
        plain: bool,
    },

    /// Create a directory (and missing parents)
    Mkdir {
        /// Logical directory path
        path: String,
    },

    /// Remove a file or directory
    Rm {
        /// Logical path
        path: String,
    },
}

/// Task runner for `watch`: reports each change
struct LoggingRunner;

impl TaskRunner for LoggingRunner {
    fn run(&mut self, task: &Task) -> cryptsync::Result<()> {
        info!("Change: {}", task);
        Ok(())
    }
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    // Logging settings come from the config when there is one
    let logging = Config::load(&config_path)
        .map(|c| c.logging)
        .unwrap_or_default();

    if let Err(e) = init_logging(cli.verbose, &logging) {
        eprintln!("Failed to set up logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run_command(cli.command, &config_path, cli.password_file.as_deref()) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;

            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            // stdout is reserved for command output
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

fn run_command(
    command: Commands,
    config_path: &Path,
    password_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Init {
            source,
            destination,
            iterations,
            salt_hex,
            force,
        } => cmd_init(
            config_path,
            password_file,
            source,
            destination,
            iterations,
            salt_hex,
            force,
        ),

        Commands::Watch => cmd_watch(config_path, password_file),

        Commands::Ls { path } => cmd_ls(config_path, password_file, &path),

        Commands::Cat { path } => cmd_cat(config_path, password_file, &path),

        Commands::Put {
            file,
            dir,
            name,
            plain,
        } => cmd_put(config_path, password_file, &file, &dir, name, plain),

        Commands::Mkdir { path } => cmd_mkdir(config_path, password_file, &path),

        Commands::Rm { path } => cmd_rm(config_path, password_file, &path),
    }
}

fn cmd_init(
    config_path: &Path,
    password_file: Option<&Path>,
    source: PathBuf,
    destination: PathBuf,
    iterations: Option<u32>,
    salt_hex: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    info!("Initializing cryptsync...");

    if config_path.exists() && !force {
        bail!(
            "Configuration {:?} already exists (use --force to overwrite)",
            config_path
        );
    }

    let mut config = Config {
        source,
        destination,
        ..Default::default()
    };

    if let Some(iterations) = iterations {
        config.encryption.iterations = iterations;
    }

    config.encryption.salt = match salt_hex {
        Some(hex_salt) => hex::decode(hex_salt.trim()).context("Salt must be hex encoded")?,
        None => {
            let mut salt = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut salt);
            salt
        }
    };

    config.validate()?;
    config.ensure_directories()?;

    let password = read_password(password_file, true)?;
    let ctx = SyncContext::from_config(&config, password.as_bytes())?;

    // An empty root index pins the password to the destination
    let destination = ctx.destination();
    let root = destination.root_directory();
    if MetaIndex::read_from(root, destination.crypter())
        .context("Destination already holds an index for a different password")?
        .is_none()
    {
        destination.save_index(root, &MetaIndex::new())?;
    }

    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Source: {:?}", config.source);
    info!("Destination: {:?}", config.destination);
    Ok(())
}

fn cmd_watch(config_path: &Path, password_file: Option<&Path>) -> anyhow::Result<()> {
    let (config, ctx) = open_context(config_path, password_file)?;

    ctx.events()
        .on_lifecycle(|signal| info!("Sync context {:?}", signal));
    ctx.start()?;

    let interval = Duration::from_millis(config.sync.drain_interval_ms);
    let mut runner = LoggingRunner;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    runtime.block_on(async {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ctx.drain(&mut runner)?;
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupted, stopping...");
                    break;
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    })?;

    ctx.stop()?;
    let report = ctx.drain(&mut runner)?;
    if report.executed() > 0 {
        info!("Final drain: {} tasks", report.executed());
    }
    ctx.dispose();
    Ok(())
}

fn cmd_ls(config_path: &Path, password_file: Option<&Path>, path: &str) -> anyhow::Result<()> {
    let (_, ctx) = open_context(config_path, password_file)?;

    with_container(ctx.destination(), &split_path(path), false, |container| {
        println!("{}", container.logical_path());
        print_tree(container, 1);
        Ok(())
    })
}

fn cmd_cat(config_path: &Path, password_file: Option<&Path>, path: &str) -> anyhow::Result<()> {
    let (_, ctx) = open_context(config_path, password_file)?;
    let (parent, name) = split_file_path(path)?;

    with_container(ctx.destination(), &parent, false, |container| {
        let file = container
            .find_file(name)
            .with_context(|| format!("No such file: {}", path))?;

        let stdout = io::stdout();
        let mut out = stdout.lock();
        file.copy_to(&mut out)?;
        out.flush()?;
        Ok(())
    })
}

fn cmd_put(
    config_path: &Path,
    password_file: Option<&Path>,
    local: &Path,
    dir: &str,
    name: Option<String>,
    plain: bool,
) -> anyhow::Result<()> {
    let (config, ctx) = open_context(config_path, password_file)?;

    let name = match name {
        Some(name) => name,
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{:?} has no file name", local))?,
    };
    let mut src = fs::File::open(local).with_context(|| format!("Failed to open {:?}", local))?;

    with_container(ctx.destination(), &split_path(dir), true, |container| {
        // Existing files keep their key
        let file = match container.find_file(&name) {
            Some(file) => file,
            None => {
                let key = if plain {
                    None
                } else {
                    Some(CrypterParams::generate(Some(config.encryption.iterations))?)
                };
                container.create_file(&name, key)?
            }
        };

        let written = file.write_from(&mut src)?;
        info!("Stored {} ({} bytes)", file.path(), written);
        Ok(())
    })
}

fn cmd_mkdir(config_path: &Path, password_file: Option<&Path>, path: &str) -> anyhow::Result<()> {
    let (_, ctx) = open_context(config_path, password_file)?;
    let parts = split_path(path);
    if parts.is_empty() {
        bail!("A directory name is required");
    }

    with_container(ctx.destination(), &parts, true, |container| {
        info!("Directory {} ready", container.logical_path());
        Ok(())
    })
}

fn cmd_rm(config_path: &Path, password_file: Option<&Path>, path: &str) -> anyhow::Result<()> {
    let (_, ctx) = open_context(config_path, password_file)?;
    let (parent, name) = split_file_path(path)?;

    with_container(ctx.destination(), &parent, false, |container| {
        if !container.remove(name)? {
            bail!("No such file or directory: {}", path);
        }
        Ok(())
    })
}

/// Load the configuration and open a context, checking the password against
/// the destination's root index
fn open_context(
    config_path: &Path,
    password_file: Option<&Path>,
) -> anyhow::Result<(Config, SyncContext)> {
    let config = Config::load(config_path).with_context(|| {
        format!(
            "Failed to load {:?} (run 'cryptsync init' first)",
            config_path
        )
    })?;

    let password = read_password(password_file, false)?;
    let ctx = SyncContext::from_config(&config, password.as_bytes())?;

    let destination = ctx.destination();
    destination
        .load_index(destination.root_directory())
        .context("Cannot read the destination index (wrong password?)")?;

    Ok((config, ctx))
}

/// Password from a file, `CRYPTSYNC_PASSWORD`, or an interactive prompt
fn read_password(password_file: Option<&Path>, confirm: bool) -> anyhow::Result<Zeroizing<String>> {
    if let Some(path) = password_file {
        let content = Zeroizing::new(
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read password file {:?}", path))?,
        );
        return Ok(Zeroizing::new(content.trim().to_string()));
    }

    if let Ok(password) = std::env::var("CRYPTSYNC_PASSWORD") {
        return Ok(Zeroizing::new(password));
    }

    let password = Zeroizing::new(rpassword::prompt_password("Enter encryption password: ")?);
    if confirm {
        let again = Zeroizing::new(rpassword::prompt_password("Confirm encryption password: ")?);
        if *password != *again {
            bail!("Passwords do not match");
        }
    }
    Ok(password)
}

/// Run `f` on the crypted container at `parts`, optionally creating missing
/// directories on the way
fn with_container<T, F>(
    fs: &CryptedFileSystem,
    parts: &[&str],
    create: bool,
    f: F,
) -> anyhow::Result<T>
where
    F: FnOnce(&dyn Container) -> anyhow::Result<T>,
{
    descend(fs, parts, create, f)
}

fn descend<T, F>(container: &dyn Container, parts: &[&str], create: bool, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&dyn Container) -> anyhow::Result<T>,
{
    let Some((first, rest)) = parts.split_first() else {
        return f(container);
    };

    let child = if create {
        container.ensure_directory(first)?
    } else {
        container.find_directory(first).with_context(|| {
            format!(
                "No such directory: {}",
                join_logical(&container.logical_path(), first)
            )
        })?
    };
    descend(&child, rest, create, f)
}

fn print_tree(container: &dyn Container, depth: usize) {
    let indent = "  ".repeat(depth);
    for dir in container.directories() {
        println!("{}{}/", indent, dir.name());
        print_tree(&dir, depth + 1);
    }
    for file in container.files() {
        let marker = if file.entry().crypter.is_some() { "" } else { " (plain)" };
        println!("{}{}{}", indent, file.name(), marker);
    }
}

/// Logical path components, ignoring empty segments and `.`
fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect()
}

fn split_file_path(path: &str) -> anyhow::Result<(Vec<&str>, &str)> {
    let mut parts = split_path(path);
    match parts.pop() {
        Some(name) => Ok((parts, name)),
        None => bail!("A file name is required"),
    }
}

fn join_logical(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
