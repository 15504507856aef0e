#![deny(unsafe_code)]

//! stagebox CLI: runs the staging daemon and stages changes through it.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use stagebox_config::AppConfig;
use stagebox_core::ipc::ExecSpawner;
use stagebox_core::protocol::{DeleteOptions, Entry, Service, State, TagEntry, default_socket_path};
use stagebox_core::{Daemon, IpcClient, StagingStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// stagebox: stage configuration and secret changes in a per-user daemon.
#[derive(Parser)]
#[command(name = "stagebox", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect the staging daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Stage, inspect, and unstage changes for one account and region.
    Stage(StageArgs),

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Run the daemon in the foreground until it shuts down.
    Run {
        /// Socket to listen on instead of the configured one.
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Report whether a daemon is running. Never starts one.
    Status,

    /// Ask a running daemon to exit. Never starts one.
    Stop,
}

#[derive(Args)]
struct StageArgs {
    /// Account the staged changes belong to.
    #[arg(long)]
    account: String,

    /// Region the staged changes belong to.
    #[arg(long)]
    region: String,

    #[command(subcommand)]
    command: StageCommand,
}

#[derive(Subcommand)]
enum StageCommand {
    /// List staged changes.
    List {
        /// Only this service (`param` or `secret`).
        #[arg(long)]
        service: Option<Service>,
    },

    /// Print one staged change as JSON.
    Get {
        service: Service,
        name: String,
        /// Show the staged tag change instead of the value change.
        #[arg(long)]
        tag: bool,
    },

    /// Stage a new value. Reads it from stdin when omitted or `-`.
    Set {
        service: Service,
        name: String,
        value: Option<String>,
        /// Stage a create instead of an update.
        #[arg(long)]
        create: bool,
        #[arg(long)]
        description: Option<String>,
    },

    /// Stage a delete.
    Delete {
        service: Service,
        name: String,
        /// Skip the recovery window.
        #[arg(long)]
        force: bool,
        #[arg(long, conflicts_with = "force")]
        recovery_window_days: Option<u32>,
    },

    /// Stage tag additions and removals.
    Tag {
        service: Service,
        name: String,
        /// `KEY=VALUE` to add. Repeatable.
        #[arg(long = "add", value_parser = parse_tag)]
        add: Vec<(String, String)>,
        /// Tag key to remove. Repeatable.
        #[arg(long = "remove")]
        remove: Vec<String>,
    },

    /// Drop one staged change.
    Unstage {
        service: Service,
        name: String,
        /// Drop the staged tag change instead of the value change.
        #[arg(long)]
        tag: bool,
    },

    /// Drop every staged change in this scope.
    Reset {
        #[arg(long)]
        service: Option<Service>,
    },

    /// Move this scope's staged changes into a file (owner-only permissions).
    Export {
        output: PathBuf,
        /// Copy instead of move.
        #[arg(long)]
        keep: bool,
    },

    /// Replace this scope's staged changes with the contents of a file.
    Import { input: PathBuf },
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).await?;
    config.apply_env_overrides();
    init_tracing(&config.logging.level, cli.verbose);

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommand::Run { socket } => cmd_daemon_run(config, socket).await?,
            DaemonCommand::Status => cmd_daemon_status(&client(&config, None)).await?,
            DaemonCommand::Stop => cmd_daemon_stop(&client(&config, None)).await?,
        },
        Commands::Stage(args) => {
            let client = Arc::new(client(&config, cli.config.as_deref()));
            let store = StagingStore::new(client, args.account, args.region);
            let mut stdout = std::io::stdout().lock();
            run_stage(&store, args.command, &mut stdout).await?;
        }
        Commands::Config { show } => cmd_config(&config, show)?,
    }

    Ok(())
}

fn init_tracing(level: &str, verbose: u8) {
    let filter = match verbose {
        0 => level,
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

/// A client for the configured socket. Auto-started daemons inherit the
/// config file so they resolve the same settings.
fn client(config: &AppConfig, config_path: Option<&Path>) -> IpcClient {
    let client = IpcClient::from_config(config);
    match config_path {
        Some(path) if config.client.auto_start => {
            client.with_spawner(ExecSpawner::new().with_config(path))
        }
        _ => client,
    }
}

async fn cmd_daemon_run(config: AppConfig, socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket
        .or_else(|| config.daemon.socket_path.as_deref().map(PathBuf::from))
        .unwrap_or_else(default_socket_path);

    info!(path = %socket_path.display(), "starting stagebox daemon");
    let reason = Daemon::new(config.daemon, &socket_path)
        .run()
        .await
        .context("daemon failed to start")?;
    info!(?reason, "stagebox daemon stopped");
    Ok(())
}

async fn cmd_daemon_status(client: &IpcClient) -> Result<()> {
    match client.ping().await {
        Ok(info) => {
            println!(
                "running: version {} pid {} uptime {}s ({})",
                info.version,
                info.pid,
                info.uptime_secs,
                client.socket_path().display()
            );
        }
        Err(e) if e.is_daemon_absent() => println!("not running"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_daemon_stop(client: &IpcClient) -> Result<()> {
    if client.shutdown_daemon().await? {
        println!("stopped");
    } else {
        println!("not running");
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration is valid.");
    }
    Ok(())
}

async fn run_stage(store: &StagingStore, command: StageCommand, out: &mut impl Write) -> Result<()> {
    match command {
        StageCommand::List { service } => {
            for (service, entries) in store.list_entries(service).await? {
                for (name, entry) in &entries {
                    writeln!(out, "{service}\t{name}\t{}", entry.operation)?;
                }
            }
            for (service, tags) in store.list_tags(service).await? {
                for (name, tag) in &tags {
                    writeln!(
                        out,
                        "{service}\t{name}\ttags +{} -{}",
                        tag.add.len(),
                        tag.remove.len()
                    )?;
                }
            }
        }
        StageCommand::Get { service, name, tag } => {
            let json = if tag {
                serde_json::to_string_pretty(&store.get_tag(service, &name).await?)?
            } else {
                serde_json::to_string_pretty(&store.get_entry(service, &name).await?)?
            };
            writeln!(out, "{json}")?;
        }
        StageCommand::Set {
            service,
            name,
            value,
            create,
            description,
        } => {
            let value = match value.filter(|v| v != "-") {
                Some(value) => value,
                None => read_stdin_value().await?,
            };
            let mut entry = if create {
                Entry::create(value)
            } else {
                Entry::update(value)
            };
            if let Some(description) = description {
                entry = entry.with_description(description);
            }
            store.stage_entry(service, &name, entry).await?;
        }
        StageCommand::Delete {
            service,
            name,
            force,
            recovery_window_days,
        } => {
            let entry = Entry::delete(DeleteOptions {
                force,
                recovery_window_days,
            });
            store.stage_entry(service, &name, entry).await?;
        }
        StageCommand::Tag {
            service,
            name,
            add,
            remove,
        } => {
            let mut tags = TagEntry::new();
            for (key, value) in add {
                tags = tags.add(key, value);
            }
            for key in remove {
                tags = tags.remove(key);
            }
            if tags.is_noop() {
                bail!("nothing to stage: pass --add or --remove");
            }
            store.stage_tag(service, &name, tags).await?;
        }
        StageCommand::Unstage { service, name, tag } => {
            if tag {
                store.unstage_tag(service, &name).await?;
            } else {
                store.unstage_entry(service, &name).await?;
            }
        }
        StageCommand::Reset { service } => store.unstage_all(service).await?,
        StageCommand::Export { output, keep } => {
            let state = store.drain(keep).await?;
            let json = serde_json::to_vec_pretty(&state)?;
            write_private_file(&output, &json).await?;
            writeln!(
                out,
                "exported {} entries and {} tag changes to {}",
                state.entry_count(),
                state.tag_count(),
                output.display()
            )?;
        }
        StageCommand::Import { input } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let state: State = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", input.display()))?;
            store.set_state(state).await?;
        }
    }
    Ok(())
}

async fn read_stdin_value() -> Result<String> {
    let mut value = String::new();
    tokio::io::stdin().read_to_string(&mut value).await?;
    Ok(trim_line_ending(value))
}

fn trim_line_ending(mut value: String) -> String {
    if value.ends_with('\n') {
        value.pop();
        if value.ends_with('\r') {
            value.pop();
        }
    }
    value
}

/// Write `bytes` to `path`, readable and writable by the owner only.
async fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    // An existing file keeps its mode on open.
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}
