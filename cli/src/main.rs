// peerstore — relay and endpoint command-line interface
//
// Runs a relay server, manages endpoint configurations, starts endpoints,
// and talks to a running endpoint through its local HTTP API.

mod api;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::{EndpointSettings, Home};
use peerstore_core::relay::{
    Authenticator, NullAuthenticator, RelayServer, RelayServerConfig, TokenAuthenticator,
};
use peerstore_core::Endpoint;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[derive(Parser)]
#[command(name = "peerstore")]
#[command(about = "PeerStore — owner-held objects exchanged over direct peer channels", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration home (default: <config dir>/peerstore)
    #[arg(long, global = true, env = "PEERSTORE_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or administer a relay server
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Manage and run endpoints
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },
    /// Operate on objects through a running endpoint
    Client {
        /// Configured endpoint whose API to use (default: the only one)
        #[arg(long, global = true)]
        via: Option<String>,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum RelayAction {
    /// Start a relay server
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:8700")]
        listen: String,
        /// Require tokens signed with this secret
        #[arg(long)]
        secret: Option<String>,
        #[arg(long, default_value = "peerstore")]
        audience: String,
        #[arg(long, default_value = "10000")]
        max_connections: usize,
        /// Seconds of silence after which a session may be replaced
        #[arg(long, default_value = "45")]
        stale_after: u64,
    },
    /// Issue a registration token for a relay started with --secret
    Token {
        #[arg(long)]
        secret: String,
        #[arg(long, default_value = "peerstore")]
        audience: String,
        #[arg(long)]
        user: String,
        /// Validity in seconds
        #[arg(long, default_value = "86400")]
        ttl: u64,
    },
}

#[derive(Subcommand)]
enum EndpointAction {
    /// Create or update an endpoint configuration
    Configure {
        name: String,
        /// Relay address (host:port); empty string for solo mode
        #[arg(long)]
        relay: Option<String>,
        /// Peer listener bind address
        #[arg(long)]
        listen: Option<String>,
        /// Comma-separated addresses offered to peers in addition to the listener
        #[arg(long)]
        advertise: Option<String>,
        /// Relay registration token
        #[arg(long)]
        credentials: Option<String>,
        #[arg(long)]
        api_port: Option<u16>,
        #[arg(long)]
        max_object_size: Option<usize>,
        /// Keep objects in memory only
        #[arg(long)]
        in_memory: Option<bool>,
        /// With --in-memory, bytes kept resident before least recently used objects spill to disk
        #[arg(long)]
        max_memory: Option<usize>,
    },
    /// Set a single configuration value
    Set {
        name: String,
        key: String,
        value: String,
    },
    /// List configured endpoints
    List,
    /// Show one endpoint's configuration
    Show { name: String },
    /// Remove an endpoint and its stored objects
    Remove { name: String },
    /// Run an endpoint in the foreground
    Start { name: String },
    /// Stop a running endpoint
    Stop { name: String },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Fetch an object (key: <object-id> or <endpoint-uuid>/<object-id>)
    Get {
        key: String,
        /// Owning endpoint uuid, when the key is a bare object id
        #[arg(long)]
        endpoint: Option<String>,
        /// Write the bytes to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Store an object; prints its key
    Put {
        /// Object id (default: generated)
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        /// Read the bytes from a file
        #[arg(short, long, conflicts_with = "data")]
        file: Option<PathBuf>,
        /// Use this string as the bytes
        #[arg(short, long)]
        data: Option<String>,
    },
    /// Check whether an object exists
    Exists {
        key: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Evict an object (missing objects are not an error)
    Evict {
        key: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Show the running endpoint's identity
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = Home::resolve(cli.home)?;

    match cli.command {
        Commands::Relay { action } => cmd_relay(action).await,
        Commands::Endpoint { action } => cmd_endpoint(&home, action).await,
        Commands::Client { via, action } => {
            let _guard = init_logging("warn", None)?;
            cmd_client(&home, via, action).await
        }
    }
}

/// Install the global subscriber: stderr, plus `log_file` when given.
/// `RUST_LOG` overrides `default_level`.
fn init_logging(default_level: &str, log_file: Option<PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let dir = path.parent().context("Log file has no parent directory")?;
            let file_name = path.file_name().context("Log file has no name")?;
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr.and(file_writer))
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

async fn cmd_relay(action: RelayAction) -> Result<()> {
    match action {
        RelayAction::Serve {
            listen,
            secret,
            audience,
            max_connections,
            stale_after,
        } => {
            let _guard = init_logging("info", None)?;
            let authenticator: Arc<dyn Authenticator> = match &secret {
                Some(secret) => Arc::new(TokenAuthenticator::new(secret, audience.clone())),
                None => Arc::new(NullAuthenticator),
            };
            let config = RelayServerConfig {
                max_connections,
                session_stale_after: Duration::from_secs(stale_after),
                ..RelayServerConfig::default()
            };
            let server = Arc::new(RelayServer::with_authenticator(config, authenticator));
            let handle = Arc::clone(&server).start(&listen).await?;

            println!("{}", "PeerStore relay".bold());
            println!("  Listening: {}", handle.local_addr().to_string().bright_cyan());
            println!(
                "  Auth:      {}",
                if secret.is_some() {
                    format!("tokens (audience {})", audience).bright_yellow()
                } else {
                    "open".dimmed()
                }
            );
            println!();
            println!("Press {} to stop.", "Ctrl+C".bright_green());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            let stats = server.get_stats();
            handle.shutdown().await;
            println!();
            println!("{} Relay stopped", "✓".green());
            println!("  Sessions at exit:      {}", stats.sessions_active);
            println!("  Envelopes forwarded:   {}", stats.envelopes_forwarded);
            println!("  Forwards failed:       {}", stats.forwards_failed);
            println!("  Registrations refused: {}", stats.registrations_rejected);
            Ok(())
        }
        RelayAction::Token {
            secret,
            audience,
            user,
            ttl,
        } => {
            let auth = TokenAuthenticator::new(&secret, audience);
            println!("{}", auth.issue(&user, Duration::from_secs(ttl)));
            Ok(())
        }
    }
}

async fn cmd_endpoint(home: &Home, action: EndpointAction) -> Result<()> {
    match action {
        EndpointAction::Configure {
            name,
            relay,
            listen,
            advertise,
            credentials,
            api_port,
            max_object_size,
            in_memory,
            max_memory,
        } => {
            let created = !home.exists(&name);
            let mut settings = if created {
                EndpointSettings::new(&name)?
            } else {
                home.load(&name)?
            };
            let updates = [
                ("relay", relay),
                ("listen", listen),
                ("advertise", advertise),
                ("credentials", credentials),
                ("api_port", api_port.map(|p| p.to_string())),
                ("max_object_size", max_object_size.map(|s| s.to_string())),
                ("in_memory", in_memory.map(|b| b.to_string())),
                ("max_memory", max_memory.map(|m| m.to_string())),
            ];
            for (key, value) in updates {
                if let Some(value) = value {
                    settings.set(key, &value)?;
                }
            }
            home.save(&settings)?;

            let verb = if created { "Created" } else { "Updated" };
            println!("{} {} endpoint {}", "✓".green(), verb, name.bright_cyan());
            print_settings(&settings);
        }

        EndpointAction::Set { name, key, value } => {
            let mut settings = home.load(&name)?;
            settings.set(&key, &value)?;
            home.save(&settings)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        EndpointAction::List => {
            let names = home.list()?;
            if names.is_empty() {
                println!("{}", "No endpoints configured.".dimmed());
                println!(
                    "  Create one: {}",
                    "peerstore endpoint configure <name> --relay <host:port>".bright_green()
                );
            } else {
                println!("{} ({} total)", "Endpoints".bold(), names.len());
                println!();
                for name in names {
                    let settings = home.load(&name)?;
                    let relay = settings
                        .endpoint
                        .relay_address
                        .clone()
                        .unwrap_or_else(|| "solo".to_string());
                    println!("  {} {}", "•".bright_green(), name.bright_cyan());
                    println!(
                        "    relay {}  api 127.0.0.1:{}",
                        relay.dimmed(),
                        settings.api_port
                    );
                }
            }
        }

        EndpointAction::Show { name } => {
            let settings = home.load(&name)?;
            println!("{}", format!("Endpoint {}", name).bold());
            print_settings(&settings);
            println!(
                "  {:<20} {}",
                "directory".bright_cyan(),
                home.endpoint_dir(&name).display()
            );
        }

        EndpointAction::Remove { name } => {
            home.remove(&name)?;
            println!("{} Removed endpoint {}", "✓".green(), name.bright_cyan());
        }

        EndpointAction::Start { name } => cmd_endpoint_start(home, &name).await?,

        EndpointAction::Stop { name } => {
            let settings = home.load(&name)?;
            api::stop_endpoint_via_api(settings.api_port).await?;
            println!("{} Stopping endpoint {}", "✓".green(), name.bright_cyan());
        }
    }

    Ok(())
}

fn print_settings(settings: &EndpointSettings) {
    for (key, value) in settings.list() {
        println!("  {:<20} {}", key.bright_cyan(), value);
    }
}

async fn cmd_endpoint_start(home: &Home, name: &str) -> Result<()> {
    let settings = home.load(name)?;
    let dir = home.endpoint_dir(name);
    let _guard = init_logging("info", Some(dir.join("log.txt")))?;

    let endpoint = Endpoint::start(settings.runtime_config(&dir))
        .await
        .with_context(|| format!("Failed to start endpoint {}", name))?;
    let endpoint = Arc::new(endpoint);
    let identity = endpoint.identity();

    println!("{}", format!("PeerStore endpoint {} — running", name).bold());
    println!("  UUID:   {}", identity.endpoint_id.to_string().bright_cyan());
    println!("  Peers:  {}", identity.listen_address);
    println!(
        "  Relay:  {}",
        identity
            .relay_address
            .clone()
            .unwrap_or_else(|| "(solo)".to_string())
    );
    println!(
        "  API:    {}",
        format!("http://127.0.0.1:{}", settings.api_port).bright_green()
    );
    println!(
        "  Store:  {}",
        if endpoint.store().is_persistent() {
            dir.join("store").display().to_string()
        } else {
            "in memory".to_string()
        }
    );
    println!();
    println!("Press {} to stop.", "Ctrl+C".bright_green());

    let ctx = api::ApiContext {
        endpoint: Arc::clone(&endpoint),
        shutdown: Arc::new(Notify::new()),
    };
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let served = api::start_api_server(ctx, settings.api_port, ctrl_c).await;

    endpoint.close().await?;
    if let Some(peers) = endpoint.peer_manager() {
        let stats = peers.get_stats();
        println!();
        println!("  Negotiations: {} ({} failed)", stats.negotiations_started, stats.negotiations_failed);
        println!("  Channels:     {} dialed, {} accepted, {} closed idle", stats.channels_opened, stats.channels_accepted, stats.channels_closed_idle);
    }
    println!("{} Endpoint {} stopped", "✓".green(), name.bright_cyan());
    served
}

/// API port of the endpoint named by --via, or of the only configured endpoint
fn client_port(home: &Home, via: Option<String>) -> Result<u16> {
    let name = match via {
        Some(name) => name,
        None => {
            let mut names = home.list()?;
            match names.len() {
                1 => names.remove(0),
                0 => anyhow::bail!("No endpoints configured"),
                _ => anyhow::bail!(
                    "Several endpoints configured ({}); pick one with --via",
                    names.join(", ")
                ),
            }
        }
    };
    Ok(home.load(&name)?.api_port)
}

async fn cmd_client(home: &Home, via: Option<String>, action: ClientAction) -> Result<()> {
    let port = client_port(home, via)?;

    match action {
        ClientAction::Get {
            key,
            endpoint,
            output,
        } => {
            let target = api::Target::parse(&key, endpoint);
            match api::get_via_api(port, &target).await? {
                Some(bytes) => match output {
                    Some(path) => {
                        std::fs::write(&path, &bytes)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!(
                            "{} {} bytes written to {}",
                            "✓".green(),
                            bytes.len(),
                            path.display()
                        );
                    }
                    None => {
                        use std::io::Write;
                        std::io::stdout().write_all(&bytes)?;
                    }
                },
                None => anyhow::bail!("Object not found: {}", key),
            }
        }

        ClientAction::Put {
            key,
            endpoint,
            file,
            data,
        } => {
            let bytes = match (file, data) {
                (Some(path), _) => std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, Some(data)) => data.into_bytes(),
                (None, None) => anyhow::bail!("Provide --file or --data"),
            };
            let target = api::Target { key, endpoint };
            let stored = api::set_via_api(port, &target, bytes).await?;
            println!("{}", stored);
        }

        ClientAction::Exists { key, endpoint } => {
            let target = api::Target::parse(&key, endpoint);
            if api::exists_via_api(port, &target).await? {
                println!("{} {}", "✓".green(), "exists".bright_cyan());
            } else {
                println!("{} {}", "✗".red(), "missing".dimmed());
            }
        }

        ClientAction::Evict { key, endpoint } => {
            let target = api::Target::parse(&key, endpoint);
            api::evict_via_api(port, &target).await?;
            println!("{} Evicted {}", "✓".green(), key);
        }

        ClientAction::Info => {
            let info = api::endpoint_info_via_api(port).await?;
            println!("{}", format!("Endpoint {}", info.name).bold());
            println!("  UUID:   {}", info.uuid.bright_cyan());
            println!("  Peers:  {}", info.listen_address);
            println!(
                "  Relay:  {}",
                info.relay_address.unwrap_or_else(|| "(solo)".to_string())
            );
        }
    }

    Ok(())
}
