// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Devhost — stable subdomain URLs for local development
//
//  Gateway:       tokio + axum single-listener router
//  Control plane: this CLI, exit codes 0/1/2/3/4/5
//  Config:        DEVHOST_* environment + JSON route file + YAML state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod commands;

use clap::{Parser, Subcommand};
use devhost_core::config::LogFormat;
use devhost_core::{DevhostError, Settings};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "devhost",
    version,
    about = "Stable subdomain URLs for local development",
    long_about = "Routes http://<name>.<domain>:<port> to your local apps.\n\
                  The gateway listens on 127.0.0.1:7777 by default."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway router in the foreground
    Serve {
        /// Listener address (overrides DEVHOST_LISTEN)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Manage the route map
    Route {
        #[command(subcommand)]
        command: RouteCommands,
    },

    /// Show or set the proxy mode (off, gateway, system, external)
    Mode {
        /// New mode; prints the current mode when omitted
        mode: Option<String>,
    },

    /// External reverse-proxy integration (caddy, nginx, traefik)
    External {
        #[command(subcommand)]
        command: ExternalCommands,
    },

    /// Verify tracked files against their recorded hashes
    Integrity {
        /// Accept current contents as the new baseline
        #[arg(long)]
        accept: bool,
    },

    /// Inspect tunnel records
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },

    /// Clear state, owned snippets, and backups (never user files)
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RouteCommands {
    /// Add or replace a route: a port, host:port, or http(s) URL
    Add { name: String, target: String },
    /// Remove a route
    Remove { name: String },
    /// List all routes
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one route
    Get { name: String },
}

#[derive(Subcommand, Debug)]
enum ExternalCommands {
    /// Render the driver snippet under the state directory
    Snippet { driver: String },
    /// Inject the marker block into a user-owned config
    Attach {
        driver: String,
        #[arg(long)]
        config: PathBuf,
        /// Shell command to reload the proxy after changes
        #[arg(long)]
        reload_command: Option<String>,
        /// Proceed despite drift
        #[arg(long)]
        force: bool,
    },
    /// Remove the marker block from the attached config
    Detach {
        #[arg(long)]
        force: bool,
    },
    /// Verified system → external migration
    Transfer {
        driver: String,
        #[arg(long)]
        config: PathBuf,
        /// Address of the external proxy's HTTP listener
        #[arg(long, default_value = "127.0.0.1:80")]
        probe: SocketAddr,
        #[arg(long)]
        reload_command: Option<String>,
        /// Confirm stopping the owned proxy after the flip
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TunnelCommands {
    /// List recorded tunnels
    List,
}

fn main() {
    let cli = Cli::parse();
    let settings = match Settings::load() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("devhost: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&settings);
    std::process::exit(run(cli, settings));
}

fn run(cli: Cli, mut settings: Settings) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("devhost: failed to start runtime: {e}");
            return 1;
        }
    };

    let result: Result<(), DevhostError> = match cli.command {
        Commands::Serve { listen } => {
            if let Some(addr) = listen {
                settings.listen = addr;
            }
            return match runtime.block_on(devhost_gateway::server::run(settings)) {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Gateway failed");
                    eprintln!("devhost: {e}");
                    1
                }
            };
        }
        Commands::Route { command } => match command {
            RouteCommands::Add { name, target } => commands::route::add(&settings, &name, &target),
            RouteCommands::Remove { name } => commands::route::remove(&settings, &name),
            RouteCommands::List { json } => commands::route::list(&settings, json),
            RouteCommands::Get { name } => commands::route::get(&settings, &name),
        },
        Commands::Mode { mode } => commands::mode::show_or_set(&settings, mode.as_deref()),
        Commands::External { command } => match command {
            ExternalCommands::Snippet { driver } => {
                commands::external::snippet(&settings, &driver)
            }
            ExternalCommands::Attach {
                driver,
                config,
                reload_command,
                force,
            } => runtime.block_on(commands::external::attach(
                &settings,
                &driver,
                &config,
                reload_command,
                force,
            )),
            ExternalCommands::Detach { force } => {
                runtime.block_on(commands::external::detach(&settings, force))
            }
            ExternalCommands::Transfer {
                driver,
                config,
                probe,
                reload_command,
                yes,
                force,
            } => runtime.block_on(commands::external::transfer(
                &settings,
                &driver,
                &config,
                probe,
                reload_command,
                yes,
                force,
            )),
        },
        Commands::Integrity { accept } => commands::integrity::run(&settings, accept),
        Commands::Tunnel { command } => match command {
            TunnelCommands::List => commands::tunnel::list(&settings),
        },
        Commands::Reset { yes } => commands::reset::run(&settings, yes),
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("devhost: {e}");
            e.exit_code()
        }
    }
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_directive()));
    match settings.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }
}
