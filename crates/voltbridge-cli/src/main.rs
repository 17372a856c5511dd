//! `voltbridge` – Battery Telemetry Bridge
//!
//! Entry point for the bridge stack. It:
//!
//! 1. Loads `~/.voltbridge/config.toml` (or defaults) plus environment
//!    overrides.
//! 2. Runs the bridge: producer TCP link, viewer hub, synthetic feed, and
//!    the HTTP/WebSocket server.
//! 3. Intercepts **Ctrl-C** / SIGTERM and shuts everything down within the
//!    configured timeout.
//!
//! `voltbridge producer-sim` starts a local stand-in for the pack hardware;
//! `voltbridge init-config` writes the default configuration file.

mod config;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info, warn};

use voltbridge_cockpit::Bridge;
use voltbridge_middleware::producer::DEFAULT_PRODUCER_ADDR;
use voltbridge_middleware::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use voltbridge_middleware::ProducerSim;
use voltbridge_types::BridgeError;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "voltbridge")]
#[command(version = VERSION)]
#[command(about = "Bridges battery-pack telemetry from TCP to WebSocket viewers")]
struct Cli {
    /// Config file (default `~/.voltbridge/config.toml`).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the bridge (default).
    Serve,
    /// Run a simulated producer on `addr`.
    ProducerSim {
        #[arg(long, default_value = DEFAULT_PRODUCER_ADDR)]
        addr: String,
    },
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("voltbridge");

    print_banner();

    let config_path = cli.config.unwrap_or_else(config::config_path);
    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config_path).await,
        Command::ProducerSim { addr } => producer_sim(&addr).await,
        Command::InitConfig { force } => init_config(&config_path, force),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "voltbridge exited with an error");
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(config_path: &Path) -> Result<(), BridgeError> {
    let cfg = config::load_from(config_path)?;
    info!(config = %config_path.display(), "configuration loaded");

    println!(
        "  Dashboard  {}",
        format!("http://localhost:{}", cfg.http_port).bold()
    );
    println!(
        "  Viewers    {}",
        format!("ws://localhost:{}{}", cfg.http_port, cfg.ws_path).bold()
    );
    println!("  Producer   {}", cfg.producer_addr.bold());
    println!();

    let (_trigger, signal) = install_shutdown_handler();
    Bridge::new(cfg.to_bridge_settings()).run(signal).await?;

    println!("{}", "  ✓ Bridge stopped.".green());
    Ok(())
}

async fn producer_sim(addr: &str) -> Result<(), BridgeError> {
    let sim = ProducerSim::bind(addr).await?;
    println!(
        "  Producer simulator on {}",
        sim.local_addr()?.to_string().bold()
    );
    println!();

    let (_trigger, signal) = install_shutdown_handler();
    sim.run(signal).await;

    println!("{}", "  ✓ Simulator stopped.".green());
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), BridgeError> {
    if path.exists() && !force {
        return Err(BridgeError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    config::save_to(&config::Config::default(), path)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Ctrl-C
// ─────────────────────────────────────────────────────────────────────────────

/// Route Ctrl-C / SIGTERM into a shutdown signal.
///
/// The trigger is returned so the signal stays pending for as long as the
/// caller holds it, even if the handler could not be installed.
fn install_shutdown_handler() -> (Arc<ShutdownTrigger>, ShutdownSignal) {
    let (trigger, signal) = shutdown::channel();
    let trigger = Arc::new(trigger);
    let handler_trigger = Arc::clone(&trigger);

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Shutdown requested – stopping voltbridge …".yellow().bold()
        );
        handler_trigger.send_replace(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    (trigger, signal)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#" __   __   _ _   _         _    _            "#.bold().yellow());
    println!("{}", r#" \ \ / /__| | |_| |__ _ _(_)__| |__ _ ___   "#.bold().yellow());
    println!("{}", r#"  \ V / _ \ |  _| '_ \ '_| / _` / _` / -_)  "#.bold().yellow());
    println!("{}", r#"   \_/\___/_|\__|_.__/_| |_\__,_\__, \___|  "#.bold().yellow());
    println!("{}", r#"                                 |___/       "#.bold().yellow());
    println!();
    println!("  {} {}", "voltbridge".bold(), format!("v{VERSION}").dimmed());
    println!("  Battery telemetry bridge");
    println!();
}
