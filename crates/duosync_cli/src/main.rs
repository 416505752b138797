//! DuoSync CLI
//!
//! Command-line tools for pairing and diagnosing DuoSync devices.
//!
//! # Commands
//!
//! - `keygen` - Print a fresh base64 channel key
//! - `device-id` - Print a fresh device id
//! - `pin` - Print a pairing PIN
//! - `offer` - Print a pairing payload for this device
//! - `inspect` - Validate a pairing payload
//! - `demo` - Pair two in-process devices and sync them

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DuoSync command-line tools.
#[derive(Parser)]
#[command(name = "duosync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh base64 channel key
    Keygen,

    /// Print a fresh device id
    DeviceId,

    /// Print a 6-digit pairing PIN
    Pin,

    /// Print a pairing payload and PIN for this device
    Offer {
        /// Transport address the peer should dial
        #[arg(short, long)]
        address: String,

        /// Directory holding the sync config (device id is generated if absent)
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },

    /// Validate a pairing payload
    Inspect {
        /// The payload JSON
        payload: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Pair two in-process devices over the loopback transport and sync them
    Demo,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Keygen => commands::ids::keygen(),
        Commands::DeviceId => commands::ids::device_id(),
        Commands::Pin => commands::ids::pin(),
        Commands::Offer {
            address,
            config_dir,
        } => commands::offer::run(&address, config_dir.as_deref())?,
        Commands::Inspect { payload, format } => commands::inspect::run(&payload, &format)?,
        Commands::Demo => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::demo::run())?;
        }
        Commands::Version => {
            println!("DuoSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("DuoSync protocol v{}", duosync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
