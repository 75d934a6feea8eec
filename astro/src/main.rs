//! # Astro Probe
//!
//! Connects to one device, runs commands through the connection's queue and
//! prints the values the device exposes.
//!
//! # Usage
//!
//! ```bash
//! # Ask a camera for its info and dump its values
//! astro-probe --connect localhost:5556 --command info
//!
//! # Hold an exposure while the telescope moves, JSON output
//! astro-probe --connect ccd:5556 --command "expose 10" --not-bop 0x04000000 --json
//!
//! # Connection tuning from a config file, debug logging
//! astro-probe --connect ccd:5556 --config probe.toml -v
//! ```

mod probe;

use astro::config::{ConfigLoader, ConnectionConfig, LogLevel, NodeConfig};
use astro_conn::{Command, Connection};
use clap::Parser;
use probe::{PollBlock, render_json, render_plain};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// Astro Probe - run commands on one device and print its values
#[derive(Parser, Debug)]
#[command(name = "astro-probe")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Run commands on one device and print its values")]
#[command(long_about = None)]
struct Args {
    /// Device address (host:port)
    #[arg(short = 'C', long, value_name = "HOST:PORT")]
    connect: String,

    /// Device name used in logs and output
    #[arg(short, long, default_value = "device")]
    name: String,

    /// Process configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Command to run (can be specified multiple times, runs in order)
    #[arg(long = "command", action = clap::ArgAction::Append)]
    commands: Vec<String>,

    /// BOP mask the commands wait on (decimal or 0x hex)
    #[arg(long, value_parser = parse_mask, default_value = "0")]
    not_bop: u32,

    /// Seconds to wait for the connection and for each batch of replies
    #[arg(long, default_value_t = 30)]
    wait_s: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and values in JSON format
    #[arg(long)]
    json: bool,
}

fn parse_mask(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid mask '{s}': {e}"))
}

fn main() {
    if let Err(e) = run() {
        error!("FATAL: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = args.config.as_deref().map(load_config).transpose();
    let log_level = match &loaded {
        Ok(Some(config)) => config.shared.log_level,
        _ => LogLevel::default(),
    };
    setup_tracing(&args, log_level);
    let connection = loaded?.map(|c| c.connection).unwrap_or_default();

    info!("Astro Probe v{} starting", env!("CARGO_PKG_VERSION"));
    probe(&args, connection)
}

fn load_config(path: &Path) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let config = NodeConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

fn probe(args: &Args, config: ConnectionConfig) -> Result<(), Box<dyn std::error::Error>> {
    let wait = Duration::from_secs(args.wait_s);
    let mut conn = Connection::connect(&args.connect, &args.name, config)?;
    let mut block = PollBlock::new();

    let commands = args
        .commands
        .iter()
        .map(|text| Command::new(text.as_str()).with_bop(args.not_bop))
        .collect();
    let result = block.run_commands(&mut conn, commands, wait);

    if args.json {
        println!("{}", render_json(&conn)?);
    } else {
        print!("{}", render_plain(&conn));
    }
    info!("{} command(s) returned", block.returned());
    result?;
    Ok(())
}

/// Setup tracing subscriber; `--verbose` wins over the configured level.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}
