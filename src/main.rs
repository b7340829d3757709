//! leasepool CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod cli;

/// leasepool - device and VM lease orchestrator
#[derive(Parser, Debug)]
#[command(name = "leasepool")]
#[command(about = "Device and VM lease orchestrator")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the REST server and the lease-expiry supervisor.
    Serve(cli::serve::ServeCmd),

    /// Validate configuration, stores and hypervisor bindings.
    Check(cli::check::CheckCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_format);

    tracing::debug!(version = leasepool::VERSION, "starting leasepool");

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Check(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leasepool=info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
