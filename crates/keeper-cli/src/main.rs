mod cli;
mod cmd;
mod config_gen;
mod dispatch;
mod format;
mod signal;
mod table;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keeper_core::app::{self, RuntimeConfig};
use keeper_core::config::{self, LogFormat, LoggingConfig};

use cli::{Cli, Commands};
use config_gen::run_config_generate;
use dispatch::dispatch_command;

fn main() {
    let cli = Cli::parse();

    // `config` needs no config file.
    if let Commands::Config { dest } = &cli.command {
        init_logging(cli.verbose, &LoggingConfig::default(), false);
        if let Err(e) = run_config_generate(dest.as_deref()) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let runtime_config = match resolve_runtime_config(cli.config.as_deref()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let daemon = matches!(cli.command, Commands::Daemon);
    init_logging(cli.verbose, &runtime_config.config.logging, daemon);
    tracing::info!(command = cli.command.name(), "using config: {}", runtime_config.source);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(dispatch_command(&cli.command, runtime_config)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn resolve_runtime_config(
    cli_config: Option<&str>,
) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    if config::resolve_config_path(cli_config).is_none() {
        let mut msg = String::from("no configuration file found.\nSearched:\n");
        for (path, level) in config::default_config_search_paths() {
            msg.push_str(&format!("  {} ({level})\n", path.display()));
        }
        msg.push_str("\nRun `keeper config` to generate a starter config file.");
        return Err(msg.into());
    }
    Ok(app::load_runtime_config(cli_config)?)
}

/// `RUST_LOG` wins, then `-v`, then `logging.level`. Interactive commands
/// stay at `warn` unless asked; the daemon logs at the configured level.
fn init_logging(verbose: u8, logging: &LoggingConfig, daemon: bool) {
    let level = match verbose {
        0 if daemon => logging.level.as_str(),
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.with_target(false).init(),
    }
}
