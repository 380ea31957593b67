use clap::{Parser, Subcommand};

use keeper_types::{BackupFormat, BackupKind};

#[derive(Parser)]
#[command(
    name = "keeper",
    version,
    about = "Scheduled database backups with integrity verification",
    after_help = "\
Configuration file lookup order:
  1. --config <path>
  2. $KEEPER_CONFIG
  3. ./keeper.yaml                            (project)
  4. $XDG_CONFIG_HOME/keeper/config.yaml      (user)
  5. /etc/keeper/config.yaml                  (system)"
)]
pub(crate) struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv). Overrides logging.level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler in the foreground until interrupted
    Daemon,

    /// Take a backup now
    Backup {
        /// Backup kind
        #[arg(short, long, default_value = "full", value_parser = parse_kind)]
        kind: BackupKind,

        /// Payload format (defaults to source.format)
        #[arg(short, long, value_parser = parse_format)]
        format: Option<BackupFormat>,

        /// Restrict the dump to these collections
        #[arg(long = "collection")]
        collections: Vec<String>,

        /// Query filter for structured exports
        #[arg(long)]
        query: Option<String>,

        /// Field projection for structured exports (comma separated)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Print the resulting record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored backups, oldest first
    List {
        /// Only show backups of this kind
        #[arg(short, long, value_parser = parse_kind)]
        kind: Option<BackupKind>,

        /// Show only the last N backups
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        last: Option<u64>,

        #[arg(long)]
        json: bool,
    },

    /// Verify stored backups (all of them when no id is given)
    Check {
        /// Backup to verify
        backup_id: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Apply retention policies
    Cleanup {
        /// Only show what would be deleted
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Show storage usage, schedule and recent failures
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Restore a backup's payload into an empty directory
    Restore {
        /// Backup to restore
        backup_id: String,
        /// Destination directory
        dest: String,
    },

    /// Check storage, encryption, source and notifier reachability
    Verify,

    /// Send a summary notification now
    Summary,

    /// Generate a minimal configuration file
    Config {
        /// Destination path (skips interactive prompt)
        #[arg(short, long)]
        dest: Option<String>,
    },
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Daemon => "daemon",
            Self::Backup { .. } => "backup",
            Self::List { .. } => "list",
            Self::Check { .. } => "check",
            Self::Cleanup { .. } => "cleanup",
            Self::Status { .. } => "status",
            Self::Restore { .. } => "restore",
            Self::Verify => "verify",
            Self::Summary => "summary",
            Self::Config { .. } => "config",
        }
    }
}

fn parse_kind(raw: &str) -> Result<BackupKind, String> {
    raw.parse().map_err(|e: keeper_types::KeeperError| e.to_string())
}

fn parse_format(raw: &str) -> Result<BackupFormat, String> {
    raw.parse().map_err(|e: keeper_types::KeeperError| e.to_string())
}
