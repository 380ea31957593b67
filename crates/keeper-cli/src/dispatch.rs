use keeper_core::app::{RuntimeConfig, Services};
use keeper_core::scheduler::Scheduler;

use crate::cli::Commands;
use crate::cmd;
use crate::config_gen::run_config_generate;

/// Run one command against the loaded configuration.
///
/// Everything except `daemon` goes through a scheduler started without
/// timers, so manual work still honours the one-backup-at-a-time rule and
/// records stats the same way the daemon does.
pub(crate) async fn dispatch_command(
    command: &Commands,
    runtime: RuntimeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime.config;
    match command {
        Commands::Config { dest } => return run_config_generate(dest.as_deref()),
        Commands::Daemon => return cmd::daemon::run_daemon(config).await,
        Commands::Cleanup { dry_run: true } => {
            let services = Services::from_config(config)?;
            return cmd::cleanup::run_cleanup_plan(&services).await;
        }
        Commands::Status { json } => {
            let services = Services::from_config(config)?;
            return cmd::status::run_status(&services, *json).await;
        }
        _ => {}
    }

    let services = Services::from_config(config)?;
    let scheduler = Scheduler::start(services, false)?;
    let handle = scheduler.handle();

    let result = match command {
        Commands::Backup {
            kind,
            format,
            collections,
            query,
            fields,
            json,
        } => {
            let request = cmd::backup::BackupArgs {
                kind: *kind,
                format: *format,
                collections: collections.clone(),
                query: query.clone(),
                fields: fields.clone(),
                json: *json,
            };
            cmd::backup::run_backup(&handle, request).await
        }
        Commands::List { kind, last, json } => {
            cmd::list::run_list(&handle, *kind, *last, *json).await
        }
        Commands::Check { backup_id, json } => {
            cmd::check::run_check(&handle, backup_id.as_deref(), *json).await
        }
        Commands::Cleanup { .. } => cmd::cleanup::run_cleanup(&handle).await,
        Commands::Restore { backup_id, dest } => {
            cmd::restore::run_restore(&handle, backup_id, dest).await
        }
        Commands::Verify => cmd::verify::run_verify(&handle).await,
        Commands::Summary => handle
            .send_summary()
            .await
            .map(|()| println!("Summary sent."))
            .map_err(Into::into),
        Commands::Config { .. } | Commands::Daemon | Commands::Status { .. } => Ok(()),
    };

    scheduler.stop().await;
    result
}
