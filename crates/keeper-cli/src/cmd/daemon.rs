use keeper_core::app::Services;
use keeper_core::config::KeeperConfig;
use keeper_core::scheduler::{Operations, Scheduler};

use crate::signal::shutdown_signal;

pub(crate) async fn run_daemon(config: KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !config.schedule.enabled {
        return Err(
            "schedule.enabled is false; set it to true in your config to use daemon mode".into(),
        );
    }

    let services = Services::from_config(config)?;

    // Checked before any timer is armed. An unusable local path stops
    // startup; anything else only warns.
    let check = Operations::new(services.clone()).verify_configuration().await?;
    for item in check.items.iter().filter(|i| !i.ok) {
        eprintln!("Warning: {} check failed: {}", item.name, item.detail);
    }

    let scheduler = Scheduler::start(services, true)?;
    let handle = scheduler.handle();

    let status = handle.get_status().await?;
    for entry in &status.schedule {
        tracing::info!(task = %entry.task, rule = %entry.rule, next = ?entry.next, "task scheduled");
    }
    tracing::info!(tasks = status.schedule.len(), "daemon running, press Ctrl-C to stop");

    shutdown_signal().await;
    if let Ok(status) = handle.get_status().await {
        if let Some(job) = status.current_job {
            tracing::info!(backup_id = %job.id, "waiting for running backup to finish");
        }
    }
    scheduler.stop().await;
    tracing::info!("daemon stopped");
    Ok(())
}
