use chrono::Utc;
use comfy_table::Cell;

use keeper_core::app::Services;
use keeper_core::engine::{list_failures, Staging};
use keeper_core::scheduler::configured_schedule;
use keeper_core::storage::ProviderRole;

use crate::format::{format_bytes, format_duration_ms, format_optional_time, format_time};
use crate::table::{add_kv_row, CliTableTheme};

/// Failed jobs listed in status output.
const RECENT_FAILURES: usize = 5;

/// Storage usage, the configured schedule and failed jobs left in staging.
///
/// Scheduler counters live in the daemon process; this reads only what is
/// on disk and in config.
pub(crate) async fn run_status(
    services: &Services,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = &services.config;
    let storage = services.storage.stats().await;
    let schedule = configured_schedule(&config.schedule, Utc::now())?;
    let mut failures = list_failures(&Staging::root(&config.storage.local.base_path()))?;
    failures.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

    if json {
        let status = serde_json::json!({
            "storage": storage,
            "schedule_enabled": config.schedule.enabled,
            "schedule": schedule,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut summary = theme.new_kv_table();
    add_kv_row(&mut summary, theme, "Backups", storage.total_backups);
    add_kv_row(&mut summary, theme, "Stored", format_bytes(storage.total_bytes));
    add_kv_row(&mut summary, theme, "Oldest", format_optional_time(storage.oldest));
    add_kv_row(&mut summary, theme, "Newest", format_optional_time(storage.newest));
    add_kv_row(
        &mut summary,
        theme,
        "Schedule",
        if config.schedule.enabled { "enabled" } else { "disabled" },
    );
    println!("{summary}");
    println!();

    let mut providers = theme.new_data_table(&["PROVIDER", "ROLE", "BACKUPS", "SIZE", "STATUS"]);
    for provider in &storage.providers {
        let role = match provider.role {
            ProviderRole::Local => "local",
            ProviderRole::Remote => "remote",
        };
        providers.add_row(vec![
            Cell::new(&provider.name),
            Cell::new(role),
            Cell::new(provider.usage.backups),
            Cell::new(format_bytes(provider.usage.bytes)),
            match &provider.error {
                Some(e) => Cell::new(e),
                None => theme.status_cell(true),
            },
        ]);
    }
    println!("{providers}");

    if !schedule.is_empty() {
        println!();
        let mut timers = theme.new_data_table(&["TASK", "RULE", "NEXT"]);
        for entry in &schedule {
            timers.add_row(vec![
                Cell::new(&entry.task),
                Cell::new(&entry.rule),
                Cell::new(format_optional_time(entry.next)),
            ]);
        }
        println!("{timers}");
    }

    if !failures.is_empty() {
        println!();
        println!("Failed jobs ({} total, newest first):", failures.len());
        let mut table = theme.new_data_table(&["JOB", "KIND", "FAILED", "STAGE", "AFTER", "ERROR"]);
        for failure in failures.iter().take(RECENT_FAILURES) {
            table.add_row(vec![
                Cell::new(&failure.job.id),
                Cell::new(failure.job.kind),
                Cell::new(format_time(failure.failed_at)),
                Cell::new(
                    failure
                        .stage
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                ),
                Cell::new(format_duration_ms(failure.elapsed_ms)),
                Cell::new(&failure.error),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}
