use chrono::Utc;
use comfy_table::Cell;

use keeper_core::app::Services;
use keeper_core::retention::{self, RetentionDecision};
use keeper_core::scheduler::SchedulerHandle;

use crate::format::format_time;
use crate::table::CliTableTheme;

pub(crate) async fn run_cleanup(handle: &SchedulerHandle) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = handle.run_cleanup().await?;

    for id in &outcome.deleted {
        println!("Deleted {id}");
    }
    for warning in &outcome.warnings {
        eprintln!("Warning: {warning}");
    }
    for error in &outcome.errors {
        eprintln!("Error: {error}");
    }
    println!(
        "Cleanup complete: {} deleted, {} kept",
        outcome.deleted.len(),
        outcome.kept
    );

    if !outcome.errors.is_empty() {
        return Err(format!("{} backup(s) could not be deleted", outcome.errors.len()).into());
    }
    Ok(())
}

/// Print what a sweep would decide without touching storage.
pub(crate) async fn run_cleanup_plan(services: &Services) -> Result<(), Box<dyn std::error::Error>> {
    let records = services.storage.list().await?;
    let plan = retention::plan(&records, services.retention.config(), Utc::now());
    if plan.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["ID", "KIND", "CREATED", "ACTION", "REASON"]);
    for entry in &plan {
        let (action, reason) = match &entry.decision {
            RetentionDecision::Keep(reason) => ("keep", reason),
            RetentionDecision::Delete(reason) => ("delete", reason),
        };
        table.add_row(vec![
            Cell::new(&entry.id),
            Cell::new(entry.kind),
            Cell::new(format_time(entry.created_at)),
            Cell::new(action),
            Cell::new(reason),
        ]);
    }
    println!("{table}");

    let deleting = plan.iter().filter(|e| e.decision.is_delete()).count();
    println!();
    println!("Dry run: {deleting} would be deleted, {} kept", plan.len() - deleting);
    Ok(())
}
