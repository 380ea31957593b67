use comfy_table::Cell;

use keeper_core::scheduler::SchedulerHandle;
use keeper_types::{BackupKind, BackupRecord};

use crate::format::{format_bytes, format_duration_ms, format_time};
use crate::table::CliTableTheme;

pub(crate) async fn run_list(
    handle: &SchedulerHandle,
    kind: Option<BackupKind>,
    last: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let records = select(handle.list_backups().await?, kind, last);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&[
        "ID", "KIND", "FORMAT", "CREATED", "SIZE", "ENC", "COPIES", "VERIFIED", "TOOK",
    ]);
    for record in &records {
        table.add_row(vec![
            Cell::new(&record.id),
            Cell::new(record.kind),
            Cell::new(record.format),
            Cell::new(format_time(record.created_at)),
            Cell::new(format_bytes(record.stored_size)),
            Cell::new(if record.encrypted { "yes" } else { "no" }),
            Cell::new(record.locations.len()),
            theme.status_cell(record.verified),
            Cell::new(format_duration_ms(record.duration_ms)),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Filter by kind, then keep the newest `last`. Order stays oldest first.
fn select(records: Vec<BackupRecord>, kind: Option<BackupKind>, last: Option<u64>) -> Vec<BackupRecord> {
    let mut records: Vec<_> = records
        .into_iter()
        .filter(|r| kind.map_or(true, |k| r.kind == k))
        .collect();
    if let Some(n) = last {
        let n = usize::try_from(n).unwrap_or(usize::MAX);
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
    }
    records
}
