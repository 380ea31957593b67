use comfy_table::Cell;

use keeper_core::scheduler::SchedulerHandle;
use keeper_types::{BackupId, IntegrityReport};

use crate::format::{format_bytes, format_optional_time};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) async fn run_check(
    handle: &SchedulerHandle,
    backup_id: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut unchecked = 0;
    let reports = match backup_id {
        Some(raw) => {
            let id = BackupId::parse(raw)?;
            vec![handle.check_backup(&id).await?]
        }
        None => {
            eprintln!("Verifying all stored backups...");
            let sweep = handle.run_integrity_check().await?;
            if !json {
                let theme = CliTableTheme::detect();
                let stats = &sweep.statistics;
                let mut table = theme.new_kv_table();
                add_kv_row(&mut table, theme, "Backups", stats.total);
                add_kv_row(&mut table, theme, "Valid", stats.valid);
                add_kv_row(&mut table, theme, "Invalid", stats.invalid);
                add_kv_row(&mut table, theme, "Unreadable", stats.errors);
                add_kv_row(&mut table, theme, "Total size", format_bytes(stats.total_size));
                add_kv_row(&mut table, theme, "Oldest", format_optional_time(stats.oldest));
                add_kv_row(&mut table, theme, "Newest", format_optional_time(stats.newest));
                println!("{table}");
                println!();
            }
            for error in &sweep.errors {
                eprintln!("Error: {error}");
            }
            unchecked = sweep.errors.len();
            sweep.reports
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if !reports.is_empty() {
        print_reports(&reports);
    }

    let invalid = reports.iter().filter(|r| !r.valid).count();
    if invalid > 0 {
        return Err(format!("{invalid} backup(s) failed verification").into());
    }
    if unchecked > 0 {
        return Err(format!("{unchecked} backup(s) could not be checked").into());
    }
    Ok(())
}

fn print_reports(reports: &[IntegrityReport]) {
    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&[
        "ID",
        "CHECKSUM",
        "STRUCTURE",
        "COMPRESSION",
        "RESTORE",
        "VALID",
    ]);
    for report in reports {
        let mut row = vec![Cell::new(&report.backup_id)];
        row.extend(report.checks().iter().map(|(_, c)| theme.check_cell(c)));
        row.push(theme.status_cell(report.valid));
        table.add_row(row);
    }
    println!("{table}");

    for report in reports.iter().filter(|r| !r.valid) {
        println!();
        println!("{}:", report.backup_id);
        for error in &report.errors {
            println!("  {error}");
        }
    }
}
