use keeper_core::scheduler::SchedulerHandle;
use keeper_types::{BackupFormat, BackupKind, BackupRecord, JobOptions};

use crate::format::{format_bytes, format_duration_ms, format_size_with_savings, format_time};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) struct BackupArgs {
    pub kind: BackupKind,
    pub format: Option<BackupFormat>,
    pub collections: Vec<String>,
    pub query: Option<String>,
    pub fields: Vec<String>,
    pub json: bool,
}

pub(crate) async fn run_backup(
    handle: &SchedulerHandle,
    args: BackupArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = JobOptions {
        collections: args.collections,
        query: args.query,
        fields: args.fields,
    };

    eprintln!("==> Starting {} backup", args.kind);
    let record = handle.run_manual_backup(args.kind, args.format, options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    for warning in &record.warnings {
        eprintln!("Warning: {warning}");
    }
    Ok(())
}

fn print_record(record: &BackupRecord) {
    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "Backup", &record.id);
    add_kv_row(&mut table, theme, "Kind", record.kind);
    add_kv_row(&mut table, theme, "Format", record.format);
    add_kv_row(&mut table, theme, "Created", format_time(record.created_at));
    if let Some(since) = record.since {
        add_kv_row(&mut table, theme, "Since", format_time(since));
    }
    add_kv_row(&mut table, theme, "Artifact", &record.artifact);
    add_kv_row(&mut table, theme, "Dump size", format_bytes(record.raw_size));
    add_kv_row(
        &mut table,
        theme,
        "Stored size",
        format_size_with_savings(record.stored_size, record.raw_size),
    );
    add_kv_row(
        &mut table,
        theme,
        "Encrypted",
        if record.encrypted { "yes" } else { "no" },
    );
    if let Some(checksum) = &record.checksum {
        add_kv_row(&mut table, theme, "Checksum", checksum);
    }
    let providers: Vec<&str> = record.locations.iter().map(|l| l.provider.as_str()).collect();
    add_kv_row(&mut table, theme, "Stored on", providers.join(", "));
    add_kv_row(
        &mut table,
        theme,
        "Verified",
        if record.verified { "yes" } else { "no" },
    );
    add_kv_row(&mut table, theme, "Duration", format_duration_ms(record.duration_ms));
    println!("{table}");
}
