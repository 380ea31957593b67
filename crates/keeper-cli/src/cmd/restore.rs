use std::path::Path;

use keeper_core::scheduler::SchedulerHandle;
use keeper_types::BackupId;

use crate::format::format_bytes;

pub(crate) async fn run_restore(
    handle: &SchedulerHandle,
    backup_id: &str,
    dest: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = BackupId::parse(backup_id)?;
    let outcome = handle.restore(&id, Path::new(dest)).await?;

    println!(
        "Restored {} from '{}' into {} ({})",
        outcome.backup_id,
        outcome.provider,
        outcome.destination.display(),
        format_bytes(outcome.bytes),
    );
    Ok(())
}
