use comfy_table::Cell;

use keeper_core::scheduler::SchedulerHandle;

use crate::table::CliTableTheme;

pub(crate) async fn run_verify(handle: &SchedulerHandle) -> Result<(), Box<dyn std::error::Error>> {
    let check = handle.verify_configuration().await?;

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["CHECK", "STATUS", "DETAIL"]);
    for item in &check.items {
        table.add_row(vec![
            theme.key_cell(&item.name),
            theme.status_cell(item.ok),
            Cell::new(&item.detail),
        ]);
    }
    println!("{table}");

    if !check.all_ok() {
        let failed = check.items.iter().filter(|i| !i.ok).count();
        return Err(format!("{failed} check(s) failed").into());
    }
    Ok(())
}
