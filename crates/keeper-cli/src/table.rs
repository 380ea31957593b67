use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, Color, Table};

use keeper_types::{CheckOutcome, CheckStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CliTableTheme {
    pub use_unicode: bool,
    pub use_color: bool,
}

impl CliTableTheme {
    pub(crate) fn detect() -> Self {
        let is_tty = std::io::stdout().is_terminal();
        let no_color = std::env::var_os("NO_COLOR").is_some();
        resolve_table_theme(is_tty, no_color)
    }

    pub(crate) fn new_data_table(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        let header_cells: Vec<Cell> = headers.iter().map(|h| self.bold(h)).collect();
        table.set_header(header_cells);
        table
    }

    pub(crate) fn new_kv_table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    pub(crate) fn key_cell(self, text: &str) -> Cell {
        self.bold(text)
    }

    /// `ok`/`FAIL` in green or red.
    pub(crate) fn status_cell(self, ok: bool) -> Cell {
        let (text, color) = if ok { ("ok", Color::Green) } else { ("FAIL", Color::Red) };
        self.colored(text, color)
    }

    /// One integrity check, rendered as its verdict word.
    pub(crate) fn check_cell(self, check: &CheckOutcome) -> Cell {
        let (text, color) = check_verdict(check);
        self.colored(text, color)
    }

    fn bold(self, text: &str) -> Cell {
        let mut cell = Cell::new(text);
        if self.use_color {
            cell = cell.add_attribute(Attribute::Bold);
        }
        cell
    }

    fn colored(self, text: &str, color: Color) -> Cell {
        let mut cell = Cell::new(text);
        if self.use_color {
            cell = cell.fg(color);
        }
        cell
    }
}

fn resolve_table_theme(is_tty: bool, no_color: bool) -> CliTableTheme {
    CliTableTheme {
        use_unicode: is_tty,
        use_color: is_tty && !no_color,
    }
}

fn check_verdict(check: &CheckOutcome) -> (&'static str, Color) {
    match (check.status, check.passed) {
        (CheckStatus::Pending, _) => ("-", Color::DarkGrey),
        (CheckStatus::Completed, true) => ("pass", Color::Green),
        (CheckStatus::Completed, false) => ("FAIL", Color::Red),
        (CheckStatus::Failed, _) => ("error", Color::Red),
    }
}

pub(crate) fn add_kv_row(
    table: &mut Table,
    theme: CliTableTheme,
    field: &str,
    value: impl ToString,
) {
    table.add_row(vec![theme.key_cell(field), Cell::new(value.to_string())]);
}
