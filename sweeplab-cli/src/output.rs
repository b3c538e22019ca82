//! Output formatting for the CLI.

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use sweeplab_core::{ScalarKind, ValueKind};

/// A table in the house style: full UTF-8 borders, cyan headers.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

/// Render a field kind compactly, arrays in brackets.
pub fn kind_label(kind: ValueKind) -> String {
    fn scalar(kind: ScalarKind) -> &'static str {
        match kind {
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Complex => "complex",
            ScalarKind::Text => "text",
        }
    }
    match kind {
        ValueKind::Scalar(k) => scalar(k).to_string(),
        ValueKind::Array(k) => format!("[{}]", scalar(k)),
    }
}

pub fn lock_badge(locked: bool) -> String {
    if locked {
        "locked".red().to_string()
    } else {
        "open".green().to_string()
    }
}

pub fn current_marker(current: bool) -> &'static str {
    if current {
        "*"
    } else {
        ""
    }
}
