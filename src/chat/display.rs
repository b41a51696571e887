use colored::*;
use comfy_table::{Attribute, Cell, CellAlignment, ContentArrangement, Table};

use crate::registry::ModelSummary;

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Formats a byte count with decimal units, e.g. `1.2 GB`.
pub fn human_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// First line of a template, shortened so the table stays readable.
fn template_preview(template: &str) -> String {
    let first = template.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if first.chars().count() > 40 {
        let short: String = first.chars().take(37).collect();
        format!("{}...", short)
    } else {
        first.to_string()
    }
}

pub fn models_table(models: &[ModelSummary]) -> Table {
    let mut table = Table::new();
    table
        .set_header(vec![
            Cell::new("#").fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Name").fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Size").fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold),
            Cell::new("Template").fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold),
        ])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    for (i, model) in models.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1).fg(comfy_table::Color::White).set_alignment(CellAlignment::Center),
            Cell::new(&model.name).fg(comfy_table::Color::Green),
            Cell::new(human_bytes(model.size_bytes)).fg(comfy_table::Color::Blue).set_alignment(CellAlignment::Right),
            Cell::new(template_preview(&model.template)).fg(comfy_table::Color::DarkGrey),
        ]);
    }
    table
}

/// Prints the local models as a table.
pub fn display_models_table(models: &[ModelSummary]) {
    if models.is_empty() {
        println!("{}", "No models found, pull one with `llmcore pull <model>`".yellow());
        return;
    }
    println!("\n{}", models_table(models));
    println!("{}", format!("Total models: {}", models.len()).bright_green());
}
