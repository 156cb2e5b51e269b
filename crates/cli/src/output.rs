//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use storysnap_common::PlannedSnapshot;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// One line per item
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for PlannedSnapshot {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Widths", "Min Height", "JS", "URL"]
    }

    fn row(&self) -> Vec<String> {
        let widths = if self.widths.is_empty() {
            "default".to_string()
        } else {
            self.widths
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        vec![
            self.name.clone(),
            widths,
            self.minimum_height.map(|h| h.to_string()).unwrap_or_default(),
            if self.enable_javascript { "yes" } else { "no" }.to_string(),
            self.url.clone(),
        ]
    }
}

/// Render a list of items; `verbose` adds the last column in plain mode
pub fn render_list<T: Serialize + TableDisplay>(
    items: &[T],
    format: OutputFormat,
    verbose: bool,
) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            table.to_string()
        }
        OutputFormat::Json => serde_json::to_string_pretty(items).unwrap_or_default(),
        OutputFormat::Plain => items
            .iter()
            .map(|item| {
                let row = item.row();
                match (verbose, row.first(), row.last()) {
                    (true, Some(first), Some(last)) if row.len() > 1 => {
                        format!("{}: {}", first, last)
                    }
                    (_, Some(first), _) => first.clone(),
                    _ => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat, verbose: bool) {
    if items.is_empty() && format != OutputFormat::Json {
        println!("No items found.");
        return;
    }
    println!("{}", render_list(items, format, verbose));
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message.red());
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
