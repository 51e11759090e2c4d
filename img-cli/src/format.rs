//! Table and size formatting shared by the listing commands.

use chrono::{DateTime, Utc};
use comfy_table::presets::NOTHING;
use comfy_table::{ContentArrangement, Table};

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

pub fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Disabled)
        .set_header(header.to_vec());
    table
}

/// Decimal units, one fractional digit above bytes. Negative sizes (unknown)
/// print as `-`.
pub fn human_size(bytes: i64) -> String {
    if bytes < 0 {
        return "-".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

pub fn age(created_at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - created_at).num_seconds().max(0);
    match secs {
        0..60 => format!("{} seconds ago", secs),
        60..3600 => format!("{} minutes ago", secs / 60),
        3600..86400 => format!("{} hours ago", secs / 3600),
        _ => format!("{} days ago", secs / 86400),
    }
}
