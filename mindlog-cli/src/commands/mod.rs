//! # CLI Commands

use chrono::{Local, TimeZone};
use colored::Colorize;

pub mod config;
pub mod queue;
pub mod sync;

/// Render an error for the terminal
pub fn format_error(error: &anyhow::Error) -> String {
    let mut output = format!("{} {}", "Error:".red().bold(), error);
    for cause in error.chain().skip(1) {
        output.push_str(&format!("\n  {} {}", "caused by:".yellow(), cause));
    }
    output
}

pub fn success(message: &str) -> String {
    format!("{} {}", "✓".green(), message)
}

/// Epoch millis as local time
pub fn format_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
