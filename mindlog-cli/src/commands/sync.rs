//! # Sync Commands

use anyhow::{Context, Result};
use colored::Colorize;
use mindlog_core::{Config, PassReport, SyncEngine, SyncEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::{format_millis, success};

fn engine(config: &Config) -> Result<SyncEngine> {
    SyncEngine::from_config(config).context("Failed to set up the sync engine")
}

pub fn render_report(report: &PassReport) -> String {
    if report.is_empty() {
        return "Nothing due.".to_string();
    }
    let line = format!(
        "Pass finished: {} dispatched, {} completed, {} failed, {} skipped",
        report.dispatched, report.completed, report.failed, report.skipped
    );
    if report.failed > 0 {
        format!("{} {}", "!".yellow().bold(), line)
    } else {
        success(&line)
    }
}

/// One inline pass, regardless of the connectivity probe
pub async fn run_once(config: &Config, json: bool) -> Result<()> {
    let engine = engine(config)?;
    let queue = engine.manager.queue();
    let recovered = queue.recover_interrupted().await?;
    let report = engine.manager.run_pass().await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "recovered": recovered, "report": report })
        );
    } else {
        println!("{}", render_report(&report));
        let pending = queue.get_pending_count().await?;
        if pending > 0 {
            println!("  {} task(s) still pending (backing off or blocked)", pending);
        }
    }
    Ok(())
}

fn render_event(event: &SyncEvent) -> String {
    let at = format_millis(event.timestamp());
    match event {
        SyncEvent::SyncStarted { count, .. } => format!("[{}] sync started, {} task(s)", at, count),
        SyncEvent::SyncCompleted { success, failure, .. } => format!(
            "[{}] sync completed, {} ok, {} failed",
            at,
            success.to_string().green(),
            if *failure > 0 {
                failure.to_string().red().to_string()
            } else {
                failure.to_string()
            }
        ),
        SyncEvent::SyncFailed { reason, .. } => {
            format!("[{}] {} {}", at, "sync failed:".red().bold(), reason)
        }
    }
}

/// Run the engine until Ctrl-C
pub async fn run_foreground(config: &Config) -> Result<()> {
    let engine = engine(config)?;
    let mut events = engine.manager.events().subscribe();
    engine.manager.start().await?;
    println!("Sync engine running, press Ctrl-C to stop.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", render_event(&event)),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} sync event(s)", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.manager.stop().await;
    let pending = engine.manager.queue().get_pending_count().await?;
    println!("Stopped; {} task(s) pending.", pending);
    Ok(())
}
