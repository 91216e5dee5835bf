//! Backup tool for a web application's PostgreSQL database and uploaded storage files.
//!
//! `lbackup db` dumps the database, `lbackup storage` zips `storage/app/{private,public}`;
//! both deliver to the local disk or an S3-compatible bucket depending on `BACKUP_DRIVER`.

// lbackup/src/main.rs
mod backup;
mod config;
mod errors;

use anyhow::{Context, Result};
use backup::{JobReport, UploadProgress};
use config::AppConfig;
use std::env;
use std::io::Write;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const PROGRESS_BAR_WIDTH: usize = 30;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let (app_config, choice) = match prepare() {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = run_job(&app_config, &choice) => match result {
            Ok(report) => {
                print_report(&report);
                println!("✅ Backup completed successfully.");
                ExitCode::SUCCESS
            }
            Err(e) => {
                match e.downcast_ref::<errors::BackupError>() {
                    Some(cause) => eprintln!("❌ {:?} failure: {:?}", cause.kind(), e),
                    None => eprintln!("❌ Error: {:?}", e),
                }
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            // Dropping the job future released its staging area.
            eprintln!("\n❌ Interrupted, staged files removed.");
            ExitCode::from(130)
        }
    }
}

fn prepare() -> Result<(AppConfig, String)> {
    let app_config = AppConfig::load().context("Failed to load application configuration")?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };
    Ok((app_config, choice))
}

async fn run_job(app_config: &AppConfig, choice: &str) -> Result<JobReport> {
    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_progress(rx));

    let report = match choice {
        "1" | "db" => {
            println!("🚀 Starting database backup (driver: {})...", app_config.driver);
            backup::run_database_backup(app_config, Some(tx))
                .await
                .context("Database backup failed")
        }
        "2" | "storage" => {
            println!("🚀 Starting storage backup (driver: {})...", app_config.driver);
            backup::run_storage_backup(app_config, Some(tx))
                .await
                .context("Storage backup failed")
        }
        _ => {
            drop(tx);
            println!("❌ Invalid choice. Please enter '1' (db) or '2' (storage).");
            Err(anyhow::anyhow!("Invalid operation choice"))
        }
    };

    // The sender went away with the job; the renderer drains and exits.
    let _ = renderer.await;
    report
}

/// Prompts the user to pick which backup to run.
fn prompt_choice() -> Result<String> {
    use std::io::{stdin, stdout};

    println!("Select a backup:");
    println!("1. Database dump (or type 'db')");
    println!("2. Storage files archive (or type 'storage')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<UploadProgress>) {
    let mut drew = false;
    while let Some(progress) = rx.recv().await {
        eprint!("\r{}", progress_line(progress));
        let _ = std::io::stderr().flush();
        drew = true;
    }
    if drew {
        eprintln!();
    }
}

fn progress_line(progress: UploadProgress) -> String {
    let fraction = if progress.total == 0 {
        1.0
    } else {
        progress.completed as f64 / progress.total as f64
    };
    let filled = ((fraction * PROGRESS_BAR_WIDTH as f64).round() as usize).min(PROGRESS_BAR_WIDTH);
    format!(
        "Uploading: [{}{}] {:>3}% ({}/{})",
        "#".repeat(filled),
        "-".repeat(PROGRESS_BAR_WIDTH - filled),
        (fraction * 100.0).round() as u64,
        progress.completed,
        progress.total
    )
}

fn print_report(report: &JobReport) {
    println!(
        "📦 {:?}: {} ({} bytes) -> {} [{:?}]",
        report.kind, report.artifact_name, report.size_bytes, report.destination, report.strategy
    );
    if let Some(retention) = &report.retention {
        for key in &retention.deleted {
            println!("🗑️  Removed old archive {}", key);
        }
        for (key, reason) in &retention.failed {
            println!("⚠️  Could not remove {}: {}", key, reason);
        }
        if let Some(reason) = &retention.listing_error {
            println!("⚠️  Old archives were not pruned: {}", reason);
        }
    }
}
