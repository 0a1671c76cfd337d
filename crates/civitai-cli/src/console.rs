//! Terminal output: progress lines, prompts and summaries.

use civitai_core::history::format_file_size;
use civitai_core::{BatchEvent, BatchSummary, DownloadProgress, DownloadRecord, ItemOutcome};
use std::io::Write;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RULE: &str = "============================================================";

pub fn heading(title: &str) {
    println!("\n{RULE}\n{title}\n{RULE}");
}

/// Render progress updates on one stderr line until the sender is dropped.
pub fn spawn_progress_printer() -> (mpsc::Sender<DownloadProgress>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DownloadProgress>(32);
    let handle = tokio::spawn(async move {
        let mut drew = false;
        while let Some(progress) = rx.recv().await {
            eprint!("\r\x1b[2K{}", progress_line(&progress));
            drew = true;
        }
        if drew {
            eprintln!();
        }
    });
    (tx, handle)
}

pub fn progress_line(progress: &DownloadProgress) -> String {
    let done = format_file_size(progress.bytes_downloaded);
    let speed = format_file_size(progress.speed_bytes_per_sec.max(0.0) as u64);
    match progress.total_bytes {
        Some(total) => format!(
            "{:5.1}% | {} / {} | {}/s{}",
            progress.percent.unwrap_or(0.0),
            done,
            format_file_size(total),
            speed,
            progress
                .eta_seconds
                .map(|eta| format!(" | ETA {}", format_duration(eta)))
                .unwrap_or_default()
        ),
        None => format!("{} | {}/s", done, speed),
    }
}

fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Ask a y/N question on stdin. `assume_yes` answers without asking.
pub async fn confirm(question: &str, assume_yes: bool) -> std::io::Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    print!("{} (y/N): ", question);
    std::io::stdout().flush()?;

    // Blocking read off the runtime thread so Ctrl-C is still observed
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(std::io::Error::other)??;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

pub fn print_record(index: usize, record: &DownloadRecord) {
    println!("{:2}. [{}]", index, record.timestamp);
    match (&record.api_model_type, record.lora_subcategory) {
        (Some(api), Some(sub)) => println!("    Type: {} ({}, {})", record.model_type, api, sub),
        (Some(api), None) => println!("    Type: {} ({})", record.model_type, api),
        _ => println!("    Type: {}", record.model_type),
    }
    println!("    URL: {}", record.url);
    println!("    File: {}", record.filename);
    println!("    Size: {}", record.file_size);
    println!();
}

/// Print batch events as they arrive until the runner drops its sender.
pub fn spawn_batch_printer(mut rx: mpsc::UnboundedReceiver<BatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Started { index, total, item } => {
                    eprintln!("\n[{}/{}] {}", index, total, item.label);
                    eprintln!("    URL: {}", item.url);
                }
                BatchEvent::Retrying {
                    attempt,
                    max_attempts,
                    delay,
                    error,
                    ..
                } => {
                    eprintln!(
                        "    Retrying in {}s (attempt {}/{}): {}",
                        delay.as_secs(),
                        attempt + 1,
                        max_attempts,
                        error
                    );
                }
                BatchEvent::Finished { outcome, .. } => match outcome {
                    ItemOutcome::Succeeded(record) => {
                        eprintln!("    Done: {} ({})", record.filename, record.file_size)
                    }
                    ItemOutcome::Skipped { reason } => eprintln!("    Skipped: {}", reason),
                    ItemOutcome::Failed { message, .. } => eprintln!("    Failed: {}", message),
                },
            }
        }
    })
}

pub fn print_batch_summary(summary: &BatchSummary) {
    heading("Redownload finished");
    println!("Succeeded: {}", summary.succeeded);
    println!("Skipped:   {}", summary.skipped);
    println!("Failed:    {}", summary.failed);
    if summary.retried > 0 {
        println!("Retried:   {}", summary.retried);
    }
    println!("Total:     {}", summary.total);
}
