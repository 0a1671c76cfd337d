//! Subcommand handlers.

use crate::console::{self, confirm, heading};
use crate::{Cli, Command, DownloadArgs, HistoryCommand, ImportArgs, RedownloadArgs, ScanArgs};
use anyhow::{anyhow, bail, Context, Result};
use civitai_core::network::retry_async_observed;
use civitai_core::scanner::{self, urls_by_type};
use civitai_core::{
    import_scan_results, parse_model_url, ApiClient, BatchItem, BatchRunner, CivitaiError,
    DownloadOptions, HistoryStore, HttpClient, ListOptions, MetadataScanner, ModelDownloader,
    ModelKind, ScanOptions, Settings,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        config, command, ..
    } = cli;
    match command {
        Command::Download(args) => download(&config, args).await,
        Command::History(cmd) => history(&config, cmd),
        Command::Redownload(args) => redownload(&config, args).await,
        Command::Scan(args) => scan(&config, args).await,
        Command::Import(args) => import(&config, args),
    }
}

fn load_settings(path: &Path) -> Result<Arc<Settings>> {
    let settings = Settings::load(path)?;
    debug!("History file: {}", settings.history_file().display());
    Ok(Arc::new(settings))
}

fn cancelled() -> Result<ExitCode> {
    println!("Cancelled");
    Ok(ExitCode::SUCCESS)
}

async fn download(config: &Path, args: DownloadArgs) -> Result<ExitCode> {
    let settings = load_settings(config)?;
    let history = HistoryStore::new(settings.history_file());

    if !args.force && !confirm_if_recorded(&history, &args.url, args.yes).await? {
        return cancelled();
    }

    let downloader = ModelDownloader::from_settings(settings)?;
    let options = DownloadOptions {
        force: args.force,
        resume: !args.no_resume,
    };
    fetch_and_record(&downloader, &history, &args.url, args.model_type, options, args.yes).await
}

/// Warn when the URL or its model version is already in the history.
async fn confirm_if_recorded(history: &HistoryStore, url: &str, assume_yes: bool) -> Result<bool> {
    let by_url = history.contains_url(url)?;
    let by_model = match parse_model_url(url) {
        Ok(model) => match model.version_id {
            Some(version_id) => history
                .contains_model(model.model_id, version_id)?
                .then_some((model.model_id, version_id)),
            None => None,
        },
        Err(_) => None,
    };
    if !by_url && by_model.is_none() {
        return Ok(true);
    }

    println!("This model is already in the download history:");
    if by_url {
        println!("   URL: {}", url.trim());
    }
    if let Some((model_id, version_id)) = by_model {
        println!("   Model ID: {}, Version ID: {}", model_id, version_id);
    }
    Ok(confirm("Download it again?", assume_yes).await?)
}

/// Resolve, download with retries, then append to the history.
async fn fetch_and_record(
    downloader: &ModelDownloader,
    history: &HistoryStore,
    url: &str,
    requested: Option<ModelKind>,
    mut options: DownloadOptions,
    assume_yes: bool,
) -> Result<ExitCode> {
    heading("Civitai Model Downloader");
    println!("URL:  {}", url.trim());
    println!(
        "Type: {}",
        requested
            .map(|k| k.to_string())
            .unwrap_or_else(|| "auto-detect".to_string())
    );

    let plan = downloader.plan(url, requested).await?;
    println!(
        "Model: {} / {}",
        plan.version.model_name().unwrap_or("Unknown"),
        plan.version.name.as_deref().unwrap_or("Unknown")
    );
    println!(
        "Base model: {}",
        plan.version.base_model.as_deref().unwrap_or("Unknown")
    );
    match (&plan.classification.api_model_type, plan.classification.lora_subcategory) {
        (Some(api), Some(sub)) => println!("Detected type: {} ({}, {})", plan.model_type, api, sub),
        (Some(api), None) => println!("Detected type: {} ({})", plan.model_type, api),
        _ => println!("Detected type: {}", plan.model_type),
    }
    println!("Saving to: {}", plan.destination.display());

    if !options.force && plan.destination.exists() {
        let question = format!("{} already exists. Overwrite?", plan.destination.display());
        if !confirm(&question, assume_yes).await? {
            return cancelled();
        }
        options.force = true;
    }

    let retry = downloader.settings().retry_config();
    let plan_ref = &plan;
    let (result, stats) = retry_async_observed(
        &retry,
        || async move {
            let (progress_tx, printer) = console::spawn_progress_printer();
            let result = downloader.execute(plan_ref, options, Some(progress_tx)).await;
            let _ = printer.await;
            result
        },
        |e: &CivitaiError| e.is_retryable(),
        |e: &CivitaiError| e.retry_after(),
        |notice| {
            eprintln!(
                "Retrying in {}s (attempt {}/{}): {}",
                notice.delay.as_secs(),
                notice.attempt + 1,
                notice.max_attempts,
                notice.error
            )
        },
    )
    .await;
    let record = result?;
    if stats.retries() > 0 {
        info!("Download succeeded after {} retries", stats.retries());
    }

    history
        .append(&record)
        .with_context(|| format!("failed to record download in {}", history.path().display()))?;

    heading("Download complete");
    println!("File: {}", record.filename);
    println!("Size: {}", record.file_size);
    println!("Path: {}", plan.destination.display());
    Ok(ExitCode::SUCCESS)
}

fn history(config: &Path, cmd: HistoryCommand) -> Result<ExitCode> {
    match cmd {
        HistoryCommand::List { all, sort_by_type } => {
            let settings = load_settings(config)?;
            let store = HistoryStore::new(settings.history_file());
            let options = ListOptions {
                remove_duplicates: !all,
                sort_by_type,
            };
            let records = store.list(options)?;

            heading("Download history");
            if records.is_empty() {
                println!("No downloads recorded");
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "{} entries{}\n",
                records.len(),
                if all { "" } else { " (duplicates hidden)" }
            );
            for (i, record) in records.iter().enumerate() {
                console::print_record(i + 1, record);
            }
            println!("Redownload with: civitai-dl redownload --index <N> | --url <URL>");
            Ok(ExitCode::SUCCESS)
        }
        HistoryCommand::Clean => {
            let settings = load_settings(config)?;
            let store = HistoryStore::new(settings.history_file());
            let removed = store.clean_duplicates()?;
            if removed > 0 {
                println!(
                    "Removed {} duplicate rows (backup at {})",
                    removed,
                    store.backup_path().display()
                );
            } else {
                println!("No duplicates found");
            }
            Ok(ExitCode::SUCCESS)
        }
        HistoryCommand::Migrate { old, new } => {
            let new = new.unwrap_or_else(|| old.with_extension("csv"));
            println!("Converting {} -> {}", old.display(), new.display());
            let summary = HistoryStore::migrate_legacy_text(&old, &new)?;
            println!(
                "Converted {} entries ({} lines skipped)",
                summary.converted, summary.skipped
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn redownload(config: &Path, args: RedownloadArgs) -> Result<ExitCode> {
    let settings = load_settings(config)?;
    let store = HistoryStore::new(settings.history_file());
    let options = ListOptions::default();

    if args.target.all {
        let records = store.list(options)?;
        if records.is_empty() {
            bail!("the download history is empty");
        }
        heading("Redownload all");
        println!("{} entries to download", records.len());
        if !args.force && !confirm("Download all entries?", args.yes).await? {
            return cancelled();
        }

        let downloader = ModelDownloader::from_settings(settings.clone())?;
        let items: Vec<BatchItem> = records.iter().map(BatchItem::from_record).collect();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let event_printer = console::spawn_batch_printer(event_rx);
        let (progress_tx, progress_printer) = console::spawn_progress_printer();

        let summary = BatchRunner::new(&downloader, settings.retry_config())
            .run(&items, args.force, Some(event_tx), Some(progress_tx))
            .await;
        let _ = event_printer.await;
        let _ = progress_printer.await;

        console::print_batch_summary(&summary);
        return Ok(if summary.all_ok() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let record = match (args.target.index, args.target.url) {
        (Some(index), _) => store.find_by_index(index, options)?,
        (None, Some(url)) => store
            .find_by_url(&url, options)?
            .ok_or_else(|| anyhow!("URL not found in history: {}", url))?,
        (None, None) => bail!("one of --index, --url or --all is required"),
    };
    println!("Redownloading {} ({})", record.url, record.model_type);

    let downloader = ModelDownloader::from_settings(settings)?;
    let requested = Some(record.model_type).filter(|k| *k != ModelKind::Unknown);
    let options = DownloadOptions {
        force: args.force,
        resume: true,
    };
    fetch_and_record(&downloader, &store, &record.url, requested, options, args.yes).await
}

async fn scan(config: &Path, args: ScanArgs) -> Result<ExitCode> {
    let settings = load_settings(config)?;
    let http = Arc::new(HttpClient::with_timeout(
        Some(settings.api_key().to_string()),
        settings.request_timeout(),
    )?);
    let options = ScanOptions {
        concurrency: args
            .concurrency
            .unwrap_or_else(|| settings.scan_concurrency())
            .max(1),
        retry: settings.retry_config(),
    };
    let scanner = MetadataScanner::new(ApiClient::new(http), options);

    let dirs: Vec<PathBuf> = if args.dirs.is_empty() {
        settings
            .download_dirs()
            .map(|(_, dir)| dir.to_path_buf())
            .collect()
    } else {
        args.dirs
    };

    heading("Model metadata scan");
    let mut entries = Vec::new();
    for dir in &dirs {
        println!("Scanning {}", dir.display());
        entries.extend(scanner.scan_directory(dir).await?);
    }

    scanner::write_json(&args.output, &entries)?;

    let identified = entries.iter().filter(|e| e.is_identified()).count();
    println!(
        "\n{} files scanned, {} identified, {} unknown",
        entries.len(),
        identified,
        entries.len() - identified
    );
    for (kind, urls) in urls_by_type(&entries) {
        println!("  {}: {} download URLs", kind, urls.len());
    }
    println!("Results saved to {}", args.output.display());
    Ok(ExitCode::SUCCESS)
}

fn import(config: &Path, args: ImportArgs) -> Result<ExitCode> {
    let history_path = match args.history {
        Some(path) => path,
        None => load_settings(config)?.history_file().to_path_buf(),
    };
    let entries = scanner::read_json(&args.json)
        .with_context(|| format!("failed to read scan results from {}", args.json.display()))?;
    let store = HistoryStore::new(history_path);
    let summary = import_scan_results(&store, &entries)?;
    println!(
        "Added {} entries to {} ({} already recorded)",
        summary.added,
        store.path().display(),
        summary.skipped
    );
    Ok(ExitCode::SUCCESS)
}
