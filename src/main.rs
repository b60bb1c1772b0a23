//! CLI entry point for the gallery reader.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use gallery_core::cache::{DiskImageCache, PageCacheStore};
use gallery_core::loader::{
    LoadedPage, LoaderError, LoaderServices, PageLoader, PassphraseOutcome, PassphraseRequest,
};
use gallery_core::net::HttpClient;
use gallery_core::source::{ArchiveLookup, DirectoryArchiveLookup, NoArchives};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::cookie::Jar;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

mod cli;
mod config;

use cli::{CacheAction, Cli, Command, ExportArgs, GallerySelection, LoadOverrides, ReadArgs};
use config::ReaderConfig;

/// Process outcome mapped to an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failure,
    Partial,
}

impl From<ProcessExit> for ExitCode {
    fn from(outcome: ProcessExit) -> Self {
        match outcome {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::from(1),
            ProcessExit::Partial => ExitCode::from(2),
        }
    }
}

fn determine_exit_outcome(completed: usize, failed: usize) -> ProcessExit {
    if failed == 0 {
        ProcessExit::Success
    } else if completed > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let loaded = config::load_config(cli.config.as_deref())?;
    if loaded.loaded_from_file {
        debug!(path = ?loaded.path, "loaded config file");
    }
    let config = loaded.config;

    let outcome = match cli.command {
        Command::Read(ref args) => run_read(&cli, config, args).await?,
        Command::Export(ref args) => run_export(&cli, config, args).await?,
        Command::Cache { action } => run_cache(&config, action).await?,
    };
    Ok(outcome.into())
}

fn apply_overrides(mut config: ReaderConfig, overrides: &LoadOverrides) -> Result<ReaderConfig> {
    if overrides.original {
        config.read_original = Some(true);
    }
    if overrides.crop_borders {
        config.crop_borders = Some(true);
    }
    if let Some(concurrency) = overrides.concurrency {
        config.fetch_concurrency = Some(usize::from(concurrency));
    }
    if let Some(base_url) = &overrides.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(cache_dir) = &overrides.cache_dir {
        config.cache_dir = Some(cache_dir.clone());
    }
    config.validate().context("Invalid command-line override")?;
    Ok(config)
}

fn build_client(config: &ReaderConfig, cookies: &[(String, String)]) -> Result<HttpClient> {
    let jar = Arc::new(Jar::default());
    if !cookies.is_empty() {
        let base_url = config.base_url();
        let url = Url::parse(&base_url).with_context(|| format!("Invalid base URL '{base_url}'"))?;
        for (name, value) in cookies {
            jar.add_cookie_str(&format!("{name}={value}"), &url);
        }
        debug!(count = cookies.len(), host = ?url.host_str(), "installed cookies");
    }
    let (connect, read) = config.timeouts();
    HttpClient::configured(Some(jar), connect, read).context("Failed to build HTTP client")
}

async fn build_loader(
    cli: &Cli,
    config: ReaderConfig,
    selection: &GallerySelection,
    overrides: &LoadOverrides,
    start_page: Option<usize>,
) -> Result<PageLoader> {
    let gallery = selection
        .gallery()
        .ok_or_else(|| anyhow!("Select a gallery with <GID> <TOKEN> or --archive <PATH>"))?;
    let config = apply_overrides(config, overrides)?;

    let client = build_client(&config, &cli.cookies)?;
    let cache_dir = config.cache_dir();
    let caches = PageCacheStore::open(&cache_dir, config.cache_budget())
        .await
        .with_context(|| format!("Failed to open page cache at '{}'", cache_dir.display()))?;
    let archives: Arc<dyn ArchiveLookup> = match &config.download_dir {
        Some(dir) => Arc::new(DirectoryArchiveLookup::new(dir.clone())),
        None => Arc::new(NoArchives),
    };
    let services = LoaderServices::new(client, caches)
        .with_archives(archives)
        .with_options(config.loader_options());

    let loader = PageLoader::new(gallery, start_page, services);
    if let Some(requests) = loader.passphrase_requests() {
        tokio::spawn(answer_passphrases(requests));
    }
    Ok(loader)
}

/// Starts `loader` and waits for the page count.
async fn await_pages(loader: &PageLoader) -> Result<usize> {
    loader.start();
    if !loader.await_ready().await {
        let reason = loader
            .last_error()
            .map_or_else(|| "loader stopped".to_string(), |e| e.to_string());
        bail!("Failed to open {}: {reason}", loader.gallery());
    }
    loader
        .size()
        .ok_or_else(|| anyhow!("Gallery {} is not ready", loader.gallery()))
}

async fn run_read(cli: &Cli, config: ReaderConfig, args: &ReadArgs) -> Result<ProcessExit> {
    let start_page = args
        .start
        .map(|page| usize::try_from(page - 1))
        .transpose()
        .context("Start page out of range")?;
    let loader = build_loader(cli, config, &args.gallery, &args.overrides, start_page).await?;
    let size = await_pages(&loader).await?;
    if let Some(detail) = loader.detail() {
        info!(title = %detail.title, pages = size, "gallery ready");
    } else {
        info!(gallery = %loader.gallery(), pages = size, "gallery ready");
    }

    let progress = if cli.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(size as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} pages {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    };

    // Reading order: from the start page to the end, then wrap around.
    let start = loader.start_page();
    let mut tasks = JoinSet::new();
    for index in (start..size).chain(0..start) {
        let loader = loader.clone();
        tasks.spawn(async move { (index, loader.request_page(index).await) });
    }

    let mut outcomes: Vec<(usize, Result<LoadedPage, LoaderError>)> = Vec::with_capacity(size);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => {
                progress.inc(1);
                outcomes.push((index, result));
            }
            Err(e) => warn!(error = %e, "page task failed"),
        }
    }
    progress.finish_and_clear();
    loader.stop().await;

    outcomes.sort_by_key(|(index, _)| *index);
    let mut completed = 0;
    let mut failed = 0;
    let mut stdout = io::stdout().lock();
    for (index, result) in &outcomes {
        match result {
            Ok(page) => {
                completed += 1;
                writeln!(
                    stdout,
                    "page {:>4}  ok      {:>9} bytes  {}{}",
                    index + 1,
                    page.bytes.len(),
                    page.mime_type,
                    if page.from_cache { "  (cached)" } else { "" }
                )?;
            }
            Err(e) => {
                failed += 1;
                writeln!(stdout, "page {:>4}  failed  {e}", index + 1)?;
            }
        }
    }
    info!(completed, failed, total = size, "read complete");
    Ok(determine_exit_outcome(completed, failed))
}

async fn run_export(cli: &Cli, config: ReaderConfig, args: &ExportArgs) -> Result<ProcessExit> {
    let index = usize::try_from(args.page - 1).context("Page number out of range")?;
    let loader = build_loader(cli, config, &args.gallery, &args.overrides, Some(index)).await?;
    let size = await_pages(&loader).await?;
    if index >= size {
        loader.stop().await;
        bail!("Page {} is out of range: gallery has {size} pages", args.page);
    }

    let result = loader.export_page(index, &args.dest).await;
    loader.stop().await;
    let written = result
        .with_context(|| format!("Failed to export page {} to '{}'", args.page, args.dest.display()))?;
    info!(page = args.page, bytes = written, dest = %args.dest.display(), "page exported");
    Ok(ProcessExit::Success)
}

async fn run_cache(config: &ReaderConfig, action: CacheAction) -> Result<ProcessExit> {
    let dir = config.cache_dir();
    let images = open_images(&dir, config).await?;
    let mut stdout = io::stdout().lock();
    match action {
        CacheAction::Stats => {
            writeln!(stdout, "cache dir: {}", dir.display())?;
            writeln!(stdout, "entries:   {}", images.len().await)?;
            writeln!(
                stdout,
                "size:      {} / {} bytes",
                images.size_bytes().await,
                images.max_bytes()
            )?;
        }
        CacheAction::Clear => {
            let entries = images.len().await;
            images.clear().await;
            writeln!(stdout, "removed {entries} cached pages from {}", dir.display())?;
        }
    }
    Ok(ProcessExit::Success)
}

async fn open_images(dir: &Path, config: &ReaderConfig) -> Result<DiskImageCache> {
    DiskImageCache::open(dir, config.cache_budget().disk_bytes)
        .await
        .with_context(|| format!("Failed to open page cache at '{}'", dir.display()))
}

/// Answers passphrase requests from stdin. End of input abandons the request.
async fn answer_passphrases(mut requests: mpsc::Receiver<PassphraseRequest>) {
    while let Some(request) = requests.recv().await {
        match request.previous() {
            Some(PassphraseOutcome::Invalid) => eprintln!("Wrong passphrase."),
            Some(PassphraseOutcome::Empty) => eprintln!("Passphrase must not be empty."),
            Some(PassphraseOutcome::Accepted) | None => {}
        }
        eprint!(
            "Passphrase for {} (attempt {}): ",
            request.path().display(),
            request.attempt()
        );
        let _ = io::stderr().flush();

        let line = tokio::task::spawn_blocking(read_stdin_line).await;
        match line {
            Ok(Ok(Some(text))) => {
                let outcome = request.submit(text).outcome().await;
                debug!(?outcome, "passphrase verdict");
            }
            Ok(Ok(None)) => {
                eprintln!();
                request.abandon();
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read passphrase");
                request.abandon();
            }
            Err(e) => {
                warn!(error = %e, "passphrase prompt task failed");
                request.abandon();
            }
        }
    }
}

fn read_stdin_line() -> io::Result<Option<String>> {
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}
