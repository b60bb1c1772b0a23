//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use gallery_core::gallery::GalleryRef;

/// Read image galleries page by page, from a gallery site or a local archive.
///
/// Pages are fetched lazily, cached on disk and can be exported one at a time.
#[derive(Parser, Debug)]
#[command(name = "gallery-reader")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/gallery-reader/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Cookie sent to the gallery site, as name=value (repeatable)
    #[arg(long = "cookie", global = true, value_name = "NAME=VALUE", value_parser = parse_cookie)]
    pub cookies: Vec<(String, String)>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load every page of a gallery and report per-page outcomes
    Read(ReadArgs),
    /// Copy one page to a file
    Export(ExportArgs),
    /// Inspect or clear the page cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Gallery selection shared by `read` and `export`.
#[derive(Args, Debug, Clone)]
pub struct GallerySelection {
    /// Gallery id on the site
    #[arg(value_name = "GID", required_unless_present = "archive")]
    pub gid: Option<u64>,

    /// Gallery token on the site
    #[arg(value_name = "TOKEN", required_unless_present = "archive")]
    pub token: Option<String>,

    /// Read a local archive instead of a remote gallery
    #[arg(long, value_name = "PATH", conflicts_with_all = ["gid", "token"])]
    pub archive: Option<PathBuf>,
}

impl GallerySelection {
    /// The selected gallery, or `None` when the token is missing.
    #[must_use]
    pub fn gallery(&self) -> Option<GalleryRef> {
        if let Some(path) = &self.archive {
            return Some(GalleryRef::archive(path.clone()));
        }
        Some(GalleryRef::remote(self.gid?, self.token.clone()?))
    }
}

/// Loader overrides accepted by page-loading subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct LoadOverrides {
    /// Fetch original images instead of resized ones
    #[arg(long)]
    pub original: bool,

    /// Trim uniform page borders
    #[arg(long)]
    pub crop_borders: bool,

    /// Maximum concurrent page fetches (1-16)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub concurrency: Option<u8>,

    /// Gallery site root
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Disk cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Arguments for `read`.
#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub gallery: GallerySelection,

    #[command(flatten)]
    pub overrides: LoadOverrides,

    /// 1-based page to start reading from
    #[arg(long, value_name = "PAGE", value_parser = clap::value_parser!(u64).range(1..))]
    pub start: Option<u64>,
}

/// Arguments for `export`.
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// 1-based page number
    #[arg(value_name = "PAGE", value_parser = clap::value_parser!(u64).range(1..))]
    pub page: u64,

    /// Destination file
    #[arg(value_name = "DEST")]
    pub dest: PathBuf,

    #[command(flatten)]
    pub gallery: GallerySelection,

    #[command(flatten)]
    pub overrides: LoadOverrides,
}

/// `cache` actions.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Show entry count and size of the disk cache
    Stats,
    /// Remove every cached page
    Clear,
}

fn parse_cookie(raw: &str) -> Result<(String, String), String> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(format!("expected NAME=VALUE, got '{raw}'"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err("cookie name must not be empty".to_string());
    }
    Ok((name.to_string(), value.trim().to_string()))
}
