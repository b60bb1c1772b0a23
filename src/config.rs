//! Reader configuration loaded from `config.toml`.
//!
//! Every field is optional; command-line flags override file values and
//! built-in defaults fill the rest.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use gallery_core::cache::{CacheBudget, DEFAULT_METADATA_CAPACITY, MIN_DISK_CACHE_MIB};
use gallery_core::decode::{DEFAULT_MAX_TEXTURE_SIZE, DecodeOptions, DeviceProfile};
use gallery_core::loader::{DEFAULT_BASE_URL, DEFAULT_FETCH_CONCURRENCY, LoaderOptions, MAX_FETCH_CONCURRENCY};
use gallery_core::net::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, READ_TIMEOUT_SECS, RetryPolicy};
use gallery_core::source::Quality;
use serde::Deserialize;

const APP_DIR: &str = "gallery-reader";
const CONFIG_FILE: &str = "config.toml";

/// TOML-backed reader configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaderConfig {
    /// Gallery site root.
    pub base_url: Option<String>,
    /// Directory holding the disk image cache.
    pub cache_dir: Option<PathBuf>,
    /// Directory searched for downloaded gallery archives.
    pub download_dir: Option<PathBuf>,
    /// Disk cache size in MiB. Clamped to 320..=5120, not rejected.
    pub disk_cache_mib: Option<u64>,
    /// Gallery details kept in memory.
    pub metadata_capacity: Option<usize>,
    /// Fetch original images instead of resized ones.
    pub read_original: Option<bool>,
    /// Trim uniform page borders.
    pub crop_borders: Option<bool>,
    /// Page fetches in flight per loader (1..=16).
    pub fetch_concurrency: Option<usize>,
    /// Maximum attempts for transient network failures (0..=10).
    pub max_retries: Option<u32>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Largest texture edge the display accepts.
    pub max_texture_size: Option<u32>,
    /// Allow hardware-backed bitmaps.
    pub hardware_bitmaps: Option<bool>,
}

impl ReaderConfig {
    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(base_url) = &self.base_url
            && url::Url::parse(base_url).is_err()
        {
            bail!("Invalid config value for `base_url`: {base_url}. Expected an absolute URL");
        }

        if let Some(capacity) = self.metadata_capacity
            && !(1..=1000).contains(&capacity)
        {
            bail!("Invalid config value for `metadata_capacity`: {capacity}. Expected range: 1..=1000");
        }

        if let Some(concurrency) = self.fetch_concurrency
            && !(1..=MAX_FETCH_CONCURRENCY).contains(&concurrency)
        {
            bail!(
                "Invalid config value for `fetch_concurrency`: {concurrency}. Expected range: 1..={MAX_FETCH_CONCURRENCY}"
            );
        }

        if let Some(retries) = self.max_retries
            && retries > 10
        {
            bail!("Invalid config value for `max_retries`: {retries}. Expected range: 0..=10");
        }

        if let Some(size) = self.max_texture_size
            && !(256..=65_536).contains(&size)
        {
            bail!("Invalid config value for `max_texture_size`: {size}. Expected range: 256..=65536");
        }

        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }

    /// Site root, falling back to the public gallery site.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Disk cache location: configured value, then the platform cache dir.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .or_else(default_cache_dir)
            .unwrap_or_else(|| env::temp_dir().join(APP_DIR))
    }

    /// Size limits for both cache tiers.
    #[must_use]
    pub fn cache_budget(&self) -> CacheBudget {
        let mut budget = CacheBudget::from_disk_mib(self.disk_cache_mib.unwrap_or(MIN_DISK_CACHE_MIB));
        budget.metadata_entries = self.metadata_capacity.unwrap_or(DEFAULT_METADATA_CAPACITY);
        budget
    }

    /// Connect and read timeouts in seconds.
    #[must_use]
    pub fn timeouts(&self) -> (u64, u64) {
        (
            self.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
            self.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
        )
    }

    /// Loader settings derived from this config.
    #[must_use]
    pub fn loader_options(&self) -> LoaderOptions {
        let quality = if self.read_original.unwrap_or(false) {
            Quality::Original
        } else {
            Quality::Resized
        };
        let retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        LoaderOptions {
            base_url: self.base_url(),
            quality,
            decode: DecodeOptions {
                crop_borders: self.crop_borders.unwrap_or(false),
                device: DeviceProfile {
                    max_texture_size: self.max_texture_size.unwrap_or(DEFAULT_MAX_TEXTURE_SIZE),
                    hardware_bitmaps: self.hardware_bitmaps.unwrap_or(true),
                },
            },
            fetch_concurrency: self.fetch_concurrency.unwrap_or(DEFAULT_FETCH_CONCURRENCY),
            retry: RetryPolicy::with_max_attempts(retries),
        }
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed config; defaults when no file exists.
    pub config: ReaderConfig,
    /// Whether the config came from disk.
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/gallery-reader/config.toml`
/// 2. `$HOME/.config/gallery-reader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join(CONFIG_FILE));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join(CONFIG_FILE),
    )
}

fn default_cache_dir() -> Option<PathBuf> {
    if let Some(xdg_cache_home) = env_var_non_empty_os("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg_cache_home).join(APP_DIR));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config at `explicit` (which must exist) or the default path if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config,
            loaded_from_file: true,
        });
    }

    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(path_ref) if path_ref.exists() => {
            let config = load_file_config(path_ref)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: ReaderConfig::default(),
            loaded_from_file: false,
        }),
    }
}

fn load_file_config(path: &Path) -> Result<ReaderConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<ReaderConfig> {
    let config: ReaderConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}
