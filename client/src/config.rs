//! Mount configuration: a TOML file with CLI overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the directory/store server.
    pub server_url: String,
    /// The mounting user, `name@domain`.
    pub user: String,
    /// Local cache root; the per-user `fscache` tree lives below it.
    pub cache_dir: PathBuf,
    /// Byte ceiling for closed cache files.
    pub cache_size: u64,
    /// Cleartext bytes per stored block.
    pub block_size: usize,
    /// Push every write remotely instead of waiting for flush/release.
    pub write_through: bool,
    /// Pass allow_other to the kernel mount.
    pub allow_other: bool,
    /// Log filter when RUST_LOG is unset.
    pub log: String,
    /// Path of the signing-key file; a fresh in-memory key when absent.
    pub secrets: Option<PathBuf>,
    pub kernel_ttl_seconds: u64,
    pub dircache_ttl_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Config {
            server_url: "http://127.0.0.1:8080".to_string(),
            user: "user@example.org".to_string(),
            cache_dir: PathBuf::from(home).join(".cache").join("vaultfs"),
            cache_size: 5 << 30,
            block_size: 1 << 20,
            write_through: false,
            allow_other: false,
            log: "info".to_string(),
            secrets: None,
            kernel_ttl_seconds: 1,
            dircache_ttl_seconds: 5,
        }
    }
}

impl Config {
    pub fn kernel_ttl(&self) -> Duration {
        Duration::from_secs(self.kernel_ttl_seconds)
    }
}

/// Read the config file, falling back to defaults when it is missing or
/// unparsable; a bad config should degrade the mount, not prevent it.
pub fn load(path: Option<&Path>) -> Config {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from("config.toml"),
    };
    if !path.exists() {
        return Config::default();
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot read {}: {}; using defaults", path.display(), e);
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot parse {}: {}; using defaults", path.display(), e);
            Config::default()
        }
    }
}
