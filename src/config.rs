use crate::{errors::ConfigError, models::Mapping};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_DATABASE_PATH: &str = "data.db";
const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Synchronization settings loaded from the JSON configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Location of the SQLite metadata store.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Maximum number of object transfers in flight per mapping.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    pub providers: Vec<ProviderConfig>,

    /// Processed in order, one mapping at a time.
    pub mappings: Vec<Mapping>,
}

/// One storage provider, referenced by mappings through its `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

/// Provider type and its type-specific settings (`"type": "local"` ...).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderKind {
    /// Buckets stored as directories beneath `root`.
    Local { root: PathBuf },
    /// Buckets held in memory for the lifetime of the process.
    Memory,
}

impl ProviderKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ProviderKind::Local { .. } => "local",
            ProviderKind::Memory => "memory",
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE_PATH)
}

fn default_concurrency() -> usize {
    1
}

impl SyncConfig {
    /// Read, parse and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check provider ids are unique and every mapping resolves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        let mut ids = HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.id.clone()));
            }
        }

        if self.mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }
        for (index, mapping) in self.mappings.iter().enumerate() {
            for (side, provider_id, bucket) in [
                ("source", &mapping.source_provider_id, &mapping.source_bucket),
                ("target", &mapping.target_provider_id, &mapping.target_bucket),
            ] {
                if !ids.contains(provider_id.as_str()) {
                    return Err(ConfigError::UnknownMappingProvider {
                        index,
                        side,
                        provider_id: provider_id.clone(),
                    });
                }
                if bucket.trim().is_empty() {
                    return Err(ConfigError::EmptyBucket { index, side });
                }
            }
        }
        Ok(())
    }

    /// A sample configuration syncing a local directory into memory.
    pub fn sample() -> Self {
        Self {
            database_path: default_database_path(),
            concurrency: default_concurrency(),
            providers: vec![
                ProviderConfig {
                    id: "local-disk".into(),
                    kind: ProviderKind::Local {
                        root: PathBuf::from("./data/objects"),
                    },
                },
                ProviderConfig {
                    id: "scratch".into(),
                    kind: ProviderKind::Memory,
                },
            ],
            mappings: vec![Mapping::new(
                "local-disk",
                "source-bucket",
                "scratch",
                "target-bucket",
            )],
        }
    }

    /// Write the sample configuration to `path` as pretty JSON.
    pub fn generate_default(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(&Self::sample())
            .map_err(|err| write_err(std::io::Error::other(err)))?;
        fs::write(path, json).map_err(write_err)
    }
}

/// Command-line arguments; each falls back to an environment variable.
#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental one-way bucket synchronization")]
pub struct Args {
    /// Configuration file (overrides BUCKET_SYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write a sample configuration to the config path and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Run a single synchronization pass and exit
    #[arg(long)]
    pub once: bool,

    /// Seconds between synchronization passes (overrides BUCKET_SYNC_INTERVAL)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Metadata database path (overrides the configuration file)
    #[arg(long)]
    pub database_path: Option<PathBuf>,

    /// Print per-mapping sync status from the metadata store and exit
    #[arg(long)]
    pub status: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    GenerateConfig,
    Status,
    Once,
    Periodic(Duration),
}

/// Process-level settings merged from CLI arguments and the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub database_override: Option<PathBuf>,
    pub mode: RunMode,
    pub log_json: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_config =
            env::var("BUCKET_SYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let env_interval = match env::var("BUCKET_SYNC_INTERVAL") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing BUCKET_SYNC_INTERVAL value `{}`", value))?,
            Err(env::VarError::NotPresent) => DEFAULT_INTERVAL_SECS,
            Err(err) => return Err(err).context("reading BUCKET_SYNC_INTERVAL"),
        };

        // --- Merge ---
        let interval = args.interval.unwrap_or(env_interval);
        if interval == 0 {
            anyhow::bail!("interval must be at least one second");
        }
        let mode = if args.generate_config {
            RunMode::GenerateConfig
        } else if args.status {
            RunMode::Status
        } else if args.once {
            RunMode::Once
        } else {
            RunMode::Periodic(Duration::from_secs(interval))
        };

        Ok(Self {
            config_path: args.config.unwrap_or_else(|| PathBuf::from(env_config)),
            database_override: args.database_path,
            mode,
            log_json: args.log_json,
        })
    }
}
