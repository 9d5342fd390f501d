//! Application Configuration
//!
//! This module provides configuration management for the application,
//! supporting YAML configuration files with sensible defaults. The loaded
//! configuration is injected into every component at construction time;
//! nothing reads configuration ambiently after startup.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use log::{info, warn};

/// Blob store backend types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BlobBackend {
    LocalFs,
    Mock,
}

impl Default for BlobBackend {
    fn default() -> Self {
        BlobBackend::LocalFs
    }
}

impl std::str::FromStr for BlobBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "localfs" | "local" => Ok(BlobBackend::LocalFs),
            "mock" => Ok(BlobBackend::Mock),
            _ => Err(format!("Unknown blob backend: {}", s)),
        }
    }
}

/// Metadata database backend types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DatabaseBackend {
    SQLite,
    Memory,
}

impl Default for DatabaseBackend {
    fn default() -> Self {
        DatabaseBackend::SQLite
    }
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseBackend::SQLite),
            "memory" => Ok(DatabaseBackend::Memory),
            _ => Err(format!("Unknown database backend: {}", s)),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Metadata database configuration
    pub database: DatabaseConfig,
    /// Blob store configuration
    pub blob: BlobConfig,
    /// Pipeline stage runner configuration
    pub pipeline: PipelineConfig,
    /// Reconciliation sweeper configuration
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum upload payload size in bytes
    pub max_payload_size: u64,
}

/// Metadata database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend type
    pub backend: DatabaseBackend,
    /// Database file path (ignored by the Memory backend)
    pub db_path: String,
    /// Enable WAL mode
    pub wal_mode: bool,
}

/// Blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Blob store backend type
    pub backend: BlobBackend,
    /// Bucket that holds all user data
    pub bucket: String,
    /// Base path for the local filesystem backend
    pub base_path: String,
    /// Public base URL presigned download links are built from
    pub public_url: String,
    /// Secret used to sign download links
    pub signing_secret: String,
    /// Lifetime of presigned download links in seconds
    pub presign_expiry_secs: u64,
}

/// Pipeline stage runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Interpreter used to run collaborator scripts
    pub interpreter: String,
    /// Directory containing the collaborator scripts
    pub scripts_dir: String,
    /// FASTA sequence counting script
    pub fasta_script: String,
    /// PCR simulation script
    pub pcr_script: String,
    /// FASTQ generation script
    pub fastq_script: String,
    /// Hard wall-clock limit for a collaborator run in seconds
    pub timeout_secs: u64,
}

/// Reconciliation sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Enable the background sweep
    pub enabled: bool,
    /// Background sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Files younger than this many days are never probed
    pub grace_days: i64,
    /// Per-probe timeout in seconds
    pub probe_timeout_secs: u64,
    /// Number of concurrent probes
    pub workers: usize,
    /// Maximum candidates examined per sweep
    pub batch_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Path to log configuration file
    pub config_file: String,
}

impl AppConfig {
    /// Load configuration from file, use defaults if not found
    ///
    /// The config path defaults to `config.yaml` and can be overridden with
    /// the `SEQVAULT_CONFIG` environment variable.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = env::var("SEQVAULT_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        if Path::new(&config_path).exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: AppConfig = serde_yaml::from_str(&content)?;
            info!("Loaded configuration from {}", config_path);
            Ok(config)
        } else {
            warn!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            blob: BlobConfig::default(),
            pipeline: PipelineConfig::default(),
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9710,
            workers: 4,
            max_payload_size: 10 * 1024 * 1024, // 10MB upload cap
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::SQLite,
            db_path: "./data/seqvault.db".to_string(),
            wal_mode: true,
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::LocalFs,
            bucket: "seqvault-userdata".to_string(),
            base_path: "./data/blobs".to_string(),
            public_url: "http://127.0.0.1:9710/blobs".to_string(),
            signing_secret: "dev-signing-secret".to_string(),
            presign_expiry_secs: 300, // 5 minutes
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            scripts_dir: "./scripts".to_string(),
            fasta_script: "process_fasta.py".to_string(),
            pcr_script: "pcr.py".to_string(),
            fastq_script: "create_fastq.py".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 3600,
            grace_days: 7,
            probe_timeout_secs: 3,
            workers: 5,
            batch_size: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}
