use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use revenant_api::ApiConfig;
use revenant_client::{DirBlobStore, GatewayBlobStore, HttpAnchor, Timeouts};
use revenant_core::{Anchor, BlobStore, InMemoryBlobStore, RecordingAnchor};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_DB: &str = "./revenant.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "revenant-service")]
#[command(about = "HTTP service for agent identity, backups and trust")]
pub struct Args {
    /// YAML file with service settings; flags and environment override it.
    #[arg(long, env = "REVENANT_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "REVENANT_DB")]
    pub db: Option<PathBuf>,
    #[arg(long, env = "REVENANT_BIND")]
    pub bind: Option<SocketAddr>,
    /// Mirror blobs into a local directory instead of a gateway.
    #[arg(long, env = "REVENANT_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,
    #[arg(long, env = "REVENANT_UPLOAD_URL")]
    pub upload_url: Option<String>,
    #[arg(long, env = "REVENANT_GATEWAY_URL")]
    pub gateway_url: Option<String>,
    #[arg(long, env = "REVENANT_RELAY_URL")]
    pub relay_url: Option<String>,
    /// Record anchor submissions in memory when no relay is configured (development only).
    #[arg(long, env = "REVENANT_LOCAL_ANCHOR")]
    pub local_anchor: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: Option<PathBuf>,
    pub upload_url: Option<String>,
    pub gateway_url: Option<String>,
}

/// Background job cadence, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobConfig {
    pub relay_interval_secs: u64,
    pub relay_batch: usize,
    pub sweep_interval_secs: u64,
    pub trust_interval_secs: u64,
    pub trust_concurrency: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            relay_interval_secs: 30,
            relay_batch: 50,
            sweep_interval_secs: 3600,
            trust_interval_secs: 6 * 3600,
            trust_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub db: PathBuf,
    pub bind: SocketAddr,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub relay_url: Option<String>,
    pub local_anchor: bool,
    pub jobs: JobConfig,
    pub http_connect_timeout_secs: u64,
    pub http_read_timeout_secs: u64,
    pub max_backup_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from(DEFAULT_DB),
            bind: SocketAddr::from(([127, 0, 0, 1], 4020)),
            api: ApiConfig::default(),
            storage: StorageConfig::default(),
            relay_url: None,
            local_anchor: false,
            jobs: JobConfig::default(),
            http_connect_timeout_secs: 5,
            http_read_timeout_secs: 30,
            max_backup_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// File settings (or defaults) overlaid with whatever the command line supplied.
    ///
    /// # Errors
    /// Returns an error when the config file is unreadable.
    pub fn resolve(args: Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(db) = args.db {
            config.db = db;
        }
        if let Some(bind) = args.bind {
            config.bind = bind;
        }
        if let Some(dir) = args.storage_dir {
            config.storage.dir = Some(dir);
        }
        if args.upload_url.is_some() {
            config.storage.upload_url = args.upload_url;
        }
        if args.gateway_url.is_some() {
            config.storage.gateway_url = args.gateway_url;
        }
        if args.relay_url.is_some() {
            config.relay_url = args.relay_url;
        }
        config.local_anchor |= args.local_anchor;
        Ok(config)
    }

    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.http_connect_timeout_secs),
            read: Duration::from_secs(self.http_read_timeout_secs),
        }
    }

    /// A local directory wins over a gateway; with neither, blobs live in memory only.
    ///
    /// # Errors
    /// Returns an error for a half-configured gateway or an unusable directory.
    pub fn blob_store(&self) -> Result<Arc<dyn BlobStore>> {
        if let Some(dir) = &self.storage.dir {
            return Ok(Arc::new(DirBlobStore::open(dir)?));
        }
        match (&self.storage.upload_url, &self.storage.gateway_url) {
            (Some(upload), Some(gateway)) => {
                Ok(Arc::new(GatewayBlobStore::new(upload, gateway, self.timeouts())))
            }
            (None, None) => {
                warn!("no permanent storage configured, backups are kept in memory");
                Ok(Arc::new(InMemoryBlobStore::new()))
            }
            _ => Err(anyhow!("storage gateway needs both upload_url and gateway_url")),
        }
    }

    /// The configured relay, or a bounded in-memory recorder when `local_anchor` is set.
    ///
    /// # Errors
    /// Returns an error when neither a relay URL nor `local_anchor` is configured.
    pub fn anchor(&self) -> Result<Arc<dyn Anchor>> {
        match &self.relay_url {
            Some(url) => Ok(Arc::new(HttpAnchor::new(url, self.timeouts()))),
            None if self.local_anchor => {
                warn!("no anchor relay configured, submissions are recorded in memory only");
                Ok(Arc::new(RecordingAnchor::new()))
            }
            None => Err(anyhow!("relay_url is required unless local_anchor is enabled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn args(config: Option<PathBuf>) -> Args {
        Args {
            config,
            db: None,
            bind: None,
            storage_dir: None,
            upload_url: None,
            gateway_url: None,
            relay_url: None,
            local_anchor: false,
        }
    }

    #[test]
    fn yaml_fills_unset_fields_with_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("service.yaml");
        std::fs::write(
            &path,
            "db: /var/lib/revenant/db.sqlite3\n\
             api:\n  attestation_cooldown_secs: 60\n\
             jobs:\n  relay_interval_secs: 5\n",
        )?;
        let config = ServiceConfig::resolve(args(Some(path)))?;
        assert_eq!(config.db, PathBuf::from("/var/lib/revenant/db.sqlite3"));
        assert_eq!(config.api.attestation_cooldown_secs, 60);
        assert_eq!(config.api.relay_max_attempts, ApiConfig::default().relay_max_attempts);
        assert_eq!(config.jobs.relay_interval_secs, 5);
        assert_eq!(config.jobs.relay_batch, JobConfig::default().relay_batch);
        Ok(())
    }

    #[test]
    fn flags_override_the_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("service.yaml");
        std::fs::write(&path, "db: from-file.sqlite3\nrelay_url: http://relay.invalid\n")?;
        let mut overrides = args(Some(path));
        overrides.db = Some(PathBuf::from("from-flag.sqlite3"));
        overrides.bind = Some("0.0.0.0:9000".parse()?);
        let config = ServiceConfig::resolve(overrides)?;
        assert_eq!(config.db, PathBuf::from("from-flag.sqlite3"));
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.relay_url.as_deref(), Some("http://relay.invalid"));
        Ok(())
    }

    #[test]
    fn anchor_needs_a_relay_or_an_explicit_local_opt_in() -> Result<()> {
        let mut config = ServiceConfig::resolve(args(None))?;
        assert!(config.anchor().is_err());

        let mut local = args(None);
        local.local_anchor = true;
        assert!(ServiceConfig::resolve(local)?.anchor().is_ok());

        config.relay_url = Some("http://relay.invalid".to_string());
        assert!(config.anchor().is_ok());
        Ok(())
    }

    #[test]
    fn half_configured_gateway_is_rejected() {
        let mut config = ServiceConfig::default();
        config.storage.upload_url = Some("http://upload.invalid".to_string());
        assert!(config.blob_store().is_err());
        config.storage.gateway_url = Some("http://gateway.invalid".to_string());
        assert!(config.blob_store().is_ok());
    }
}
