use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use objsync_core::{
    Credentials, DEFAULT_DOWNLOAD_TTL_SECS, StoreEndpoints, StoreError, Zone,
};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./cfg.json";
const DEFAULT_LEDGER_PATH: &str = "./.files.db";
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("invalid storage endpoint: {0}")]
    Endpoint(#[from] StoreError),
}

/// On-disk shape of the config file. Every key is optional so environment
/// variables can fill the gaps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub sync_folder: Option<PathBuf>,
    pub duration: Option<u64>,
    pub download_domain: Option<String>,
    pub zone: Option<String>,
    pub remote_prefix: Option<String>,
    pub ledger_path: Option<PathBuf>,
    pub upload_host: Option<String>,
    pub list_host: Option<String>,
    pub manage_host: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub claim_timeout_secs: Option<u64>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub credentials: Credentials,
    pub bucket: String,
    pub sync_root: PathBuf,
    pub remote_prefix: String,
    pub poll_interval: Duration,
    pub download_domain: String,
    pub endpoints: StoreEndpoints,
    pub ledger_path: PathBuf,
    pub request_timeout: Duration,
    pub claim_timeout: Duration,
    pub download_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl DaemonConfig {
    /// Loads `path` (when given) or the default `./cfg.json` (when present),
    /// then applies `OBJSYNC_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => read_file_config(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    read_file_config(default)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Self::from_sources(file, |name| std::env::var(name).ok())
    }

    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_key = env("OBJSYNC_ACCESS_KEY")
            .or(file.access_key)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("accessKey"))?;
        let secret_key = env("OBJSYNC_SECRET_KEY")
            .or(file.secret_key)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("secretKey"))?;
        let bucket = env("OBJSYNC_BUCKET")
            .or(file.bucket)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("bucket"))?;
        let sync_root = env("OBJSYNC_SYNC_DIR")
            .map(PathBuf::from)
            .or(file.sync_folder)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::Missing("syncFolder"))?;
        let download_domain = env("OBJSYNC_DOWNLOAD_DOMAIN")
            .or(file.download_domain)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("downloadDomain"))?;

        let poll_secs = match env("OBJSYNC_POLL_SECS") {
            Some(value) => value.trim().parse::<u64>().map_err(|_| ConfigError::Invalid {
                field: "duration",
                reason: format!("not a number of seconds: {value}"),
            })?,
            None => file.duration.unwrap_or(DEFAULT_POLL_SECS),
        };
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "duration",
                reason: "must be at least one second".into(),
            });
        }

        let zone = Zone::parse(file.zone.as_deref().unwrap_or_default())?;
        let defaults = zone.endpoints()?;
        let endpoints = StoreEndpoints::new(
            file.upload_host
                .as_deref()
                .unwrap_or(defaults.upload.as_str()),
            file.list_host.as_deref().unwrap_or(defaults.list.as_str()),
            file.manage_host
                .as_deref()
                .unwrap_or(defaults.manage.as_str()),
        )?;

        let mut remote_prefix = file
            .remote_prefix
            .unwrap_or_else(|| prefix_for_folder(&sync_root));
        if !remote_prefix.is_empty() && !remote_prefix.ends_with('/') {
            remote_prefix.push('/');
        }
        if remote_prefix.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "remotePrefix",
                reason: "object keys must not start with '/'".into(),
            });
        }

        let backoff_base = file.backoff_base_secs.unwrap_or(DEFAULT_BACKOFF_BASE_SECS);
        let backoff_max = file.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS);
        if backoff_max < backoff_base {
            return Err(ConfigError::Invalid {
                field: "backoffMaxSecs",
                reason: "must not be smaller than backoffBaseSecs".into(),
            });
        }

        Ok(Self {
            credentials: Credentials::new(access_key, secret_key),
            bucket,
            sync_root,
            remote_prefix,
            poll_interval: Duration::from_secs(poll_secs),
            download_domain,
            endpoints,
            ledger_path: env("OBJSYNC_LEDGER_PATH")
                .map(PathBuf::from)
                .or(file.ledger_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
            request_timeout: Duration::from_secs(
                file.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(1),
            ),
            claim_timeout: Duration::from_secs(
                file.claim_timeout_secs
                    .unwrap_or(DEFAULT_CLAIM_TIMEOUT_SECS),
            ),
            download_ttl: Duration::from_secs(DEFAULT_DOWNLOAD_TTL_SECS.unsigned_abs()),
            backoff_base: Duration::from_secs(backoff_base),
            backoff_max: Duration::from_secs(backoff_max),
        })
    }
}

/// Keys mirror the sync folder's own path: `./todo` stores `a.txt` as `todo/a.txt`.
fn prefix_for_folder(folder: &Path) -> String {
    let mut prefix = String::new();
    for component in folder.components() {
        match component {
            Component::Normal(part) => {
                prefix.push_str(&part.to_string_lossy());
                prefix.push('/');
            }
            Component::ParentDir => prefix.push_str("../"),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    prefix
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let body = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
