use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::{Credentials, encode_entry};

const LIST_PAGE_LIMIT: u32 = 1000;
pub const DEFAULT_DOWNLOAD_TTL_SECS: i64 = 3600;

// Non-standard status the storage API returns for a missing key.
const STATUS_NO_SUCH_ENTRY: u16 = 612;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to encode upload policy: {0}")]
    Policy(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("unknown zone: {0}")]
    UnknownZone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

/// Storage region; each one maps to a fixed set of service hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zone {
    #[default]
    East,
    North,
    South,
    NorthAmerica,
}

impl Zone {
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value.trim() {
            "" | "east" | "z0" | "华东" => Ok(Zone::East),
            "north" | "z1" | "华北" => Ok(Zone::North),
            "south" | "z2" | "华南" => Ok(Zone::South),
            "north-america" | "na0" | "北美" => Ok(Zone::NorthAmerica),
            other => Err(StoreError::UnknownZone(other.to_string())),
        }
    }

    pub fn endpoints(self) -> Result<StoreEndpoints, StoreError> {
        let (upload, list, manage) = match self {
            Zone::East => (
                "https://up.qiniup.com",
                "https://rsf.qbox.me",
                "https://rs.qbox.me",
            ),
            Zone::North => (
                "https://up-z1.qiniup.com",
                "https://rsf-z1.qbox.me",
                "https://rs-z1.qbox.me",
            ),
            Zone::South => (
                "https://up-z2.qiniup.com",
                "https://rsf-z2.qbox.me",
                "https://rs-z2.qbox.me",
            ),
            Zone::NorthAmerica => (
                "https://up-na0.qiniup.com",
                "https://rsf-na0.qbox.me",
                "https://rs-na0.qbox.me",
            ),
        };
        StoreEndpoints::new(upload, list, manage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEndpoints {
    pub upload: Url,
    pub list: Url,
    pub manage: Url,
}

impl StoreEndpoints {
    /// Hosts may carry a path (`http://gateway/qiniu`); API paths are resolved under it.
    pub fn new(upload: &str, list: &str, manage: &str) -> Result<Self, StoreError> {
        Ok(Self {
            upload: parse_base(upload)?,
            list: parse_base(list)?,
            manage: parse_base(manage)?,
        })
    }

    /// All three services behind one base url; used by tests and self-hosted gateways.
    pub fn single(base: &str) -> Result<Self, StoreError> {
        Self::new(base, base, base)
    }
}

fn parse_base(raw: &str) -> Result<Url, StoreError> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Where and how to send a form upload for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: Url,
    pub key: String,
    pub token: String,
}

#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    endpoints: StoreEndpoints,
    credentials: Credentials,
    bucket: String,
}

impl StoreClient {
    pub fn new(
        credentials: Credentials,
        bucket: impl Into<String>,
        zone: Zone,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        Self::with_endpoints(credentials, bucket, zone.endpoints()?, timeout)
    }

    pub fn with_endpoints(
        credentials: Credentials,
        bucket: impl Into<String>,
        endpoints: StoreEndpoints,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            endpoints,
            credentials,
            bucket: bucket.into(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        limit: u32,
    ) -> Result<ListPage, StoreError> {
        let mut url = self.endpoints.list.join("list")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("bucket", &self.bucket);
            query.append_pair("prefix", prefix);
            if let Some(marker) = marker.filter(|m| !m.is_empty()) {
                query.append_pair("marker", marker);
            }
            query.append_pair("limit", &limit.max(1).to_string());
        }
        let authorization = self.credentials.management_authorization(&url, None);
        let response = self
            .http
            .get(url)
            .header("Authorization", authorization)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Follows continuation markers until the listing is exhausted.
    pub async fn list_all(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let mut marker: Option<String> = None;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_page(prefix, marker.as_deref(), LIST_PAGE_LIMIT)
                .await?;
            let next = page.next_marker().map(str::to_string);
            items.extend(page.items);
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        tracing::debug!(bucket = %self.bucket, prefix, count = items.len(), "listed bucket");
        Ok(items)
    }

    pub fn upload_target(&self, key: &str, deadline: i64) -> Result<UploadTarget, StoreError> {
        Ok(UploadTarget {
            url: self.endpoints.upload.clone(),
            key: key.to_string(),
            token: self.credentials.upload_token(&self.bucket, key, deadline)?,
        })
    }

    /// Deletes `key`; a key that is already gone counts as deleted.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self
            .endpoints
            .manage
            .join(&format!("delete/{}", encode_entry(&self.bucket, key)))?;
        let authorization = self.credentials.management_authorization(&url, None);
        let response = self
            .http
            .post(url)
            .header("Authorization", authorization)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let err = StoreError::Api { status, body };
        if err.is_not_found() {
            tracing::debug!(key, "remote object already absent");
            return Ok(());
        }
        Err(err)
    }

    pub fn private_download_url(
        &self,
        domain: &str,
        key: &str,
        deadline: i64,
    ) -> Result<Url, StoreError> {
        Ok(self
            .credentials
            .private_download_url(domain, key, deadline)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Api { status, body })
        }
    }
}

impl StoreError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            StoreError::Api { status, .. } => Some(classify_api_status(*status)),
            StoreError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND || status.as_u16() == STATUS_NO_SUCH_ENTRY {
        ApiErrorClass::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    #[serde(rename = "fsize", default)]
    pub size: i64,
    /// Upload time in 100-nanosecond units since the Unix epoch.
    #[serde(rename = "putTime", default)]
    pub put_time: i64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

impl ObjectEntry {
    pub fn mod_time_nanos(&self) -> i64 {
        self.put_time.saturating_mul(100)
    }

    pub fn is_dir_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ListPage {
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub items: Vec<ObjectEntry>,
}

impl ListPage {
    pub fn next_marker(&self) -> Option<&str> {
        self.marker.as_deref().filter(|m| !m.is_empty())
    }
}
