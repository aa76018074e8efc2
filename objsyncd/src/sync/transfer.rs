use std::{io, path::Path, time::Duration};

use futures_util::StreamExt;
use objsync_core::UploadTarget;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use super::paths::partial_path;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Moves file bodies between the sync root and the bucket.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransferError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    /// Streams `url` into `target`, creating parent directories.
    ///
    /// The body lands in a `.partial` sibling first and is renamed into place
    /// only once complete, so `target` never holds a truncated file.
    pub async fn download_to_path(&self, url: &Url, target: &Path) -> Result<(), TransferError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        match self.stream_into(url, &partial).await {
            Ok(()) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn stream_into(&self, url: &Url, partial: &Path) -> Result<(), TransferError> {
        let response = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Form upload of `source` to the key and token in `target`.
    pub async fn upload_from_path(
        &self,
        target: &UploadTarget,
        source: &Path,
    ) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.key.clone());
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let form = Form::new()
            .text("token", target.token.clone())
            .text("key", target.key.clone())
            .part("file", Part::stream_with_length(body, length).file_name(file_name));
        self.http
            .post(target.url.clone())
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
