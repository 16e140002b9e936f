//! Azure Blob Storage catalog backend.
//!
//! Talks to the Blob REST API with a container SAS token. Blob storage has
//! no real directories, so folder creation and deletion are no-ops and a
//! folder exists when any blob lives under its prefix.

use crate::archive;
use crate::error::{StorageError, StorageResult, join_error};
use crate::traits::{
    BackendProbe, CheckOutcome, ProgressSender, ProgressSink, StorageBackend, object_key,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::TryStreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, instrument};
use uuid::Uuid;
use vmcatalog_core::{ContentHash, Provider};

pub const PROVIDER_NAME: &str = "azure-storage-account";

const API_VERSION: &str = "2021-08-06";
const CHECKSUM_HEADER: &str = "x-ms-meta-sha256";

/// Uploads above this size are split into blocks of this size (32 MiB).
const BLOCK_SIZE: usize = 32 * 1024 * 1024;

/// Characters escaped in blob paths; `/` separates virtual directories.
const BLOB_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings from `storage_account_name`, `container_name`,
/// `sas_token` and an optional `endpoint` override.
#[derive(Clone, Default)]
pub struct AzureSettings {
    pub account: String,
    pub container: String,
    pub sas_token: String,
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for AzureSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureSettings")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AzureSettings {
    pub fn from_provider(connection: &Provider) -> StorageResult<Self> {
        let get = |key: &str| {
            connection
                .get_meta(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let account = get("storage_account_name")
            .ok_or_else(|| StorageError::Config("missing storage account name".to_string()))?;
        let container = get("container_name").ok_or_else(|| {
            StorageError::Config("missing storage account container name".to_string())
        })?;
        let sas_token = match get("sas_token") {
            Some(token) => token.trim_start_matches('?').to_string(),
            None if get("storage_account_key").is_some() => {
                return Err(StorageError::Config(
                    "storage_account_key authentication is not supported, provide a sas_token"
                        .to_string(),
                ));
            }
            None => return Err(StorageError::Config("missing sas_token".to_string())),
        };

        Ok(Self {
            account,
            container,
            sas_token,
            endpoint: get("endpoint").map(|e| e.trim_end_matches('/').to_string()),
        })
    }
}

/// Azure Blob Storage catalog backend.
#[derive(Debug)]
pub struct AzureBlobBackend {
    client: Client,
    settings: AzureSettings,
    progress: ProgressSink,
}

impl AzureBlobBackend {
    pub fn new(settings: AzureSettings) -> StorageResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("vmcatalog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            settings,
            progress: ProgressSink::default(),
        })
    }

    fn container_url(&self) -> String {
        let base = match &self.settings.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}.blob.core.windows.net", self.settings.account),
        };
        format!("{base}/{}", self.settings.container)
    }

    /// Blob URL with the SAS token and any extra query appended.
    fn blob_url(&self, key: &str, query: &str) -> String {
        let path = utf8_percent_encode(key, BLOB_PATH);
        let mut url = format!("{}/{path}?", self.container_url());
        if !query.is_empty() {
            url.push_str(query);
            url.push('&');
        }
        url.push_str(&self.settings.sas_token);
        url
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
    }

    async fn check_status(response: Response) -> StorageResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StorageError::Azure {
            status: status.as_u16(),
            message,
        })
    }

    async fn head(&self, key: &str) -> StorageResult<Option<Response>> {
        let response = self
            .request(Method::HEAD, self.blob_url(key, ""))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check_status(response).await?))
    }

    async fn get(&self, key: &str) -> StorageResult<Response> {
        let response = self
            .request(Method::GET, self.blob_url(key, ""))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Self::check_status(response).await
    }

    async fn put_blocks(
        &self,
        key: &str,
        mut file: fs::File,
        checksum: &str,
        total: u64,
        label: &str,
    ) -> StorageResult<()> {
        let mut block_ids = Vec::new();
        let mut sent = 0u64;
        loop {
            let mut buf = Vec::with_capacity(BLOCK_SIZE);
            (&mut file)
                .take(BLOCK_SIZE as u64)
                .read_to_end(&mut buf)
                .await?;
            if buf.is_empty() {
                break;
            }
            let block_id = general_purpose::STANDARD.encode(format!("{:08}", block_ids.len()));
            let query = format!(
                "comp=block&blockid={}",
                utf8_percent_encode(&block_id, NON_ALPHANUMERIC)
            );
            sent += buf.len() as u64;
            let response = self
                .request(Method::PUT, self.blob_url(key, &query))
                .body(buf)
                .send()
                .await?;
            Self::check_status(response).await?;
            self.progress.report(label, sent, total);
            block_ids.push(block_id);
        }

        let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
        for id in &block_ids {
            body.push_str(&format!("<Latest>{id}</Latest>"));
        }
        body.push_str("</BlockList>");

        let response = self
            .request(Method::PUT, self.blob_url(key, "comp=blocklist"))
            .header(CHECKSUM_HEADER, checksum)
            .body(body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for AzureBlobBackend {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn can_stream(&self) -> bool {
        true
    }

    fn provider_root_path(&self) -> String {
        "/".to_string()
    }

    fn provider_meta(&self) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::from([
            ("provider".to_string(), PROVIDER_NAME.to_string()),
            (
                "storage_account_name".to_string(),
                self.settings.account.clone(),
            ),
            ("container_name".to_string(), self.settings.container.clone()),
            ("sas_token".to_string(), self.settings.sas_token.clone()),
        ]);
        if let Some(endpoint) = &self.settings.endpoint {
            meta.insert("endpoint".to_string(), endpoint.clone());
        }
        meta
    }

    fn set_progress_channel(&self, sender: ProgressSender) {
        self.progress.set(sender);
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        Ok(self.head(&object_key(dir, name)).await?.is_some())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        let prefix = object_key(dir, name);
        let prefix = if prefix.is_empty() { prefix } else { format!("{prefix}/") };
        let url = format!(
            "{}?restype=container&comp=list&maxresults=1&prefix={}&{}",
            self.container_url(),
            utf8_percent_encode(&prefix, NON_ALPHANUMERIC),
            self.settings.sas_token
        );
        let response = self.request(Method::GET, url).send().await?;
        let listing = Self::check_status(response).await?.text().await?;
        Ok(listing.contains("<Blob>"))
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String> {
        let key = object_key(dir, name);
        let response = self
            .head(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        let headers = response.headers();
        if let Some(sha) = headers.get(CHECKSUM_HEADER).and_then(|v| v.to_str().ok()) {
            return Ok(sha.to_string());
        }
        let md5 = headers
            .get("content-md5")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::NotFound(format!("{key} has no checksum")))?;
        let raw = general_purpose::STANDARD
            .decode(md5)
            .map_err(|e| StorageError::Azure {
                status: 200,
                message: format!("invalid Content-MD5 header: {e}"),
            })?;
        Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64> {
        let key = object_key(dir, name);
        let response = self
            .head(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        Ok(response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    #[instrument(skip(self, local_dir), fields(backend = "azure"))]
    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()> {
        let source = local_dir.join(name);
        let key = object_key(dir, name);
        let total = fs::metadata(&source).await?.len();
        let checksum = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || ContentHash::of_file(&source))
                .await
                .map_err(join_error)??
                .to_hex()
        };

        if total as usize <= BLOCK_SIZE {
            let data = fs::read(&source).await?;
            let response = self
                .request(Method::PUT, self.blob_url(&key, ""))
                .header("x-ms-blob-type", "BlockBlob")
                .header(CHECKSUM_HEADER, &checksum)
                .body(data)
                .send()
                .await?;
            Self::check_status(response).await?;
            self.progress.report(name, total, total);
        } else {
            let file = fs::File::open(&source).await?;
            self.put_blocks(&key, file, &checksum, total, name).await?;
        }
        debug!(key = %key, size = total, "pushed blob");
        Ok(())
    }

    #[instrument(skip(self, destination), fields(backend = "azure"))]
    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()> {
        let key = object_key(dir, name);
        let response = self.get(&key).await?;
        let total = response.content_length().unwrap_or(0);
        let mut stream = response.bytes_stream();

        fs::create_dir_all(destination).await?;
        let dest = destination.join(name);
        let temp = destination.join(format!("{name}.tmp.{}", Uuid::new_v4()));
        let result = async {
            let mut out = fs::File::create(&temp).await?;
            let mut done = 0u64;
            while let Some(chunk) = stream.try_next().await? {
                out.write_all(&chunk).await?;
                done += chunk.len() as u64;
                self.progress.report(name, done, total);
            }
            out.sync_all().await?;
            fs::rename(&temp, &dest).await?;
            Ok::<_, StorageError>(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes> {
        let response = self.get(&object_key(dir, name)).await?;
        Ok(response.bytes().await?)
    }

    #[instrument(skip(self, destination), fields(backend = "azure"))]
    async fn pull_file_and_decompress(
        &self,
        dir: &str,
        name: &str,
        destination: &Path,
    ) -> StorageResult<()> {
        let response = self.get(&object_key(dir, name)).await?;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let bridge = SyncIoBridge::new(StreamReader::new(stream));
        let destination = destination.to_path_buf();
        let fallback = name.trim_end_matches(".gz").to_string();
        tokio::task::spawn_blocking(move || {
            archive::unpack_reader(bridge, &destination, &fallback)
        })
        .await
        .map_err(join_error)??;
        self.progress.report(name, 1, 1);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "azure"))]
    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()> {
        let response = self
            .request(Method::DELETE, self.blob_url(&object_key(dir, name), ""))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(response).await?;
        Ok(())
    }

    async fn create_folder(&self, _dir: &str, _name: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn delete_folder(&self, _dir: &str, _name: &str) -> StorageResult<()> {
        Ok(())
    }
}

/// Claims `provider=azure-storage-account` connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct AzureProbe;

#[async_trait]
impl BackendProbe for AzureProbe {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn check(&self, connection: &Provider) -> StorageResult<CheckOutcome> {
        if !connection.kind.eq_ignore_ascii_case(PROVIDER_NAME) {
            return Ok(CheckOutcome::NotMatched);
        }
        let settings = AzureSettings::from_provider(connection)?;
        Ok(CheckOutcome::Matched(Arc::new(AzureBlobBackend::new(
            settings,
        )?)))
    }
}
