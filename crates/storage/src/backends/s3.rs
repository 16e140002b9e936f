//! S3-compatible catalog backend using AWS SDK.

use crate::archive;
use crate::error::{StorageError, StorageResult, join_error};
use crate::traits::{
    BackendProbe, CheckOutcome, ProgressSender, ProgressSink, StorageBackend, object_key,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use vmcatalog_core::{ContentHash, Provider};

pub const PROVIDER_NAME: &str = "aws-s3";

/// Object metadata key holding the hex SHA-256 of the uploaded file.
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

/// Files above this size go through multipart upload; also the part size (64 MiB).
const MULTIPART_PART_SIZE: usize = 64 * 1024 * 1024;

/// Read buffer for downloads (1 MiB).
const DOWNLOAD_BUFFER_SIZE: usize = 1024 * 1024;

const CREDENTIALS_ERROR_MARKER: &str = "vmcatalog-s3-lazy-credentials";

/// Defers the AWS default credential chain until the first signed request.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_init(|| async {
                aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                    .region(aws_config::Region::new(self.region.clone()))
                    .build()
                    .await
            })
            .await;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if err.to_string().contains(CREDENTIALS_ERROR_MARKER) {
        return StorageError::Config(
            "S3 credential resolution failed. Set access_key and secret_key on the connection or provide ambient AWS credentials."
                .to_string(),
        );
    }
    StorageError::S3(Box::new(err))
}

/// Connection settings read from `bucket`, `region`, `access_key`,
/// `secret_key`, `session_token`, `prefix`, `endpoint` and `force_path_style`.
#[derive(Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub prefix: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub force_path_style: bool,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .finish_non_exhaustive()
    }
}

impl S3Settings {
    /// Read settings from connection meta.
    ///
    /// Keys are mandatory unless `use_environment_authentication=true`.
    pub fn from_provider(connection: &Provider) -> StorageResult<Self> {
        let get = |key: &str| {
            connection
                .get_meta(key)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let flag = |key: &str| get(key).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let bucket = get("bucket").ok_or_else(|| missing("bucket name"))?;
        let region = get("region").ok_or_else(|| missing("bucket region"))?;
        let access_key = get("access_key");
        let secret_key = get("secret_key");
        if !flag("use_environment_authentication") {
            if access_key.is_none() {
                return Err(missing("bucket access key"));
            }
            if secret_key.is_none() {
                return Err(missing("bucket secret key"));
            }
        }

        Ok(Self {
            bucket,
            region,
            prefix: get("prefix"),
            endpoint: get("endpoint"),
            access_key,
            secret_key,
            session_token: get("session_token"),
            force_path_style: flag("force_path_style"),
        })
    }
}

fn missing(what: &str) -> StorageError {
    StorageError::Config(format!("missing {what}"))
}

/// S3-compatible catalog backend.
pub struct S3Backend {
    client: Client,
    settings: S3Settings,
    progress: ProgressSink,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Build a client. No request is sent until the first operation.
    pub fn new(settings: S3Settings) -> StorageResult<Self> {
        if settings.access_key.is_some() ^ settings.secret_key.is_some() {
            return Err(StorageError::Config(
                "s3 connection requires both access_key and secret_key when either is set"
                    .to_string(),
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let (Some(key), Some(secret)) = (&settings.access_key, &settings.secret_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key.clone(),
                secret.clone(),
                settings.session_token.clone(),
                None,
                "vmcatalog-connection",
            );
            builder = builder.credentials_provider(credentials);
        } else {
            builder = builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(settings.region.clone()));
        }

        let mut settings = settings;
        settings.endpoint = settings.endpoint.map(|endpoint| {
            let lower = endpoint.to_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint
            } else {
                format!("http://{endpoint}")
            }
        });
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
            if endpoint.to_ascii_lowercase().starts_with("http://") {
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }
        settings.prefix = settings
            .prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: Client::from_conf(builder.build()),
            settings,
            progress: ProgressSink::default(),
        })
    }

    /// Full object key for `dir/name`, prefix applied.
    fn full_key(&self, dir: &str, name: &str) -> String {
        let key = object_key(dir, name);
        match &self.settings.prefix {
            Some(prefix) if key.is_empty() => prefix.clone(),
            Some(prefix) => format!("{prefix}/{key}"),
            None => key,
        }
    }

    fn folder_prefix(&self, dir: &str, name: &str) -> String {
        let key = self.full_key(dir, name);
        if key.is_empty() { key } else { format!("{key}/") }
    }

    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    async fn head(
        &self,
        key: &str,
    ) -> StorageResult<Option<aws_sdk_s3::operation::head_object::HeadObjectOutput>> {
        match self
            .client
            .head_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output)),
            Err(err) => match Self::map_sdk_error(err, key) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn get_object(&self, key: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;
        Ok(output.body)
    }

    async fn upload_multipart(
        &self,
        key: &str,
        mut file: fs::File,
        checksum: &str,
        total: u64,
        label: &str,
    ) -> StorageResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .metadata(CHECKSUM_METADATA_KEY, checksum)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        let result = async {
            let mut parts = Vec::new();
            let mut part_number = 1;
            let mut sent = 0u64;
            loop {
                let mut buf = Vec::with_capacity(MULTIPART_PART_SIZE);
                (&mut file)
                    .take(MULTIPART_PART_SIZE as u64)
                    .read_to_end(&mut buf)
                    .await?;
                if buf.is_empty() {
                    break;
                }
                sent += buf.len() as u64;
                let output = self
                    .client
                    .upload_part()
                    .bucket(&self.settings.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(buf))
                    .send()
                    .await
                    .map_err(map_s3_operation_error)?;
                parts.push(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                );
                self.progress.report(label, sent, total);
                part_number += 1;
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            Ok::<_, StorageError>(())
        }
        .await;

        if result.is_err() {
            let abort = self
                .client
                .abort_multipart_upload()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(e) = abort {
                warn!(key = %key, error = %e, "failed to abort multipart upload");
            }
        }
        result
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
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
            ("bucket".to_string(), self.settings.bucket.clone()),
            ("region".to_string(), self.settings.region.clone()),
        ]);
        let optional = [
            ("access_key", &self.settings.access_key),
            ("secret_key", &self.settings.secret_key),
            ("session_token", &self.settings.session_token),
            ("prefix", &self.settings.prefix),
            ("endpoint", &self.settings.endpoint),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                meta.insert(key.to_string(), value.clone());
            }
        }
        if self.settings.access_key.is_none() {
            meta.insert(
                "use_environment_authentication".to_string(),
                "true".to_string(),
            );
        }
        meta
    }

    fn set_progress_channel(&self, sender: ProgressSender) {
        self.progress.set(sender);
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        Ok(self.head(&self.full_key(dir, name)).await?.is_some())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        let prefix = self.folder_prefix(dir, name);
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.settings.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(!output.contents().is_empty())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String> {
        let key = self.full_key(dir, name);
        let output = self
            .head(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        if let Some(sha) = output
            .metadata()
            .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
        {
            return Ok(sha.clone());
        }
        output
            .e_tag()
            .map(|tag| tag.trim_matches('"').to_string())
            .ok_or_else(|| StorageError::NotFound(format!("{key} has no checksum")))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64> {
        let key = self.full_key(dir, name);
        let output = self
            .head(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        Ok(output.content_length().unwrap_or(0).max(0) as u64)
    }

    #[instrument(skip(self, local_dir), fields(backend = "s3"))]
    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()> {
        let source = local_dir.join(name);
        let key = self.full_key(dir, name);
        let total = fs::metadata(&source).await?.len();
        let checksum = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || ContentHash::of_file(&source))
                .await
                .map_err(join_error)??
                .to_hex()
        };

        if total as usize <= MULTIPART_PART_SIZE {
            let body = ByteStream::from_path(&source)
                .await
                .map_err(|e| StorageError::S3(Box::new(e)))?;
            self.client
                .put_object()
                .bucket(&self.settings.bucket)
                .key(&key)
                .metadata(CHECKSUM_METADATA_KEY, &checksum)
                .body(body)
                .send()
                .await
                .map_err(map_s3_operation_error)?;
            self.progress.report(name, total, total);
        } else {
            let file = fs::File::open(&source).await?;
            self.upload_multipart(&key, file, &checksum, total, name)
                .await?;
        }
        debug!(key = %key, size = total, "pushed object");
        Ok(())
    }

    #[instrument(skip(self, destination), fields(backend = "s3"))]
    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()> {
        let key = self.full_key(dir, name);
        let total = self.file_size(dir, name).await?;
        let body = self.get_object(&key).await?;
        let mut reader = Box::pin(body.into_async_read());

        fs::create_dir_all(destination).await?;
        let dest = destination.join(name);
        let temp = destination.join(format!("{name}.tmp.{}", Uuid::new_v4()));
        let result = async {
            let mut out = fs::File::create(&temp).await?;
            let mut buf = vec![0u8; DOWNLOAD_BUFFER_SIZE];
            let mut done = 0u64;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                done += n as u64;
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

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes> {
        let key = self.full_key(dir, name);
        let body = self.get_object(&key).await?;
        let data = body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(data.into_bytes())
    }

    #[instrument(skip(self, destination), fields(backend = "s3"))]
    async fn pull_file_and_decompress(
        &self,
        dir: &str,
        name: &str,
        destination: &Path,
    ) -> StorageResult<()> {
        let key = self.full_key(dir, name);
        let body = self.get_object(&key).await?;
        let bridge = SyncIoBridge::new(Box::pin(body.into_async_read()));
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

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()> {
        let key = self.full_key(dir, name);
        let result = self
            .client
            .delete_object()
            .bucket(&self.settings.bucket)
            .key(&key)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => match Self::map_sdk_error(err, &key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        if self.folder_exists(dir, name).await? {
            return Ok(());
        }
        let marker = self.folder_prefix(dir, name);
        self.client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(&marker)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        let prefix = self.folder_prefix(dir, name);
        if prefix.is_empty() {
            return Err(StorageError::InvalidPath(
                "refusing to delete the bucket root".to_string(),
            ));
        }

        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.settings.bucket)
                .prefix(&prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request.send().await.map_err(map_s3_operation_error)?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(&self.settings.bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(map_s3_operation_error)?;
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(())
    }
}

/// Claims `provider=aws-s3` connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct S3Probe;

#[async_trait]
impl BackendProbe for S3Probe {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn check(&self, connection: &Provider) -> StorageResult<CheckOutcome> {
        if !connection.kind.eq_ignore_ascii_case(PROVIDER_NAME) {
            return Ok(CheckOutcome::NotMatched);
        }
        let settings = S3Settings::from_provider(connection)?;
        Ok(CheckOutcome::Matched(Arc::new(S3Backend::new(settings)?)))
    }
}
