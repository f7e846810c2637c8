use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::{HeadObjectError, HeadObjectOutput};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::store::{
    Media, MediaKind, ObjectDescriptor, ObjectStore, PartitionId, StoreSession, Upload,
};

const META_FILE_NAME: &str = "file-name";
const META_PARTITION: &str = "partition";
const FALLBACK_PARTITION: &str = "us-east-1";
/// Attempts at claiming a fresh sequence number before giving up.
const MAX_APPEND_ATTEMPTS: usize = 5;

/// S3-backed object channel. Objects are appended under
/// `<prefix><sequence:020>`; the bucket region is the partition.
pub struct S3Store {
    sdk_config: SdkConfig,
    client: Client,
    bucket: String,
    endpoint_url: Option<String>,
    force_path_style: bool,
    key_prefix: String,
    default_partition: PartitionId,
    last_sequence: AtomicU64,
}

impl S3Store {
    /// Load credentials (optionally from a named profile) and build the
    /// store handle for one Session Pool entry.
    pub async fn connect(config: &AppConfig, profile: Option<&str>) -> anyhow::Result<Self> {
        let region_provider = match &config.region {
            Some(r) => RegionProviderChain::first_try(Some(Region::new(r.clone())))
                .or_default_provider(),
            None => RegionProviderChain::default_provider(),
        };
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
        if let Some(name) = profile {
            loader = loader.profile_name(name);
        }
        let sdk_config = loader.load().await;

        let default_partition = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| FALLBACK_PARTITION.to_string());
        let client = build_client(
            &sdk_config,
            None,
            config.s3_endpoint_url.as_deref(),
            config.s3_force_path_style,
        );
        info!(profile = profile.unwrap_or("default"), partition = %default_partition,
              "s3 store handle ready");

        Ok(Self {
            sdk_config,
            client,
            bucket: config.container.clone(),
            endpoint_url: config.s3_endpoint_url.clone(),
            force_path_style: config.s3_force_path_style,
            key_prefix: config.key_prefix.clone(),
            default_partition,
            last_sequence: AtomicU64::new(0),
        })
    }

    fn key_for(&self, sequence: u64) -> String {
        object_key(&self.key_prefix, sequence)
    }

    /// Next sequence number: strictly increasing within this process and
    /// never behind the wall clock, so restarts keep appending.
    fn next_sequence(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let prev = self
            .last_sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some((prev + 1).max(now))
            })
            .unwrap_or(0);
        (prev + 1).max(now)
    }
}

fn build_client(
    sdk_config: &SdkConfig,
    region: Option<&str>,
    endpoint_url: Option<&str>,
    force_path_style: bool,
) -> Client {
    let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
    if let Some(r) = region {
        builder = builder.region(Region::new(r.to_string()));
    }
    if let Some(url) = endpoint_url {
        builder = builder.endpoint_url(url);
    }
    if force_path_style {
        builder = builder.force_path_style(true);
    }
    Client::from_conf(builder.build())
}

fn object_key(prefix: &str, sequence: u64) -> String {
    format!("{prefix}{sequence:020}")
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn establish_session(
        &self,
        partition: &PartitionId,
    ) -> GatewayResult<Arc<dyn StoreSession>> {
        let client = build_client(
            &self.sdk_config,
            Some(partition),
            self.endpoint_url.as_deref(),
            self.force_path_style,
        );
        // Handshake: prove the credentials are accepted in this partition.
        client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))?;
        info!(partition = %partition, "s3 partition session established");
        Ok(Arc::new(S3Session {
            client,
            key_prefix: self.key_prefix.clone(),
            partition: partition.clone(),
        }))
    }

    async fn stat(&self, object: &ObjectDescriptor) -> GatewayResult<Option<Media>> {
        let result = self
            .client
            .head_object()
            .bucket(&object.container)
            .key(self.key_for(object.sequence))
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(media_from_head(
                &output,
                &self.key_for(object.sequence),
                &self.default_partition,
            ))),
            Err(err) => map_head_err(err),
        }
    }

    async fn check_access(&self, container: &str) -> GatewayResult<()> {
        self.client
            .head_bucket()
            .bucket(container)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnavailable(e.into_service_error().to_string()))?;
        debug!(bucket = %container, "bucket reachable");
        Ok(())
    }

    async fn persist(&self, upload: Upload) -> GatewayResult<ObjectDescriptor> {
        for _ in 0..MAX_APPEND_ATTEMPTS {
            let sequence = self.next_sequence();
            let body = ByteStream::from_path(&upload.path)
                .await
                .map_err(|e| GatewayError::IngestionFailed(format!("open spool file: {e}")))?;
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(self.key_for(sequence))
                .if_none_match("*")
                .content_type(&upload.mime_type)
                .content_length(upload.size as i64)
                .metadata(META_FILE_NAME, urlencoding::encode(&upload.name).into_owned())
                .metadata(META_PARTITION, self.default_partition.clone())
                .body(body)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(ObjectDescriptor::new(self.bucket.clone(), sequence)),
                Err(SdkError::ServiceError(se)) if se.raw().status().as_u16() == 412 => {
                    debug!(sequence, "sequence already taken, retrying");
                }
                Err(e) => return Err(GatewayError::IngestionFailed(e.to_string())),
            }
        }
        Err(GatewayError::IngestionFailed(
            "could not claim a free sequence number".into(),
        ))
    }
}

struct S3Session {
    client: Client,
    key_prefix: String,
    partition: PartitionId,
}

#[async_trait]
impl StoreSession for S3Session {
    fn partition(&self) -> &PartitionId {
        &self.partition
    }

    async fn fetch_chunk(
        &self,
        object: &ObjectDescriptor,
        offset: u64,
        limit: u64,
    ) -> GatewayResult<Bytes> {
        if limit == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + limit - 1);
        let result = self
            .client
            .get_object()
            .bucket(&object.container)
            .key(object_key(&self.key_prefix, object.sequence))
            .range(range)
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(err) => return map_get_err(err),
        };
        output
            .body
            .collect()
            .await
            .map(|agg| agg.into_bytes())
            .map_err(|e| GatewayError::UpstreamUnavailable(e.to_string()))
    }
}

fn media_from_head(output: &HeadObjectOutput, key: &str, default_partition: &str) -> Media {
    let metadata: HashMap<String, String> = output.metadata().cloned().unwrap_or_default();
    let name = metadata
        .get(META_FILE_NAME)
        .and_then(|n| urlencoding::decode(n).ok().map(|n| n.into_owned()))
        .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(key).to_string());
    let mime_type = output.content_type().map(str::to_owned);
    Media {
        kind: MediaKind::from_mime(mime_type.as_deref().unwrap_or_default()),
        name,
        size: output.content_length().unwrap_or_default().max(0) as u64,
        mime_type,
        partition: metadata
            .get(META_PARTITION)
            .cloned()
            .unwrap_or_else(|| default_partition.to_string()),
        last_modified: output.last_modified().map(|t| {
            // DateTime::to_string() is ISO 8601; headers need RFC 7231.
            let epoch = UNIX_EPOCH + std::time::Duration::from_secs(t.secs().max(0) as u64);
            httpdate::fmt_http_date(epoch)
        }),
    }
}

fn map_head_err(err: SdkError<HeadObjectError>) -> GatewayResult<Option<Media>> {
    match &err {
        SdkError::ServiceError(se) if se.err().is_not_found() => Ok(None),
        _ => Err(GatewayError::UpstreamUnavailable(err.to_string())),
    }
}

fn map_get_err(err: SdkError<GetObjectError>) -> GatewayResult<Bytes> {
    match &err {
        // Offset at or past the end of the object: end of stream.
        SdkError::ServiceError(se) if se.raw().status().as_u16() == 416 => Ok(Bytes::new()),
        SdkError::ServiceError(se) if se.err().is_no_such_key() => {
            Err(GatewayError::NotFound("object not found".into()))
        }
        _ => Err(GatewayError::UpstreamUnavailable(err.to_string())),
    }
}
