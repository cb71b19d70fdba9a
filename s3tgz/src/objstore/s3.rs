use super::{Bucket, ObjectDescriptor, ObjectStorage, PartAck};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::ByteStream;
use aws_types::region::Region;
use snafu::{prelude::*, IntoError};
use std::{ops::Range, sync::Arc};
use tracing::{debug, instrument, warn};
use url::Url;

/// [`ObjectStorage`] backed by the AWS SDK, for S3 itself and services with an S3-compatible API
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}

struct S3Inner {
    config: Config,

    /// Client for the configured (or environment) region; buckets elsewhere get their own
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        let client = make_s3_client(&config, None).await;

        Self {
            inner: Arc::new(S3Inner { config, client }),
        }
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3")
            .field("s3_endpoint", &self.inner.config.s3_endpoint)
            .finish()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>> {
        // `s3://bucket/key`: the bucket name is the host part of the URL
        let name = match url.host_str() {
            Some(name) if !name.is_empty() => name,
            _ => return crate::error::MissingBucketSnafu { url: url.clone() }.fail(),
        };

        Ok(Box::new(S3Bucket::open(self, name).await?))
    }
}

/// Outcome of a `HeadBucket` request that didn't fail outright
#[derive(Debug, PartialEq, Eq)]
enum BucketAccess {
    /// The bucket is reachable with the client that made the request
    Granted,

    /// The bucket exists, but requests for it have to go to this region
    WrongRegion(String),
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,

    /// Set if the bucket lives outside of the client's default region, in which case `client` is
    /// a separate client for that region
    region: Option<String>,

    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Check that the bucket exists and that we're allowed to use it, and work out which region's
    /// endpoint serves it.
    async fn open(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Checking access to bucket");

        let (client, region) = match head_bucket(&objstore.inner.client, name).await? {
            BucketAccess::Granted => (objstore.inner.client.clone(), None),
            BucketAccess::WrongRegion(region) => {
                debug!(bucket = name, %region, "Bucket is in another region; switching clients");

                let client = make_s3_client(&objstore.inner.config, region.clone()).await;

                if let BucketAccess::WrongRegion(other) = head_bucket(&client, name).await? {
                    // Every request against the bucket will fail, with a more specific error than
                    // we could produce here
                    warn!(bucket = name, %region, redirected_to = %other,
                        "Bucket redirected to another region a second time");
                }

                (client, Some(region))
            }
        };

        debug!(bucket = name, ?region, "Bucket is accessible");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                region,
                client,
            }),
        })
    }
}

/// `HeadBucket` succeeds only if the bucket exists, our credentials grant access to it, and the
/// client is talking to the bucket's own region.  In the last case S3 answers with a 301 and names
/// the right region in a header.
async fn head_bucket(client: &aws_sdk_s3::Client, name: &str) -> Result<BucketAccess> {
    let e = match client.head_bucket().bucket(name).send().await {
        Ok(_) => return Ok(BucketAccess::Granted),
        Err(e) => e,
    };

    let redirect_region = e
        .raw_response()
        .filter(|response| response.status().as_u16() == 301)
        .and_then(|response| response.headers().get("x-amz-bucket-region"))
        .map(|region| region.to_string());

    if let Some(region) = redirect_region {
        return Ok(BucketAccess::WrongRegion(region));
    }

    let not_found = e
        .as_service_error()
        .map(|service_error| service_error.is_not_found())
        .unwrap_or(false);

    if not_found {
        crate::error::BucketNotFoundSnafu { bucket: name }.fail()
    } else {
        Err(crate::error::BucketInvalidOrNotAccessibleSnafu { bucket: name }.into_error(e))
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        // The paginator follows continuation tokens until the listing is exhausted
        let mut pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .set_prefix(prefix.map(|prefix| prefix.to_string()))
            .into_paginator()
            .send();

        let mut keys = Vec::new();

        while let Some(result) = pages.next().await {
            let page = result.with_context(|_| crate::error::ListObjectsSnafu {
                bucket: self.inner.name.clone(),
                prefix: prefix.unwrap_or_default().to_string(),
            })?;

            // An empty bucket produces a page with no contents at all
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(|key| key.to_string())),
            );
        }

        debug!(count = keys.len(), "Listed objects");

        Ok(keys)
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn head_object(&self, key: &str) -> Result<ObjectDescriptor> {
        let metadata = match self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|service_error| service_error.is_not_found())
                    .unwrap_or(false);

                return if not_found {
                    crate::error::ObjectNotFoundSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.to_string(),
                    }
                    .fail()
                } else {
                    Err(crate::error::HeadObjectSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.to_string(),
                    }
                    .into_error(e))
                };
            }
        };

        let size = metadata
            .content_length()
            .filter(|size| *size >= 0)
            .with_context(|| crate::error::ObjectSizeMissingSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(ObjectDescriptor {
            key: key.to_string(),
            size: size as u64,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object_part(&self, key: &str, byte_range: Range<u64>) -> Result<bytes::Bytes> {
        debug!(?byte_range, "Reading object range");

        let response = match self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .range(format!("bytes={}-{}", byte_range.start, byte_range.end - 1))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let vanished = e
                    .as_service_error()
                    .map(|service_error| service_error.is_no_such_key())
                    .unwrap_or(false);

                return if vanished {
                    crate::error::ObjectVanishedSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.to_string(),
                    }
                    .fail()
                } else {
                    Err(crate::error::GetObjectSnafu {
                        bucket: self.inner.name.clone(),
                        key: key.to_string(),
                    }
                    .into_error(e))
                };
            }
        };

        let bytes =
            response
                .body
                .collect()
                .await
                .with_context(|_| crate::error::ReadByteStreamSnafu {
                    bucket: self.inner.name.clone(),
                    key: key.to_string(),
                })?;

        Ok(bytes.into_bytes())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn create_upload(&self, key: &str) -> Result<String> {
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        debug!(%upload_id, "Started multi-part upload");

        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, part_size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: usize,
        data: bytes::Bytes,
    ) -> Result<PartAck> {
        let size = data.len();

        let response = self
            .inner
            .client
            .upload_part()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::UploadPartSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
                part_number,
            })?;

        let e_tag = response
            .e_tag()
            .with_context(|| crate::error::PartETagMissingSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
                part_number,
            })?
            .to_string();

        debug!(%e_tag, "Part accepted");

        Ok(PartAck {
            part_number,
            e_tag,
            size,
        })
    }

    #[instrument(skip(self, parts), fields(bucket = %self.inner.name, parts = parts.len()))]
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<PartAck>) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|part| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(part.e_tag)
                    .part_number(part.part_number as i32)
                    .build()
            })
            .collect::<Vec<_>>();

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner
            .client
            .abort_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .with_context(|_| crate::error::AbortMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(())
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into().or_else(|| config.aws_region.clone());

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(aws_credential_types::Credentials::from_keys(
            access_key_id,
            secret_access_key,
            None,
        ));
    }

    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't support virtual-hosted bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str().trim_end_matches('/'))
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
