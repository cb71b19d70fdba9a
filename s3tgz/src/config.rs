use crate::Result;
use url::Url;

/// The configuration settings that control the behavior of archive creation.
///
/// Credentials, region and endpoint are injected here rather than read from process-global state,
/// so that separate jobs in the same process can talk to different object stores.
#[derive(Clone, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, path-style
    /// addressing is used for buckets.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.  If not set, the region is determined from the environment.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub aws_region: Option<String>,

    /// The AWS access key ID.  If not set, credentials are determined from the environment.
    ///
    /// Must be specified together with `aws_secret_access_key`.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_secret_access_key")
    )]
    pub aws_access_key_id: Option<String>,

    /// The AWS secret access key.  If not set, credentials are determined from the environment.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, requires = "aws_access_key_id")
    )]
    pub aws_secret_access_key: Option<String>,

    /// The maximum number of bytes requested from object storage in a single range read.
    ///
    /// Objects bigger than this are read in several sequential range requests.  At most a few
    /// windows of this size are held in memory at any time.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "10MiB", global = true))]
    pub range_window_size: byte_unit::Byte,

    /// The size of each part when uploading the archive to object storage.
    ///
    /// S3 requires every part but the last to be at least 5MiB, and an upload can have at most
    /// 10,000 parts, so this also caps the size of the archive at 10,000 times this value.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub part_size: byte_unit::Byte,

    /// The maximum number of archive parts being uploaded at the same time.
    ///
    /// Each part in flight is held in memory, so memory use grows with this value times
    /// `part_size`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "4", global = true))]
    pub upload_concurrency: usize,

    /// How many range windows can be queued between the object reader and the archive writer.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1", global = true))]
    pub entry_channel_depth: usize,

    /// The gzip compression level, from 0 (no compression) to 9 (best compression).
    #[cfg_attr(feature = "clap", clap(long, default_value = "6", global = true))]
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            range_window_size: byte_unit::Byte::from_bytes(10 * 1024 * 1024),
            part_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            upload_concurrency: 4,
            entry_channel_depth: 1,
            compression_level: 6,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("s3_endpoint", &self.s3_endpoint)
            .field("aws_region", &self.aws_region)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &self.aws_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("range_window_size", &self.range_window_size)
            .field("part_size", &self.part_size)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("entry_channel_depth", &self.entry_channel_depth)
            .field("compression_level", &self.compression_level)
            .finish()
    }
}

impl Config {
    /// Check that the settings are usable, failing with [`crate::S3TgzError::InvalidConfig`]
    /// otherwise.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            crate::error::InvalidConfigSnafu {
                reason: reason.to_string(),
            }
            .fail()
        };

        if self.range_window_size.get_bytes() == 0 {
            return invalid("range_window_size must be greater than zero");
        }
        if self.part_size.get_bytes() == 0 {
            return invalid("part_size must be greater than zero");
        }
        if self.part_size.get_bytes() > usize::MAX as u128 {
            return invalid("part_size is too large for this platform");
        }
        if self.upload_concurrency == 0 {
            return invalid("upload_concurrency must be at least 1");
        }
        if self.entry_channel_depth == 0 {
            return invalid("entry_channel_depth must be at least 1");
        }
        if self.compression_level > 9 {
            return invalid("compression_level must be between 0 and 9");
        }
        if self.aws_access_key_id.is_some() != self.aws_secret_access_key.is_some() {
            return invalid("aws_access_key_id and aws_secret_access_key must be set together");
        }

        Ok(())
    }

    pub(crate) fn range_window_bytes(&self) -> u64 {
        self.range_window_size.get_bytes() as u64
    }

    pub(crate) fn part_size_bytes(&self) -> usize {
        self.part_size.get_bytes() as usize
    }
}
