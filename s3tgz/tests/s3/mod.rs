//! Tests which are intended to run against real live S3 APIs.
//!
//! These are `ignore`d since they need an account and a bucket.  The settings are read from the
//! environment, or from a `.env` file in the working directory:
//!
//! - `S3TGZ_TEST_SOURCE_URL`: the bucket (and optionally prefix) to archive, ie
//!   `s3://my-bucket/some/prefix/`
//! - `S3TGZ_TEST_TARGET_URL`: where to upload the archive, ie `s3://my-bucket/archives/test.tar.gz`
//! - `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`: the usual AWS credentials
//! - `S3TGZ_TEST_ENDPOINT`: optional, for an S3-compatible service other than AWS
use crate::{progress::TestCreateProgressCallback, Result};
use s3tgz::{Config, CreateArchiveJobBuilder, TargetArchive};
use s3tgz_testing::{archive, logging::test_with_logging};
use url::Url;

fn env_url(name: &str) -> Result<Url> {
    Ok(std::env::var(name)?.parse()?)
}

fn config_from_env() -> Result<Config> {
    Ok(Config {
        s3_endpoint: std::env::var("S3TGZ_TEST_ENDPOINT")
            .ok()
            .map(|endpoint| endpoint.parse())
            .transpose()?,
        aws_region: std::env::var("AWS_REGION").ok(),
        aws_access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
        aws_secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        ..Default::default()
    })
}

#[test]
#[ignore = "needs a live S3 bucket"]
fn archive_prefix_to_local_file() -> Result<()> {
    dotenv::dotenv().ok();

    test_with_logging(async move {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("dl").join("archive.tar.gz");

        let mut builder =
            CreateArchiveJobBuilder::new(config_from_env()?, TargetArchive::File(path.clone()));
        builder
            .source_url(&env_url("S3TGZ_TEST_SOURCE_URL")?)
            .await?;

        let job = builder.build().await?;
        let keys = job.keys().to_vec();

        let progress = TestCreateProgressCallback::new();
        let summary = job
            .run(futures::future::pending(), progress.clone())
            .await?;
        progress.sanity_check_updates(&summary);

        let entries = archive::read_tar_gz_file(&path).await?;
        assert_eq!(
            keys,
            entries
                .into_iter()
                .map(|entry| entry.path)
                .collect::<Vec<_>>()
        );

        Ok(())
    })
}

#[test]
#[ignore = "needs a live S3 bucket"]
fn archive_prefix_to_bucket() -> Result<()> {
    dotenv::dotenv().ok();

    test_with_logging(async move {
        let target_url = env_url("S3TGZ_TEST_TARGET_URL")?;

        let mut builder = CreateArchiveJobBuilder::new(
            config_from_env()?,
            TargetArchive::ObjectStorage(target_url),
        );
        builder
            .source_url(&env_url("S3TGZ_TEST_SOURCE_URL")?)
            .await?;

        let job = builder.build().await?;

        let progress = TestCreateProgressCallback::new();
        let summary = job
            .run(futures::future::pending(), progress.clone())
            .await?;
        progress.sanity_check_updates(&summary);

        assert!(summary.uploaded_parts.unwrap_or_default() >= 1);

        Ok(())
    })
}
