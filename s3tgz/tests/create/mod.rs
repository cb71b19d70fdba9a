//! End to end tests of archive creation against in-memory buckets.
//!
//! These run anywhere, without any object storage account.  The [`FaultyBucket`] wrapper is used
//! both as the source of the objects and, for the tests that upload the archive, as the
//! destination, so the tests can inject failures and count what the job did to the bucket.
use crate::{faults::FaultyBucket, progress::TestCreateProgressCallback, Result};
use assert_matches::assert_matches;
use byte_unit::Byte;
use more_asserts::*;
use s3tgz::{
    Config, CreateArchiveJobBuilder, CreateArchiveSummary, ErrorKind, KeyFilter, MemoryBucket,
    S3TgzError, TargetArchive,
};
use s3tgz_testing::{archive, logging::test_with_logging, test_data};
use std::collections::HashMap;
use std::path::Path;

/// Config with windows and parts small enough that the tests exercise multi-window reads and
/// multi-part uploads without needing a lot of test data
fn small_config() -> Config {
    Config {
        range_window_size: Byte::from_bytes(64 * 1024),
        part_size: Byte::from_bytes(64 * 1024),
        upload_concurrency: 2,
        ..Default::default()
    }
}

/// Make a source bucket containing random test data for every `(key, size)` pair
fn source_bucket(
    objects: &[(&str, &str)],
) -> (
    FaultyBucket,
    HashMap<String, test_data::TestObjectWithData>,
) {
    let test_data = test_data::make_test_data(
        objects
            .iter()
            .map(|(key, size)| test_data::TestObject::new(*key, size)),
    );

    let bucket = MemoryBucket::new("source");
    for object in test_data.values() {
        bucket.put_object(object.key.clone(), object.data.clone());
    }

    (FaultyBucket::new(bucket), test_data)
}

fn job_builder(
    config: Config,
    source: &FaultyBucket,
    target: TargetArchive,
) -> CreateArchiveJobBuilder {
    let mut builder = CreateArchiveJobBuilder::new(config, target);
    builder.source_bucket(Box::new(source.clone()));

    builder
}

/// Build and run the job, checking the progress updates against the summary if it succeeds
async fn run_job(
    builder: CreateArchiveJobBuilder,
) -> s3tgz::Result<(CreateArchiveSummary, TestCreateProgressCallback)> {
    let job = builder.build().await?;
    let progress = TestCreateProgressCallback::new();

    let summary = job
        .run(futures::future::pending(), progress.clone())
        .await?;

    progress.sanity_check_updates(&summary);

    Ok((summary, progress))
}

fn file_target(dir: &Path) -> (std::path::PathBuf, TargetArchive) {
    let path = dir.join("archive.tar.gz");

    (path.clone(), TargetArchive::File(path))
}

#[test]
fn archives_every_object_in_listing_order() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("b.txt", "100 KiB"),
            ("a.png", "1 KiB"),
            ("dir/c.png", "0"),
            ("dir/d.bin", "200 KiB"),
        ]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let (summary, progress) = run_job(job_builder(small_config(), &source, target)).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        let expected = ["a.png", "b.txt", "dir/c.png", "dir/d.bin"];
        test_data::validate_test_data_in_archive(&test_data, &entries, expected);

        assert!(entries.iter().all(|entry| entry.mode == 0o644
            && entry.entry_type == tar::EntryType::Regular));

        assert_eq!(4, summary.total_objects);
        assert_eq!(301 * 1024, summary.total_object_bytes);
        assert_eq!(
            std::fs::metadata(&path)?.len(),
            summary.compressed_bytes
        );
        assert_eq!(None, summary.uploaded_parts);
        assert_eq!(expected.to_vec(), progress.written_keys());

        Ok(())
    })
}

#[test]
fn unusual_keys_become_entry_names_unchanged() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("photos/", "0"),
            ("photos/cat.png", "1 KiB"),
            ("a//b.txt", "1 KiB"),
            ("a/b.txt", "2 KiB"),
            ("./c.txt", "1 KiB"),
            ("c.txt", "3 KiB"),
        ]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        run_job(job_builder(small_config(), &source, target)).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(
            &test_data,
            &entries,
            [
                "./c.txt",
                "a//b.txt",
                "a/b.txt",
                "c.txt",
                "photos/",
                "photos/cat.png",
            ],
        );

        Ok(())
    })
}

#[test]
fn suffix_filter_selects_matching_keys() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("a.png", "1 KiB"),
            ("b.txt", "1 KiB"),
            ("photos/c.png", "2 KiB"),
            ("photos/c.png.bak", "2 KiB"),
        ]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let mut builder = job_builder(small_config(), &source, target);
        builder.filter(KeyFilter::Suffix(".png".to_string()));

        let (summary, _) = run_job(builder).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(&test_data, &entries, ["a.png", "photos/c.png"]);
        assert_eq!(2, summary.total_objects);

        // Objects that don't pass the filter are never read
        assert!(source
            .range_reads()
            .iter()
            .all(|(key, _)| key.ends_with(".png")));

        Ok(())
    })
}

#[test]
fn glob_filter_selects_matching_keys() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("logs/2022/a.log", "1 KiB"),
            ("logs/2023/b.log", "1 KiB"),
            ("logs/2023/c.txt", "1 KiB"),
            ("other/d.log", "1 KiB"),
        ]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let mut builder = job_builder(small_config(), &source, target);
        builder.filter(KeyFilter::glob("logs/*/*.log")?);

        run_job(builder).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(
            &test_data,
            &entries,
            ["logs/2022/a.log", "logs/2023/b.log"],
        );

        Ok(())
    })
}

#[test]
fn empty_object_is_archived_without_reading_it() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[("empty.bin", "0"), ("full.bin", "10")]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        run_job(job_builder(small_config(), &source, target)).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(&test_data, &entries, ["empty.bin", "full.bin"]);
        assert!(entries[0].data.is_empty());

        assert_eq!(
            vec![("full.bin".to_string(), 0..10)],
            source.range_reads()
        );

        Ok(())
    })
}

#[test]
fn large_objects_are_read_in_consecutive_windows() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[("big.bin", "25")]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let config = Config {
            range_window_size: Byte::from_bytes(10),
            ..small_config()
        };

        let (_, progress) = run_job(job_builder(config, &source, target)).await?;

        assert_eq!(
            vec![
                ("big.bin".to_string(), 0..10),
                ("big.bin".to_string(), 10..20),
                ("big.bin".to_string(), 20..25),
            ],
            source.range_reads()
        );
        assert_eq!(vec![0, 1, 2], progress.input_part_numbers("big.bin"));

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(&test_data, &entries, ["big.bin"]);

        Ok(())
    })
}

#[test]
fn archive_contents_do_not_depend_on_window_size() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("a", "0"),
            ("b", "1"),
            ("c", "17"),
            ("d", "100"),
            ("e", "5000"),
        ]);
        let temp_dir = tempfile::tempdir()?;

        for window in [1u128, 3, 16, 4096, 10 * 1024 * 1024] {
            let path = temp_dir.path().join(format!("archive-{window}.tar.gz"));
            let config = Config {
                range_window_size: Byte::from_bytes(window),
                ..small_config()
            };

            run_job(job_builder(
                config,
                &source,
                TargetArchive::File(path.clone()),
            ))
            .await?;

            let entries = archive::read_tar_gz_file(&path).await?;
            test_data::validate_test_data_in_archive(
                &test_data,
                &entries,
                ["a", "b", "c", "d", "e"],
            );
        }

        Ok(())
    })
}

#[test]
fn empty_listing_produces_valid_empty_archive() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 KiB")]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let mut builder = job_builder(small_config(), &source, target);
        builder.filter(KeyFilter::Prefix("nothing/".to_string()));

        let job = builder.build().await?;
        assert_eq!(0, job.total_objects());

        let summary = job.run_without_progress(futures::future::pending()).await?;

        assert_eq!(0, summary.total_objects);
        assert!(archive::read_tar_gz_file(&path).await?.is_empty());

        Ok(())
    })
}

#[test]
fn archive_can_be_written_to_any_writer() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[("a.txt", "10 KiB"), ("b.txt", "300 KiB")]);
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("archive.tar.gz");

        let writer = tokio::fs::File::create(&path).await?;
        let target = TargetArchive::Writer(Box::new(writer));

        let (summary, _) = run_job(job_builder(small_config(), &source, target)).await?;

        let entries = archive::read_tar_gz_file(&path).await?;
        test_data::validate_test_data_in_archive(&test_data, &entries, ["a.txt", "b.txt"]);
        assert_eq!(std::fs::metadata(&path)?.len(), summary.compressed_bytes);

        Ok(())
    })
}

#[test]
fn archive_is_uploaded_in_parts() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[("a.bin", "150 KiB")]);
        let target_bucket = FaultyBucket::new(MemoryBucket::new("target"));

        let target = TargetArchive::Bucket {
            bucket: Box::new(target_bucket.clone()),
            key: "archives/out.tar.gz".to_string(),
        };

        let (summary, progress) = run_job(job_builder(small_config(), &source, target)).await?;

        // 150 KiB of random data doesn't compress, so with the headers that's a bit more than two
        // 64 KiB parts
        assert_eq!(Some(3), summary.uploaded_parts);
        assert_eq!(3, progress.archive_part_uploaded().0);
        assert_eq!(1, target_bucket.completions());
        assert_eq!(0, target_bucket.aborts());

        let uploaded = fetch_object(&target_bucket, "archives/out.tar.gz").await?;
        assert_eq!(summary.compressed_bytes, uploaded.len() as u64);

        let entries = archive::read_tar_gz_bytes(&uploaded)?;
        test_data::validate_test_data_in_archive(&test_data, &entries, ["a.bin"]);

        Ok(())
    })
}

#[test]
fn buffered_data_stays_bounded() -> Result<()> {
    test_with_logging(async move {
        let (source, test_data) = source_bucket(&[
            ("a.bin", "1 MiB"),
            ("b.bin", "1 MiB"),
            ("c.bin", "1 MiB"),
            ("d.bin", "1 MiB"),
        ]);
        let target_bucket = FaultyBucket::new(MemoryBucket::new("target"));
        let target = TargetArchive::Bucket {
            bucket: Box::new(target_bucket.clone()),
            key: "out.tar.gz".to_string(),
        };

        let config = Config {
            range_window_size: Byte::from_bytes(64 * 1024),
            part_size: Byte::from_bytes(256 * 1024),
            upload_concurrency: 2,
            entry_channel_depth: 1,
            ..Default::default()
        };

        // Windows queued for the packer, one being written and one waiting to be queued, plus the
        // parts queued for upload, being uploaded, and one waiting to be queued
        let window = config.range_window_size.get_bytes() as u64;
        let part = config.part_size.get_bytes() as u64;
        let bound = (config.entry_channel_depth as u64 + 2) * window
            + (2 * config.upload_concurrency as u64 + 1) * part;

        let (summary, _) = run_job(job_builder(config, &source, target)).await?;

        assert_gt!(summary.peak_buffered_bytes, 0);
        assert_le!(summary.peak_buffered_bytes, bound);
        assert_lt!(bound, summary.total_object_bytes);

        let uploaded = fetch_object(&target_bucket, "out.tar.gz").await?;
        let entries = archive::read_tar_gz_bytes(&uploaded)?;
        test_data::validate_test_data_in_archive(
            &test_data,
            &entries,
            ["a.bin", "b.bin", "c.bin", "d.bin"],
        );

        Ok(())
    })
}

#[test]
fn short_read_fails_the_job_and_aborts_the_upload() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 KiB"), ("b.txt", "100 KiB")]);
        source.short_read("b.txt");

        let target_bucket = FaultyBucket::new(MemoryBucket::new("target"));
        let target = TargetArchive::Bucket {
            bucket: Box::new(target_bucket.clone()),
            key: "out.tar.gz".to_string(),
        };

        let result = run_job(job_builder(small_config(), &source, target)).await;

        let err = result.unwrap_err();
        assert_eq!(ErrorKind::Transfer, err.kind());
        assert_matches!(
            err,
            S3TgzError::ShortRangeRead { key, range_start: 0, .. } if key == "b.txt"
        );

        // The upload was abandoned exactly once and never completed
        assert_eq!(1, target_bucket.aborts());
        assert_eq!(0, target_bucket.completions());
        assert_matches!(
            fetch_object(&target_bucket, "out.tar.gz").await,
            Err(S3TgzError::ObjectNotFound { .. })
        );

        Ok(())
    })
}

#[test]
fn failed_part_upload_fails_the_job() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.bin", "500 KiB")]);

        let target_bucket = FaultyBucket::new(MemoryBucket::new("target"));
        target_bucket.fail_part(2);

        let target = TargetArchive::Bucket {
            bucket: Box::new(target_bucket.clone()),
            key: "out.tar.gz".to_string(),
        };

        let err = run_job(job_builder(small_config(), &source, target))
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::Sink, err.kind());
        assert_matches!(err, S3TgzError::PartUploadFailed { part_number: 2, .. });

        assert_eq!(1, target_bucket.aborts());
        assert_eq!(0, target_bucket.completions());

        Ok(())
    })
}

#[test]
fn failed_file_archive_is_removed() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 KiB"), ("b.txt", "100 KiB")]);
        source.short_read("b.txt");

        let temp_dir = tempfile::tempdir()?;
        let dir = temp_dir.path().join("nested").join("dl");
        let path = dir.join("archive.tar.gz");

        let err = run_job(job_builder(
            small_config(),
            &source,
            TargetArchive::File(path.clone()),
        ))
        .await
        .unwrap_err();

        assert_matches!(err, S3TgzError::ShortRangeRead { .. });

        // The missing directory was created, but the partial archive in it was cleaned up
        assert!(dir.is_dir());
        assert!(!path.exists());

        Ok(())
    })
}

#[test]
fn object_deleted_after_listing_fails_probe() -> Result<()> {
    test_with_logging(async move {
        let inner = MemoryBucket::new("source");
        inner.put_object("a.txt", &b"hello"[..]);
        inner.put_object("b.txt", &b"world"[..]);
        let source = FaultyBucket::new(inner.clone());

        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let job = job_builder(small_config(), &source, target).build().await?;
        assert_eq!(&["a.txt".to_string(), "b.txt".to_string()], job.keys());

        assert!(inner.delete_object("b.txt"));

        let err = job
            .run_without_progress(futures::future::pending())
            .await
            .unwrap_err();

        assert_eq!(ErrorKind::Probe, err.kind());
        assert_matches!(err, S3TgzError::ObjectNotFound { key, .. } if key == "b.txt");
        assert!(!path.exists());

        Ok(())
    })
}

#[test]
fn abort_signal_stops_the_job() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 MiB")]);
        let temp_dir = tempfile::tempdir()?;
        let (path, target) = file_target(temp_dir.path());

        let job = job_builder(small_config(), &source, target).build().await?;

        let err = job
            .run_without_progress(futures::future::ready(()))
            .await
            .unwrap_err();

        assert_matches!(err, S3TgzError::Aborted);
        assert!(!path.exists());

        Ok(())
    })
}

#[test]
fn abort_signal_stops_the_job_while_finishing_the_upload() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 KiB")]);
        let target_bucket = FaultyBucket::new(MemoryBucket::new("target"));
        target_bucket.stall_parts();

        let target = TargetArchive::Bucket {
            bucket: Box::new(target_bucket.clone()),
            key: "archives/out.tar.gz".to_string(),
        };

        let job = job_builder(small_config(), &source, target).build().await?;
        let progress = TestCreateProgressCallback::new();

        // The only part is uploaded once the archive is finished, and that upload never completes
        let err = job
            .run(
                tokio::time::sleep(std::time::Duration::from_millis(500)),
                progress.clone(),
            )
            .await
            .unwrap_err();

        assert_matches!(err, S3TgzError::Aborted);
        assert_gt!(progress.archive_writes_completed(), 0);
        assert_eq!(1, target_bucket.aborts());
        assert_eq!(0, target_bucket.completions());
        assert_eq!(0, target_bucket.inner().pending_upload_count());

        Ok(())
    })
}

#[test]
fn target_url_must_name_an_object() -> Result<()> {
    test_with_logging(async move {
        let (source, _) = source_bucket(&[("a.txt", "1 KiB")]);

        for url in ["s3://bucket", "s3://bucket/", "s3://bucket/dir/"] {
            let target = TargetArchive::ObjectStorage(url.parse()?);

            let err = run_job(job_builder(small_config(), &source, target))
                .await
                .unwrap_err();

            assert_eq!(ErrorKind::Config, err.kind());
            assert_matches!(err, S3TgzError::MissingObjectKey { .. }, "{url}");
        }

        let target = TargetArchive::ObjectStorage("gs://bucket/archive.tar.gz".parse()?);
        assert_matches!(
            run_job(job_builder(small_config(), &source, target)).await,
            Err(S3TgzError::UnsupportedObjectStorage { .. })
        );

        Ok(())
    })
}

#[test]
fn build_requires_source_and_valid_config() -> Result<()> {
    test_with_logging(async move {
        let temp_dir = tempfile::tempdir()?;

        let (_, target) = file_target(temp_dir.path());
        let builder = CreateArchiveJobBuilder::new(small_config(), target);
        assert_matches!(builder.build().await, Err(S3TgzError::NoSource));

        let (source, _) = source_bucket(&[("a.txt", "1 KiB")]);
        let (_, target) = file_target(temp_dir.path());
        let config = Config {
            upload_concurrency: 0,
            ..small_config()
        };
        assert_matches!(
            job_builder(config, &source, target).build().await,
            Err(S3TgzError::InvalidConfig { .. })
        );

        Ok(())
    })
}

/// Read back a whole object from a bucket
async fn fetch_object(bucket: &FaultyBucket, key: &str) -> s3tgz::Result<Vec<u8>> {
    use s3tgz::Bucket;

    let descriptor = bucket.head_object(key).await?;
    let data = bucket.read_object_part(key, 0..descriptor.size).await?;

    Ok(data.to_vec())
}
