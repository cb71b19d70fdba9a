//! Implementations of progress callbacks that render progress bars
use s3tgz::{CreateArchiveSummary, Result};
use std::{borrow::Cow, future::Future, time::Duration};
use tracing::warn;

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .expect("BUG: spinner template is valid")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the specified archive creation job, with progress bars for extra pretty-ness.
///
/// Ctrl-C aborts the job, which cleans up the partial archive.
pub(crate) async fn run_create_job(
    globals: &super::Globals,
    job: s3tgz::CreateArchiveJob,
) -> Result<CreateArchiveSummary> {
    let progress = CreateProgressReport::new(hide_progress(globals), job.total_objects());

    let abort = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Without a signal handler the job just can't be interrupted
            warn!(err = %e, "Unable to listen for Ctrl-C");
            futures::future::pending::<()>().await;
        }
    };

    job.run(abort, progress).await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Progress reporting for the create operation, which receives progress updates from the lib crate
/// and renders progress bars accordingly
#[derive(Clone)]
struct CreateProgressReport {
    /// Aggregate which groups all of the below progress bars together
    multi: indicatif::MultiProgress,

    /// Objects completely written to the archive, out of the number of objects listed
    objects_written: indicatif::ProgressBar,

    /// Object bytes downloaded.  The total isn't known up front, since object sizes are only
    /// looked up right before each object is read.
    bytes_downloaded: indicatif::ProgressBar,

    /// Compressed archive bytes written to the destination
    archive_bytes_written: indicatif::ProgressBar,

    /// Compressed archive bytes uploaded to object storage.  Only updated if the destination is
    /// object storage; it lags behind `archive_bytes_written` by the parts still in flight.
    archive_bytes_uploaded: indicatif::ProgressBar,
}

impl CreateProgressReport {
    fn new(hide_progress: bool, total_objects: usize) -> Self {
        fn counter_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<45!} [{bar:20.cyan/blue}] {pos}/{len}",
            )
            .expect("BUG: counter template is valid")
            .progress_chars("#>-")
        }

        fn bytes_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<45!} {bytes} ({bytes_per_sec})",
            )
            .expect("BUG: bytes template is valid")
        }

        /// The template syntax for right alignment doesn't pad the prefix string to the left with
        /// spaces, so we have to do that ourselves
        fn pad_prefix(prefix: &'static str) -> String {
            format!("{prefix:>20}")
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let objects_written = multi.add(indicatif::ProgressBar::new(total_objects as u64));
        objects_written.set_style(counter_style());
        objects_written.set_prefix(pad_prefix("Objects archived"));

        let bytes_downloaded = multi.add(indicatif::ProgressBar::new_spinner());
        bytes_downloaded.set_style(bytes_style());
        bytes_downloaded.set_prefix(pad_prefix("Downloaded"));

        let archive_bytes_written = multi.add(indicatif::ProgressBar::new_spinner());
        archive_bytes_written.set_style(bytes_style());
        archive_bytes_written.set_prefix(pad_prefix("Archive written"));

        let archive_bytes_uploaded = multi.add(indicatif::ProgressBar::new_spinner());
        archive_bytes_uploaded.set_style(bytes_style());
        archive_bytes_uploaded.set_prefix(pad_prefix("Uploaded to S3"));

        Self {
            multi,
            objects_written,
            bytes_downloaded,
            archive_bytes_written,
            archive_bytes_uploaded,
        }
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl s3tgz::CreateProgressCallback for CreateProgressReport {
    fn archive_initialized(&self, total_objects: usize) {
        self.objects_written.set_length(total_objects as u64);
        self.objects_written.set_message("Starting...");
    }

    fn input_object_download_started(&self, bucket: &str, key: &str, size: u64) {
        self.objects_written.set_message(key.to_string());
    }

    fn input_part_downloaded(&self, bucket: &str, key: &str, part_number: usize, part_size: usize) {
        self.bytes_downloaded.inc(part_size as u64);
        self.bytes_downloaded
            .set_message(format!("{} (part {})", key, part_number));
    }

    fn input_object_written(&self, bucket: &str, key: &str, size: u64) {
        self.objects_written.inc(1);
    }

    fn archive_bytes_written(&self, bytes_written: usize) {
        self.archive_bytes_written.inc(bytes_written as u64);
        self.archive_bytes_written.set_message("Writing");
    }

    fn archive_writes_completed(&self, total_bytes_written: u64) {
        self.objects_written
            .finish_with_message("All objects archived");
        self.bytes_downloaded.finish_with_message("Done");
        self.archive_bytes_written
            .finish_with_message("Archive writes completed");
    }

    fn archive_part_uploaded(&self, part_number: usize, bytes_uploaded: usize) {
        self.archive_bytes_uploaded.inc(bytes_uploaded as u64);
        self.archive_bytes_uploaded
            .set_message(format!("Part {part_number} uploaded"));
    }

    fn archive_upload_completed(&self, size: u64, duration: Duration) {
        let bytes_per_second = (size as f64 / duration.as_secs_f64()) as u64;
        let bytes_per_second = indicatif::BinaryBytes(bytes_per_second);
        let duration = indicatif::HumanDuration(duration);
        let message = format!("Archive upload completed ({duration}, {bytes_per_second}/s)");

        // Printing only fails if the terminal went away, in which case there's nobody to tell
        let _ = self.multi.println(message);
        self.archive_bytes_uploaded
            .finish_with_message("Archive upload completed");
    }
}
