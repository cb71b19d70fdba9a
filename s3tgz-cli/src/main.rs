use clap::{ArgGroup, Parser, Subcommand};
use s3tgz::{CreateArchiveJobBuilder, KeyFilter, TargetArchive};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

mod progress;

/// Where the archive goes if no output is specified
const DEFAULT_ARCHIVE_PATH: &str = "dl/archive.tar.gz";

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ")"
);

/// Pack objects stored in S3 into a single gzip-compressed tar archive
#[derive(Parser, Debug)]
#[clap(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: s3tgz::Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new tar.gz archive from S3 objects
    #[clap(group(ArgGroup::new("output").required(false)))]
    Create {
        /// Write the archive to a file.  Missing parent directories are created.
        ///
        /// If no output is given at all, the archive is written to `dl/archive.tar.gz`.
        #[clap(short = 'f', long, value_parser, group = "output")]
        file: Option<PathBuf>,

        /// Upload the archive to an S3 object.
        ///
        /// The URL should specify the S3 bucket as well as the object name.
        #[clap(short = 's', long, value_parser, group = "output", value_name = "URL")]
        s3: Option<Url>,

        /// Write the archive to stdout
        #[clap(short = 't', long, group = "output")]
        stdout: bool,

        /// Only archive objects whose keys end with this suffix, ie ".png"
        #[clap(long, conflicts_with = "glob")]
        suffix: Option<String>,

        /// Only archive objects whose keys match this glob, ie "photos/**/*.png"
        #[clap(long)]
        glob: Option<String>,

        /// S3 URL pointing to a bucket, a prefix, a specific object, or a glob.
        ///
        /// EXAMPLES:
        ///
        /// s3://foo/         - Read all objects from the bucket `foo`
        ///
        /// s3://foo/bar/     - Read all objects from the bucket `foo` with the prefix `bar/`
        ///
        /// s3://foo/bar      - Read the object `bar` in the bucket `foo`
        ///
        /// s3://foo/*.txt    - Read all objects in bucket `foo` whose keys end with `.txt`
        ///
        /// NOTE: When specifying globs, make sure to enclose the entire URL in "", otherwise your
        /// shell might expand the globs locally and produce unintended results.
        #[clap(value_parser, value_name = "URL")]
        source: Url,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    // Not the whole of `args`, which includes the AWS secret key
    debug!(command = ?args.command, "Parsed command line");

    match args.command {
        Command::Create {
            file,
            s3,
            stdout,
            suffix,
            glob,
            source,
        } => {
            let target = if let Some(url) = s3 {
                TargetArchive::ObjectStorage(url)
            } else if stdout {
                TargetArchive::Writer(Box::new(tokio::io::stdout()))
            } else {
                TargetArchive::File(file.unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_PATH)))
            };

            let filter = match (suffix, glob) {
                (Some(suffix), _) => KeyFilter::Suffix(suffix),
                (None, Some(glob)) => KeyFilter::glob(&glob)?,
                (None, None) => KeyFilter::All,
            };

            let mut builder = CreateArchiveJobBuilder::new(args.config, target);
            builder.filter(filter);

            progress::with_spinner(&args.globals, "Checking source bucket...", async {
                builder.source_url(&source).await
            })
            .await?;

            let job = progress::with_spinner(
                &args.globals,
                "Listing objects...",
                builder.build(),
            )
            .await?;

            let summary = progress::run_create_job(&args.globals, job).await?;

            if !args.globals.quiet {
                eprintln!(
                    "Archived {} objects ({}) into a {} archive ({} compressed)",
                    indicatif::HumanCount(summary.total_objects as u64),
                    indicatif::BinaryBytes(summary.total_object_bytes),
                    indicatif::BinaryBytes(summary.archive_bytes),
                    indicatif::BinaryBytes(summary.compressed_bytes),
                );
            }
        }
    }

    Ok(())
}

/// Log to stderr, so that an archive written to stdout isn't corrupted.
///
/// `RUST_LOG` overrides the level implied by `--verbose` and `--quiet`.
fn init_logging(globals: &Globals) {
    let default_filter = if globals.verbose {
        "s3tgz=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
