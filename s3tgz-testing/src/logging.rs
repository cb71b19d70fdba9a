//! Log capture for tests.
//!
//! Each test gets its own `tracing` dispatcher and its own tokio runtime, and every runtime worker
//! thread is set up to log to that dispatcher.  Log events go to a buffer which is printed when the
//! test ends, so the output of tests running in parallel doesn't get interleaved.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The AWS SDK and HTTP stack are very chatty at debug.
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,s3tgz=trace,debug";

/// Buffer which collects every log event of a single test
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Take everything logged so far.  Invalid UTF-8 is replaced rather than failing the test.
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.0.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(buffer: LogBuffer) -> Result<tracing::Dispatch> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(buffer);

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let subscriber = tracing_subscriber::registry().with(filter).with(format);

    Ok(tracing::Dispatch::new(subscriber))
}

std::thread_local! {
    static THREAD_DISPATCHER_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
}

/// Multi-threaded runtime whose worker threads (including blocking pool threads) all log to
/// `dispatch`
fn make_runtime(dispatch: &Arc<tracing::Dispatch>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();

    {
        let dispatch = dispatch.clone();
        builder.on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(Some(guard)));
        });
    }

    builder.on_thread_stop(|| {
        THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(None));
    });

    Ok(builder.build()?)
}

/// Run a test with logging enabled.
///
/// This takes the place of `tokio::test`, because the runtime has to be built in a particular way
/// for the log events from async tasks and blocking tasks to end up in this test's output.
///
/// The captured log is printed when the test finishes, whether it passed, failed or panicked.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let buffer = LogBuffer::default();
    let dispatch = Arc::new(make_dispatch(buffer.clone())?);

    tracing::dispatcher::with_default(&dispatch, || {
        let runtime = make_runtime(&dispatch)?;

        // Test futures can't reasonably be required to be unwind safe; the panic is re-raised right
        // after the log is printed anyway
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", buffer.drain());

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
