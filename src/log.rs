//! Logging from Trellis.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{Layer as FmtLayer, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::{self, Handle};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::{LogTarget, LoggingConfig};

//----------- Logger -----------------------------------------------------------

/// The state of the Trellis logger.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    /// Launch the Trellis logger in fallback mode (info to stderr).
    ///
    /// The configured level and target are applied later, once the
    /// configuration has been loaded, via [`Logger::apply`].
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] logger has been set already.
    pub fn launch() -> &'static Logger {
        let filter = EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env_lossy();

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter when the config changes.
        let (filter, filter_handle) = reload::Layer::new(filter);

        let layer = FmtLayer::new()
            .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
            .with_writer(TargetWriter);

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .init();

        Box::leak(Box::new(Logger {
            filter: filter_handle,
        }))
    }

    /// Apply the configured logging setup.
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), String> {
        let filter = EnvFilter::builder()
            .parse(&config.level)
            .map_err(|err| format!("invalid log level '{}': {err}", config.level))?;
        self.filter
            .reload(filter)
            .map_err(|err| err.to_string())?;

        let sink = match &config.target {
            LogTarget::Stdout => Sink::Stdout,
            LogTarget::Stderr => Sink::Stderr,
            LogTarget::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path.as_std_path())
                    .map_err(|err| format!("cannot open log file '{path}': {err}"))?;
                Sink::File(file)
            }
        };
        *sink_slot().lock().unwrap() = sink;
        Ok(())
    }
}

//----------- TargetWriter -----------------------------------------------------

/// The shared, switchable log sink.
enum Sink {
    Stdout,
    Stderr,
    File(std::fs::File),
}

fn sink_slot() -> &'static Mutex<Sink> {
    static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();
    SINK.get_or_init(|| Mutex::new(Sink::Stderr))
}

/// A `MakeWriter` that forwards to the currently-configured sink, so the
/// target can change after the subscriber is installed.
struct TargetWriter;

impl<'a> MakeWriter<'a> for TargetWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter
    }
}

struct SinkWriter;

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *sink_slot().lock().unwrap() {
            Sink::Stdout => io::stdout().write(buf),
            Sink::Stderr => io::stderr().write(buf),
            Sink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *sink_slot().lock().unwrap() {
            Sink::Stdout => io::stdout().flush(),
            Sink::Stderr => io::stderr().flush(),
            Sink::File(file) => file.flush(),
        }
    }
}
