//! Structured logging initialization.
//!
//! Configures the tracing subscriber. The RUST_LOG environment variable
//! takes precedence over the configuration file level.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Arc;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LogSink, LoggingConfig};

/// Writer cloned per log line, appending to a shared file handle.
struct FileWriter(Arc<std::fs::File>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// Initialize the logging subsystem.
///
/// # Example
///
/// ```ignore
/// use server::config::LoggingConfig;
/// use server::logging;
///
/// logging::init(&LoggingConfig::default()).unwrap();
/// tracing::info!("server starting");
/// ```
pub fn init(config: &LoggingConfig) -> io::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let (writer, ansi) = match config.sink {
        LogSink::Console => (BoxMakeWriter::new(io::stderr), true),
        LogSink::File => {
            let path = config
                .path
                .as_ref()
                .expect("validated: file sink requires a path");
            let file = Arc::new(OpenOptions::new().create(true).append(true).open(path)?);
            (
                BoxMakeWriter::new(move || FileWriter(file.clone())),
                false,
            )
        }
    };

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_ansi(ansi)
                        .with_thread_names(config.thread_names)
                        .with_writer(writer),
                )
                .init();
        }
        (LogFormat::Pretty, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_ansi(ansi)
                        .with_thread_names(config.thread_names)
                        .with_writer(writer)
                        .without_time(),
                )
                .init();
        }
        (LogFormat::Json, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_thread_names(config.thread_names)
                        .with_writer(writer),
                )
                .init();
        }
        (LogFormat::Json, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_thread_names(config.thread_names)
                        .with_writer(writer)
                        .without_time(),
                )
                .init();
        }
        (LogFormat::Compact, true) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(ansi)
                        .with_thread_names(config.thread_names)
                        .with_writer(writer),
                )
                .init();
        }
        (LogFormat::Compact, false) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(ansi)
                        .with_thread_names(config.thread_names)
                        .with_writer(writer)
                        .without_time(),
                )
                .init();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_file_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let file = Arc::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .unwrap(),
        );

        FileWriter(file.clone()).write_all(b"line one\n").unwrap();
        FileWriter(file).write_all(b"line two\n").unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }
}
