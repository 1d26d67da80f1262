//! Relay configuration.
//!
//! Four positional values, in fixed order, select the listening endpoint and
//! the upstream server. Tuning knobs are optional flags with `TCPRELAY_*`
//! environment fallbacks.

use std::path::PathBuf;

use clap::Parser;

use crate::diagnostics::{DEFAULT_EXCERPT_LEN, DIAGNOSTICS_TARGET};
use crate::error::RelayError;
use crate::proxy::DEFAULT_BUFFER_SIZE;

/// Command line of the `tcprelay` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tcprelay",
    version,
    about = "Relay every inbound TCP connection to one fixed upstream server"
)]
pub struct Cli {
    /// Local IP address to listen on.
    pub local_host: String,

    /// Local port to listen on.
    pub local_port: u16,

    /// Upstream server IP address.
    pub upstream_host: String,

    /// Upstream server port.
    pub upstream_port: u16,

    /// Number of worker threads (default: available parallelism).
    #[arg(long, env = "TCPRELAY_WORKERS")]
    pub workers: Option<usize>,

    /// Per-direction relay buffer size in bytes.
    #[arg(long, env = "TCPRELAY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Append transfer records to this file as JSON lines instead of logging them.
    #[arg(long, env = "TCPRELAY_DIAGNOSTICS_FILE")]
    pub diagnostics_file: Option<PathBuf>,

    /// Payload bytes captured per transfer record.
    #[arg(long, env = "TCPRELAY_EXCERPT_LEN", default_value_t = DEFAULT_EXCERPT_LEN)]
    pub excerpt_len: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "TCPRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listening address literal; parsed when the acceptor is built.
    pub listen_host: String,
    /// Listening port (0 lets the OS pick).
    pub listen_port: u16,
    /// Upstream address literal.
    pub upstream_host: String,
    /// Upstream port.
    pub upstream_port: u16,
    /// Worker pool size.
    pub workers: usize,
    /// Per-direction relay buffer size.
    pub buffer_size: usize,
    /// Payload bytes captured per diagnostics record.
    pub excerpt_len: usize,
    /// Diagnostics file; `None` routes records to tracing.
    pub diagnostics_file: Option<PathBuf>,
    /// Log level fallback when RUST_LOG is unset.
    pub log_level: String,
}

impl RelayConfig {
    /// Configuration with default tuning.
    pub fn new(
        listen_host: impl Into<String>,
        listen_port: u16,
        upstream_host: impl Into<String>,
        upstream_port: u16,
    ) -> Self {
        Self {
            listen_host: listen_host.into(),
            listen_port,
            upstream_host: upstream_host.into(),
            upstream_port,
            workers: default_workers(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            excerpt_len: DEFAULT_EXCERPT_LEN,
            diagnostics_file: None,
            log_level: "info".to_string(),
        }
    }

    /// Set the worker pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the relay buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Filter directives used when RUST_LOG is unset.
    ///
    /// Transfer records routed through tracing are kept at any log level.
    pub fn log_filter(&self) -> String {
        format!("{},{}=debug", self.log_level, DIAGNOSTICS_TARGET)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.workers == 0 {
            return Err(RelayError::Config("workers must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(RelayError::Config("buffer size must be at least 1 byte".into()));
        }
        Ok(())
    }
}

impl From<Cli> for RelayConfig {
    fn from(cli: Cli) -> Self {
        Self {
            listen_host: cli.local_host,
            listen_port: cli.local_port,
            upstream_host: cli.upstream_host,
            upstream_port: cli.upstream_port,
            workers: cli.workers.unwrap_or_else(default_workers),
            buffer_size: cli.buffer_size,
            excerpt_len: cli.excerpt_len,
            diagnostics_file: cli.diagnostics_file,
            log_level: cli.log_level,
        }
    }
}

/// Available hardware concurrency, or 1 if unknown.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::try_parse_from(["tcprelay", "127.0.0.1", "9000", "10.0.0.5", "9001"]).unwrap();
        let config = RelayConfig::from(cli);

        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.upstream_host, "10.0.0.5");
        assert_eq!(config.upstream_port, 9001);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wrong_argument_count_is_usage_error() {
        assert!(Cli::try_parse_from(["tcprelay", "127.0.0.1", "9000", "10.0.0.5"]).is_err());
        assert!(Cli::try_parse_from([
            "tcprelay", "127.0.0.1", "9000", "10.0.0.5", "9001", "extra"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["tcprelay"]).is_err());
    }

    #[test]
    fn test_non_numeric_port_is_usage_error() {
        assert!(Cli::try_parse_from(["tcprelay", "127.0.0.1", "http", "10.0.0.5", "9001"]).is_err());
        assert!(Cli::try_parse_from(["tcprelay", "127.0.0.1", "9000", "10.0.0.5", "70000"]).is_err());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "tcprelay",
            "::1",
            "0",
            "::1",
            "9001",
            "--workers",
            "3",
            "--buffer-size",
            "4096",
            "--diagnostics-file",
            "/tmp/transfers.log",
        ])
        .unwrap();
        let config = RelayConfig::from(cli);

        assert_eq!(config.workers, 3);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(
            config.diagnostics_file,
            Some(PathBuf::from("/tmp/transfers.log"))
        );
    }

    #[test]
    fn test_default_log_filter_keeps_transfer_records() {
        use std::io::{self, Write};
        use std::sync::{Arc, Mutex};

        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::EnvFilter;

        use crate::diagnostics::{open_sink, Direction, SessionId, SessionTap, TransferOp};

        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Vec<u8>>>);

        impl Write for Capture {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let cli = Cli::try_parse_from(["tcprelay", "127.0.0.1", "9000", "10.0.0.5", "9001"]).unwrap();
        let config = RelayConfig::from(cli);
        assert_eq!(config.log_level, "info");

        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(config.log_filter()))
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(move || writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            let sink = open_sink(None).unwrap();
            SessionTap::new(SessionId::new(0, 1), sink, DEFAULT_EXCERPT_LEN).record(
                Direction::Upstream,
                TransferOp::Write,
                b"PING\n",
            );
            tracing::debug!(target: "tcprelay::proxy", "below the log level");
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("\"session\":\"w0-1\""), "output: {}", output);
        assert!(output.contains("PING"), "output: {}", output);
        assert!(!output.contains("below the log level"), "output: {}", output);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = RelayConfig::new("127.0.0.1", 0, "127.0.0.1", 1);
        assert!(config.clone().with_workers(0).validate().is_err());
        assert!(config.with_buffer_size(0).validate().is_err());
    }
}
