//! Logging configuration for sniffjoke
//!
//! Themed console output, an optional daily rolling file, and the
//! `sniffjoke::packet` target carrying one record per option injection.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Target of the per-injection packet records
pub const PACKET_TARGET: &str = "sniffjoke::packet";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "sniffjoke.log";

/// ANSI color codes for log levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTheme {
    pub trace: String,
    pub debug: String,
    pub info: String,
    pub warn: String,
    pub error: String,
    /// Color of packet records
    #[serde(default = "default_packet_color")]
    pub packet: String,
}

fn default_packet_color() -> String {
    "\x1b[35m".to_string() // Magenta
}

impl Default for LogTheme {
    fn default() -> Self {
        Self {
            trace: "\x1b[37m".to_string(), // White
            debug: "\x1b[36m".to_string(), // Cyan
            info: "\x1b[32m".to_string(),  // Green
            warn: "\x1b[33m".to_string(),  // Yellow
            error: "\x1b[31m".to_string(), // Red
            packet: default_packet_color(),
        }
    }
}

/// Initialize logging from the run configuration
pub async fn init_logging(config: &Config) -> anyhow::Result<()> {
    let theme = load_theme(&config.log_theme_path).await?;
    let filter = build_filter(&config.log_level, config.packet_log)?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(LogFormatter {
            theme: theme.clone(),
            ansi: true,
        });

    let file_layer = if config.log_to_file {
        let (dir, name) = split_log_path(config.log_file_path.as_deref());
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .event_format(LogFormatter { theme, ansi: false }),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).try_init()?;
    } else {
        registry.with(console_layer).try_init()?;
    }

    Ok(())
}

/// Level filter, with the packet target opened up to TRACE on request
fn build_filter(log_level: &str, packet_log: bool) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(log_level)?;
    let directive = if packet_log { "trace" } else { "off" };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(format!("{}={}", PACKET_TARGET, directive).parse()?);
    Ok(filter)
}

/// Directory and file name of the rolling log
fn split_log_path(path: Option<&str>) -> (String, String) {
    let Some(path) = path.map(Path::new) else {
        return (DEFAULT_LOG_DIR.to_string(), DEFAULT_LOG_FILE.to_string());
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    (dir, name)
}

/// Custom log formatter with theme colors
struct LogFormatter {
    theme: LogTheme,
    ansi: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let datetime = chrono::Utc::now();
        write!(writer, "[{}] ", datetime.format("%Y-%m-%d %H:%M:%S%.3f UTC"))?;

        let level_color = if metadata.target() == PACKET_TARGET {
            &self.theme.packet
        } else {
            match *metadata.level() {
                Level::TRACE => &self.theme.trace,
                Level::DEBUG => &self.theme.debug,
                Level::INFO => &self.theme.info,
                Level::WARN => &self.theme.warn,
                Level::ERROR => &self.theme.error,
            }
        };
        if self.ansi {
            write!(writer, "{}{:<5}\x1b[0m ", level_color, metadata.level())?;
        } else {
            write!(writer, "{:<5} ", metadata.level())?;
        }

        write!(writer, "{}: ", metadata.target())?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Load log theme from YAML file
async fn load_theme<P: AsRef<Path>>(path: P) -> anyhow::Result<LogTheme> {
    match fs::read_to_string(&path).await {
        Ok(contents) => {
            let theme: LogTheme = serde_yaml::from_str(&contents)?;
            Ok(theme)
        }
        Err(err) => {
            tracing::warn!(%err, "Failed to read theme file, using default theme");
            Ok(LogTheme::default())
        }
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}
