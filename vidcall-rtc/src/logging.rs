//! Tracing subscriber setup for hosts embedding the media session

use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Crates logged at the configured level. Everything else, the `webrtc`
/// stack in particular, stays at `warn`.
const SESSION_TARGETS: [&str; 2] = ["vidcall_rtc", "vidcall_proto"];

/// Install the global subscriber described by `config`
///
/// `json` writes one record per line with span context, anything else the
/// pretty format. `RUST_LOG` replaces the default directives entirely.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))?;

    let file = config
        .file_path
        .as_deref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?
        .map(Arc::new);

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true);
        match file {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    } else {
        let layer = fmt::layer().pretty().with_target(true).with_file(false);
        match file {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    }

    Ok(())
}

/// `warn` globally, `level` for the session crates
fn default_directives(level: Level) -> String {
    let level = level.to_string().to_ascii_lowercase();
    let mut directives = String::from("warn");
    for target in SESSION_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    if level.eq_ignore_ascii_case("warning") {
        return Ok(Level::WARN);
    }
    level
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))
}
