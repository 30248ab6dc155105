use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Environment variable holding filter directives that replace the configured level
pub const LOG_ENV: &str = "SFU_RELAY_LOG";

/// Crates of the WebRTC stack that log per packet or per ICE check below warn
const MEDIA_STACK_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "webrtc_data",
    "interceptor",
];

/// Install the global tracing subscriber for a relay process.
///
/// `SFU_RELAY_LOG` wins over the configured level when set. Otherwise the
/// media stack is capped at warn so relay logs stay readable at debug. The
/// json format is meant for log shippers, pretty for terminals.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level: LevelFilter = config
        .level
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {}", config.level))?;

    let env_filter = match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(relay_directives(level))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    match (config.format.as_str(), file) {
        ("json", Some(file)) => registry.with(json_layer().with_writer(file)).try_init()?,
        ("json", None) => registry.with(json_layer()).try_init()?,
        (_, Some(file)) => registry
            .with(pretty_layer().with_writer(file))
            .try_init()?,
        (_, None) => registry.with(pretty_layer()).try_init()?,
    }

    Ok(())
}

/// Filter directives for `level`, with the media stack never louder than warn
fn relay_directives(level: LevelFilter) -> String {
    let media = level.min(LevelFilter::WARN);
    MEDIA_STACK_TARGETS
        .iter()
        .fold(level.to_string(), |mut directives, target| {
            directives.push_str(&format!(",{target}={media}"));
            directives
        })
}

fn json_layer<S>() -> fmt::Layer<S, fmt::format::JsonFields, fmt::format::Format<fmt::format::Json>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
}

fn pretty_layer<S>() -> fmt::Layer<S, fmt::format::Pretty, fmt::format::Format<fmt::format::Pretty>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .pretty()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_line_number(true)
        .with_file(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_keeps_media_stack_at_warn() {
        let directives = relay_directives(LevelFilter::DEBUG);
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("webrtc_ice=warn"));
        assert!(directives.contains("interceptor=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_quiet_level_also_quiets_media_stack() {
        let directives = relay_directives(LevelFilter::ERROR);
        assert!(directives.starts_with("error,"));
        assert!(directives.contains("webrtc_dtls=error"));
        assert!(!directives.contains("=warn"));
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
