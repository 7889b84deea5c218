use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use env_logger::{Builder, Env, WriteStyle};
use log::Record;
use serde_json::json;
use std::io::Write;

/// Installs the process logger. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<(), ProxyError> {
    builder(config)
        .try_init()
        .map_err(|e| ProxyError::Config(format!("failed to install logger: {}", e)))
}

pub fn builder(config: &LoggingConfig) -> Builder {
    let level = config.level.clone().unwrap_or_default().to_string();
    let mut builder = Builder::from_env(Env::default().default_filter_or(level));

    match config.format.clone().unwrap_or_default() {
        LogFormat::Json => {
            builder.write_style(WriteStyle::Never);
            builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
        }
        LogFormat::Text => {
            let style = if config.color.unwrap_or(true) {
                WriteStyle::Auto
            } else {
                WriteStyle::Never
            };
            builder.write_style(style);
        }
    }

    builder
}

pub fn format_json(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let entry = json!({
        "timestamp": timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "file": record.file().unwrap_or("unknown"),
        "line": record.line().unwrap_or(0),
        "message": record.args().to_string(),
    });
    entry.to_string()
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!("invalid log format: {}. Must be one of: text, json", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_json_line_fields() {
        let line = format_json(
            &Record::builder()
                .args(format_args!("[call 3] upstream closed"))
                .level(Level::Warn)
                .target("rpc_snooper::relay")
                .module_path(Some("rpc_snooper::relay"))
                .line(Some(42))
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "warn");
        assert_eq!(value["target"], "rpc_snooper::relay");
        assert_eq!(value["line"], 42);
        assert_eq!(value["message"], "[call 3] upstream closed");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
        assert!(parse_log_level("verbose").is_err());
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }
}
