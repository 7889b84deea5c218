use clap::Parser;
use log::{error, info, warn};
use rpc_snooper::common::TlsConfig;
use rpc_snooper::config::{Config, LogLevel, LoggingConfig};
use rpc_snooper::config_validation;
use rpc_snooper::log_entry::StandardLogger;
use rpc_snooper::logging;
use rpc_snooper::monitoring::{Metrics, MonitoringServer};
use rpc_snooper::relay::Relay;
use rpc_snooper::server::Server;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version,
    about = "Transparent JSON-RPC reverse proxy that logs every call and relays event streams"
)]
struct Args {
    #[clap(value_name = "TARGET", help = "Upstream URL (default: http://127.0.0.1:8551)")]
    target: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Address to bind the proxy to (default: 127.0.0.1)")]
    bind_address: Option<IpAddr>,

    #[clap(short, long, value_name = "PORT", help = "Port to listen on (default: 3000)")]
    port: Option<u16>,

    #[clap(short, long, value_name = "PORT", help = "Metrics port, 0 disables the endpoint (default: 9092)")]
    metrics_port: Option<u16>,

    #[clap(short, long, help = "Log request and response payloads")]
    verbose: bool,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn or error (default: info)")]
    log_level: Option<String>,

    #[clap(long, help = "Disable colored log output")]
    no_color: bool,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Per-call timeout in seconds (default: 60)")]
    timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Deadline extension per relayed event (default: the call timeout)")]
    stream_extension: Option<u64>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(format!("Configuration file not found: {}", config_file).into());
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };
    apply_args(&mut config, &args)?;

    logging::init(config.logging.as_ref().unwrap_or(&LoggingConfig::default()))?;

    let validation = config_validation::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{}", err);
        }
        return Err("invalid configuration".into());
    }

    let metrics = Arc::new(Metrics::new()?);
    let relay = Arc::new(Relay::new(config.relay_options(), Arc::new(StandardLogger), metrics.clone()));

    let mut server = Server::new(relay);
    if let Some((private_key, certificate)) = config.tls_paths() {
        info!("Enabling HTTPS/TLS mode");
        server = server.with_tls(TlsConfig::acceptor(private_key, certificate)?);
    }

    let shutdown = CancellationToken::new();

    if let Some(metrics_addr) = config.metrics_addr() {
        let monitoring = MonitoringServer::new(metrics_addr, metrics);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = monitoring.run(token).await {
                error!("Metrics endpoint error: {}", e);
            }
        });
    }

    info!(
        "Starting rpc-snooper: call timeout {:?}, stream extension {:?}",
        config.call_timeout(),
        config.stream_extension()
    );
    let mut server_handle = tokio::spawn(server.run(config.listen_addr(), shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = &mut server_handle => {
            shutdown.cancel();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    shutdown.cancel();
    if let Ok(Err(e)) = server_handle.await {
        error!("Server error during shutdown: {}", e);
    }

    info!("rpc-snooper stopped");
    Ok(())
}

/// Command-line values win over the configuration file.
fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(target) = &args.target {
        config.target = target.clone();
    }
    if let Some(bind_address) = args.bind_address {
        config.bind_address = bind_address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(metrics_port) = args.metrics_port {
        config.metrics_port = metrics_port;
    }
    if let Some(timeout) = args.timeout {
        config.call_timeout_secs = timeout;
    }
    if let Some(extension) = args.stream_extension {
        config.stream_extension_secs = Some(extension);
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }

    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if let Some(level) = &args.log_level {
        logging.level = Some(logging::parse_log_level(level)?);
    }
    if args.verbose {
        logging.level = Some(LogLevel::Debug);
    }
    if args.no_color {
        logging.color = Some(false);
    }
    if let Some(format) = &args.log_format {
        logging.format = Some(logging::parse_log_format(format)?);
    }

    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        stream_extension_secs: Some(60),
        logging: Some(LoggingConfig {
            level: Some(LogLevel::Info),
            format: None,
            color: Some(true),
        }),
        ..Config::default()
    };
    config.to_file(file_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_flags_override_file() {
        let mut config = Config::default();
        let args = Args::parse_from(["rpc-snooper", "--log-level", "WARN", "--log-format", "json", "--no-color"]);
        apply_args(&mut config, &args).unwrap();

        let logging = config.logging.unwrap();
        assert_eq!(logging.level, Some(LogLevel::Warn));
        assert_eq!(logging.format, Some(rpc_snooper::config::LogFormat::Json));
        assert_eq!(logging.color, Some(false));
    }

    #[test]
    fn test_verbose_wins_over_log_level() {
        let mut config = Config::default();
        let args = Args::parse_from(["rpc-snooper", "--log-level", "error", "-v"]);
        apply_args(&mut config, &args).unwrap();
        assert_eq!(config.logging.unwrap().level, Some(LogLevel::Debug));
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        let mut config = Config::default();
        let args = Args::parse_from(["rpc-snooper", "--log-level", "loud"]);
        assert!(apply_args(&mut config, &args).is_err());
    }
}
