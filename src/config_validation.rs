//! Startup checks on the effective configuration.
//!
//! All problems are collected so the operator sees every error at once.

use crate::config::Config;
use url::Url;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_target(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_listeners(config, &mut result);
    validate_tls(config, &mut result);

    for prefix in &config.stream_path_prefixes {
        if !prefix.starts_with('/') {
            result.add_warning(format!("stream path prefix '{}' does not start with '/' and never matches", prefix));
        }
    }

    result
}

fn validate_target(config: &Config, result: &mut ValidationResult) {
    match Url::parse(&config.target) {
        Ok(url) => {
            if url.scheme() != "http" && url.scheme() != "https" {
                result.add_error(format!("target scheme '{}' is not supported, use http or https", url.scheme()));
            }
            if url.host_str().is_none() {
                result.add_error(format!("target '{}' has no host", config.target));
            }
            if url.query().is_some() {
                result.add_error("target must not carry a query string".to_string());
            }
            if config.target.ends_with('/') {
                result.add_warning(format!(
                    "target '{}' ends with '/', forwarded paths will contain '//'",
                    config.target
                ));
            }
        }
        Err(e) => result.add_error(format!("invalid target url '{}': {}", config.target, e)),
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    if config.call_timeout_secs == 0 {
        result.add_error("call timeout must be greater than zero".to_string());
    }
    if config.stream_extension_secs == Some(0) {
        result.add_error("stream extension must be greater than zero".to_string());
    }
}

fn validate_listeners(config: &Config, result: &mut ValidationResult) {
    if config.metrics_port != 0 && config.metrics_port == config.port {
        result.add_error(format!("proxy and metrics listeners both use port {}", config.port));
    }
    if config.bind_address.is_unspecified() && config.tls_paths().is_none() {
        result.add_warning(format!(
            "listening on all interfaces ({}) without TLS",
            config.bind_address
        ));
    }
}

fn validate_tls(config: &Config, result: &mut ValidationResult) {
    match (&config.private_key, &config.certificate) {
        (Some(_), None) => result.add_error("private key configured without a certificate".to_string()),
        (None, Some(_)) => result.add_error("certificate configured without a private key".to_string()),
        (Some(key), Some(cert)) => {
            for (label, path) in [("private key", key), ("certificate", cert)] {
                if let Err(e) = std::fs::metadata(path) {
                    result.add_error(format!("{} file {} not accessible: {}", label, path, e));
                }
            }
        }
        (None, None) => {}
    }
}
