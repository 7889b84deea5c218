use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use http_body_util::combinators::BoxBody;
use hyper::{Response, StatusCode};
use rustls::ServerConfig;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Body type of every response the proxy hands to the server: buffered
/// upstream bytes, a streamed event body or an empty error body.
pub type ProxyBody = BoxBody<Bytes, io::Error>;

pub fn full(data: Bytes) -> ProxyBody {
    Full::new(data).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Response helpers for outcomes the proxy produces itself.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Status-only response. The proxy never fabricates a body.
    pub fn status(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(empty());
        *response.status_mut() = status;
        response
    }

    pub fn from_error(err: &ProxyError) -> Response<ProxyBody> {
        Self::status(err.status_code())
    }
}

/// TLS listener setup from PEM files.
pub struct TlsConfig;

impl TlsConfig {
    pub fn create_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
        let mut private_key_file = BufReader::new(
            File::open(private_key_path)
                .map_err(|e| ProxyError::Tls(format!("failed to open private key file {}: {}", private_key_path, e)))?,
        );
        let mut cert_file = BufReader::new(
            File::open(cert_path)
                .map_err(|e| ProxyError::Tls(format!("failed to open certificate file {}: {}", cert_path, e)))?,
        );

        let certs = rustls_pemfile::certs(&mut cert_file)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Tls(format!("failed to read certificate: {}", e)))?;
        if certs.is_empty() {
            return Err(ProxyError::Tls(format!("no certificate found in {}", cert_path)));
        }

        let private_key = rustls_pemfile::private_key(&mut private_key_file)
            .map_err(|e| ProxyError::Tls(format!("failed to read private key: {}", e)))?
            .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", private_key_path)))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Tls(format!("failed to create TLS config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }

    pub fn acceptor(private_key_path: &str, cert_path: &str) -> Result<TlsAcceptor, ProxyError> {
        let config = Self::create_config(private_key_path, cert_path)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}
