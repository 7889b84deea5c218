use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("proxy request error: {0}")]
    Upstream(String),

    #[error("error reading request body: {0}")]
    RequestBody(String),

    #[error("error reading response body: {0}")]
    ResponseBody(String),

    #[error("failed unpacking gzip {what} body: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy context cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ProxyError {
    /// Status returned to the client when a call fails before response headers were sent.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Decode { what: "request", .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::Io(_) => "io",
            ProxyError::Http(_) | ProxyError::Uri(_) => "http",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::RequestBody(_) | ProxyError::ResponseBody(_) => "body",
            ProxyError::Decode { .. } => "decode",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Config(_) | ProxyError::Tls(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::Cancelled.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::Upstream("connection refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );

        let request_decode = ProxyError::Decode {
            what: "request",
            source: std::io::Error::other("corrupt deflate stream"),
        };
        assert_eq!(request_decode.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(request_decode.reason(), "decode");

        let response_decode = ProxyError::Decode {
            what: "response",
            source: std::io::Error::other("corrupt deflate stream"),
        };
        assert_eq!(response_decode.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_decode_message_names_side() {
        let err = ProxyError::Decode {
            what: "response",
            source: std::io::Error::other("invalid gzip header"),
        };
        assert_eq!(err.to_string(), "failed unpacking gzip response body: invalid gzip header");
    }
}
