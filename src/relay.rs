//! One proxied call, end to end.
//!
//! The inbound body is buffered and forwarded as-is; a decoded copy feeds the
//! request log entry. Responses are either buffered and logged the same way,
//! or, for event streams, relayed line by line from a background task that
//! keeps the call's deadline alive while events flow.

use crate::body_codec::{self, Encoding};
use crate::call_context::{CallContext, CallContextManager};
use crate::common::{self, ProxyBody, ResponseBuilder};
use crate::error::ProxyError;
use crate::event_stream::{self, CLIENT_CHANNEL_CAPACITY, EventStreamRelay};
use crate::jsonrpc;
use crate::log_entry::{LogEntry, Logger, RequestInfo};
use crate::monitoring::{CallTimer, Metrics};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, warn};
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Upstream base URL, used verbatim as the prefix of every forwarded URL.
    pub target: String,
    pub call_timeout: Duration,
    pub stream_extension: Duration,
    pub stream_path_prefixes: Vec<String>,
}

/// Peer details of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub scheme: &'static str,
}

pub struct Relay {
    options: RelayOptions,
    client: HttpClient,
    calls: CallContextManager,
    logger: Arc<dyn Logger>,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub fn new(options: RelayOptions, logger: Arc<dyn Logger>, metrics: Arc<Metrics>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
        Self {
            options,
            client,
            calls: CallContextManager::new(),
            logger,
            metrics,
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn calls(&self) -> &CallContextManager {
        &self.calls
    }

    /// Server entry point: failures become status-only responses.
    pub async fn serve<B>(&self, req: Request<B>, conn: ConnInfo, parent: &CancellationToken) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        match self.handle(req, conn, parent).await {
            Ok(response) => response,
            Err(err) => ResponseBuilder::from_error(&err),
        }
    }

    /// Proxies one request under a fresh call context derived from `parent`.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        conn: ConnInfo,
        parent: &CancellationToken,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let timer = self.metrics.start_call();
        let call = self.calls.create(parent, self.options.call_timeout);
        let guard = call.release_guard();

        let result = self.proxy(&call, guard, timer, req, conn).await;
        if let Err(err) = &result {
            self.metrics.record_failure(err);
            match err {
                ProxyError::Cancelled => warn!("[call {}] {} after {:?}", call.index(), err, call.elapsed()),
                _ => error!("[call {}] {}", call.index(), err),
            }
        }
        result
    }

    async fn proxy<B>(
        &self,
        call: &CallContext,
        guard: DropGuard,
        timer: CallTimer,
        req: Request<B>,
        conn: ConnInfo,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let info = RequestInfo::from_parts(&parts, conn.remote_addr, conn.scheme);
        let uri = upstream_uri(&self.options.target, &parts.uri)?;
        debug!("[call {}] {} {} -> {}", call.index(), info.method, info.uri, uri);

        let raw = tokio::select! {
            biased;
            _ = call.cancelled() => return Err(ProxyError::Cancelled),
            collected = body.collect() => collected
                .map_err(|e| ProxyError::RequestBody(e.to_string()))?
                .to_bytes(),
        };

        let decoded = inspect(&raw, Encoding::from_headers(&parts.headers))
            .map_err(|source| ProxyError::Decode { what: "request", source })?;
        let jrpc_method = jsonrpc::extract_method(&decoded);
        self.logger.log(&LogEntry::request(
            call.index(),
            &info,
            &jrpc_method,
            content_length(&parts.headers),
            decoded,
        ));

        let mut headers = parts.headers;
        headers.remove(HOST);
        let chain = forwarded_for(&headers, info.client_ip)?;
        headers.insert(X_FORWARDED_FOR, chain);

        let mut outbound = Request::new(Full::new(raw.clone()));
        *outbound.method_mut() = parts.method;
        *outbound.uri_mut() = uri;
        *outbound.headers_mut() = headers;

        let response = tokio::select! {
            biased;
            _ = call.cancelled() => return Err(ProxyError::Cancelled),
            result = self.client.request(outbound) => {
                result.map_err(|e| ProxyError::Upstream(e.to_string()))?
            }
        };
        if call.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let (mut rsp_parts, rsp_body) = response.into_parts();
        rsp_parts.headers.remove(TRANSFER_ENCODING);
        let streaming = is_event_stream(&rsp_parts.headers, &info.path, &self.options.stream_path_prefixes);
        if streaming {
            rsp_parts.headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
        }
        let status = rsp_parts.status.as_u16();

        if streaming && rsp_parts.status == StatusCode::OK {
            call.extend(self.options.stream_extension);
            let body = self.spawn_stream(call, guard, timer, info, status, rsp_body);
            return Ok(Response::from_parts(rsp_parts, body));
        }

        let raw_response = tokio::select! {
            biased;
            _ = call.cancelled() => return Err(ProxyError::Cancelled),
            collected = rsp_body.collect() => collected
                .map_err(|e| ProxyError::ResponseBody(e.to_string()))?
                .to_bytes(),
        };

        let decoded = inspect(&raw_response, Encoding::from_headers(&rsp_parts.headers))
            .map_err(|source| ProxyError::Decode { what: "response", source })?;
        self.logger.log(&LogEntry::response(
            call.index(),
            &info,
            &jrpc_method,
            status,
            call.elapsed(),
            raw.len() as u64,
            raw_response.len() as u64,
            decoded,
        ));

        Ok(Response::from_parts(rsp_parts, common::full(raw_response)))
    }

    /// Starts the event-stream relay task and returns the client body it feeds.
    /// The task owns the release guard, so the call ends with the stream.
    fn spawn_stream(
        &self,
        call: &CallContext,
        guard: DropGuard,
        timer: CallTimer,
        info: RequestInfo,
        status: u16,
        upstream: Incoming,
    ) -> ProxyBody {
        let (mut writer, body) = event_stream::client_channel(CLIENT_CHANNEL_CAPACITY);
        let call_ref = call.clone();
        let logger = self.logger.clone();
        let metrics = self.metrics.clone();
        let extension = self.options.stream_extension;

        let task = tokio::spawn(async move {
            let _guard = guard;
            let _timer = timer;
            let relay = EventStreamRelay {
                call: &call_ref,
                info: &info,
                status,
                logger: logger.as_ref(),
                metrics: metrics.as_ref(),
                extension,
            };
            match relay.relay(&mut writer, event_stream::body_reader(upstream)).await {
                Ok(written) => debug!(
                    "[call {}] event stream finished after {:?}, {} bytes relayed",
                    call_ref.index(),
                    call_ref.elapsed(),
                    written
                ),
                Err(err) => warn!(
                    "[call {}] event stream ended after {:?}: {}",
                    call_ref.index(),
                    call_ref.elapsed(),
                    err
                ),
            }
        });
        call.attach_stream(task.abort_handle());

        body.boxed()
    }
}

/// Decoded copy of a payload for logging. Empty bodies are never decoded.
fn inspect(raw: &Bytes, encoding: Encoding) -> std::io::Result<Bytes> {
    if raw.is_empty() {
        return Ok(raw.clone());
    }
    body_codec::decode(raw, encoding)
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Target + escaped path + `?query` when the query is non-empty. No normalisation.
pub fn upstream_url(target: &str, uri: &Uri) -> String {
    let mut url = String::with_capacity(target.len() + uri.path().len() + 16);
    url.push_str(target);
    url.push_str(uri.path());
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn upstream_uri(target: &str, uri: &Uri) -> Result<Uri, ProxyError> {
    let url = upstream_url(target, uri);
    url.parse::<Uri>()
        .map_err(|e| ProxyError::Uri(format!("invalid upstream url {}: {}", url, e)))
}

/// Existing `X-Forwarded-For` values joined with `, `, followed by the caller's IP.
pub fn forwarded_for(headers: &HeaderMap, client_ip: IpAddr) -> Result<HeaderValue, ProxyError> {
    let mut chain = Vec::new();
    for value in headers.get_all(X_FORWARDED_FOR) {
        chain.extend_from_slice(value.as_bytes());
        chain.extend_from_slice(b", ");
    }
    chain.extend_from_slice(client_ip.to_string().as_bytes());
    HeaderValue::from_bytes(&chain).map_err(|e| ProxyError::Http(format!("invalid X-Forwarded-For: {}", e)))
}

pub fn is_event_stream(headers: &HeaderMap, path: &str, prefixes: &[String]) -> bool {
    let essence = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim);
    essence.is_some_and(|ct| ct.eq_ignore_ascii_case("text/event-stream"))
        || prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["/eth/v1/events".to_string()]
    }

    #[test]
    fn test_upstream_url_is_verbatim() {
        let uri: Uri = "/eth/v1/node/health?x=1&y=%20".parse().unwrap();
        assert_eq!(
            upstream_url("http://10.0.0.5:5052", &uri),
            "http://10.0.0.5:5052/eth/v1/node/health?x=1&y=%20"
        );

        let uri: Uri = "/".parse().unwrap();
        assert_eq!(upstream_url("http://node:8545/base", &uri), "http://node:8545/base/");

        let uri: Uri = "/a//b/../c?".parse().unwrap();
        assert_eq!(upstream_url("http://node", &uri), "http://node/a//b/../c");
    }

    #[test]
    fn test_upstream_uri_rejects_garbage_target() {
        let uri: Uri = "/".parse().unwrap();
        assert!(matches!(upstream_uri("http://bad host", &uri), Err(ProxyError::Uri(_))));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        let empty = HeaderMap::new();
        assert_eq!(forwarded_for(&empty, ip).unwrap(), "192.168.1.20");

        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("2.2.2.2, 3.3.3.3"));
        assert_eq!(
            forwarded_for(&headers, ip).unwrap(),
            "1.1.1.1, 2.2.2.2, 3.3.3.3, 192.168.1.20"
        );
    }

    #[test]
    fn test_forwarded_for_keeps_opaque_values() {
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_bytes(b"proxy-\xe9").unwrap());
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("4.4.4.4"));

        let chain = forwarded_for(&headers, ip).unwrap();
        assert_eq!(chain.as_bytes(), b"proxy-\xe9, 4.4.4.4, 10.0.0.9");
    }

    #[test]
    fn test_event_stream_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers, "/", &prefixes()));
        assert!(is_event_stream(&headers, "/eth/v1/events?topics=head", &prefixes()));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Text/Event-Stream; charset=utf-8"));
        assert!(is_event_stream(&headers, "/anything", &prefixes()));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_event_stream(&headers, "/eth/v2/blocks", &prefixes()));
        assert!(!is_event_stream(&headers, "/eth/v1/events", &[]));
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), 0);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("128"));
        assert_eq!(content_length(&headers), 128);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("abc"));
        assert_eq!(content_length(&headers), 0);
    }

    #[test]
    fn test_inspect_skips_empty_bodies() {
        let empty = Bytes::new();
        assert!(inspect(&empty, Encoding::Gzip).unwrap().is_empty());
        assert!(inspect(&Bytes::from_static(b"junk"), Encoding::Gzip).is_err());
    }
}
