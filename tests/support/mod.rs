#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rpc_snooper::common::ProxyBody;
use rpc_snooper::log_entry::{EntryKind, LogEntry, Logger};
use rpc_snooper::monitoring::Metrics;
use rpc_snooper::relay::{Relay, RelayOptions};
use rpc_snooper::server::Server;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Logger that keeps every entry for inspection.
#[derive(Default)]
pub struct CollectingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl Logger for CollectingLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push(entry.clone());
    }
}

impl CollectingLogger {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: EntryKind) -> Vec<LogEntry> {
        self.entries().into_iter().filter(|e| e.kind == kind).collect()
    }
}

/// What the upstream saw for one request.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type Responder = Arc<dyn Fn(&Seen) -> Response<ProxyBody> + Send + Sync>;

pub struct Upstream {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Upstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

/// In-process HTTP/1 upstream. Every request body is buffered before
/// `respond` is called.
pub async fn spawn_upstream(respond: Responder) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let respond = respond.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let respond = respond.clone();
                    let record = record.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                        let seen = Seen {
                            method: parts.method.to_string(),
                            uri: parts.uri.to_string(),
                            headers: parts.headers,
                            body,
                        };
                        record.lock().unwrap().push(seen.clone());
                        Ok::<_, Infallible>(respond(&seen))
                    }
                });
                let _ = ServerBuilder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { addr, seen }
}

pub fn respond_with(status: StatusCode, headers: &[(&'static str, &'static str)], body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(rpc_snooper::common::full(body));
    *response.status_mut() = status;
    for (name, value) in headers {
        response.headers_mut().insert(*name, value.parse().unwrap());
    }
    response
}

pub struct Proxy {
    pub addr: SocketAddr,
    pub logger: Arc<CollectingLogger>,
    pub metrics: Arc<Metrics>,
    pub relay: Arc<Relay>,
    pub shutdown: CancellationToken,
}

impl Proxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn options(target: String, timeout: Duration) -> RelayOptions {
    RelayOptions {
        target,
        call_timeout: timeout,
        stream_extension: timeout,
        stream_path_prefixes: vec!["/eth/v1/events".to_string()],
    }
}

pub async fn spawn_proxy(options: RelayOptions) -> Proxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let logger = Arc::new(CollectingLogger::default());
    let metrics = Arc::new(Metrics::new().unwrap());
    let relay = Arc::new(Relay::new(options, logger.clone(), metrics.clone()));
    let shutdown = CancellationToken::new();

    tokio::spawn(Server::new(relay.clone()).serve(listener, shutdown.clone()));

    Proxy {
        addr,
        logger,
        metrics,
        relay,
        shutdown,
    }
}

pub fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

pub async fn send(request: Request<Full<Bytes>>) -> (Response<()>, Bytes) {
    let response = client().request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), body)
}

pub fn post(url: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    Request::post(url)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

pub fn get(url: &str) -> Request<Full<Bytes>> {
    Request::get(url).body(Full::new(Bytes::new())).unwrap()
}

pub fn gzip(data: &[u8]) -> Bytes {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    Bytes::from(encoder.finish().unwrap())
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
