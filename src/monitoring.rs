use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "snooper";

/// Proxy counters, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    calls_total: IntCounter,
    call_failures: IntCounterVec,
    active_calls: IntGauge,
    stream_frames: IntCounter,
    call_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, ProxyError> {
        let registry = Registry::new();

        let calls_total = IntCounter::with_opts(
            Opts::new("calls_total", "Number of proxied calls").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let call_failures = IntCounterVec::new(
            Opts::new("call_failures_total", "Calls that ended with an error, by reason").namespace(NAMESPACE),
            &["reason"],
        )
        .map_err(metric_error)?;
        let active_calls = IntGauge::with_opts(
            Opts::new("active_calls", "Calls currently in flight").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let stream_frames = IntCounter::with_opts(
            Opts::new("stream_frames_total", "Event-stream frames relayed").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let call_duration = Histogram::with_opts(
            HistogramOpts::new("call_duration_seconds", "Wall time of proxied calls")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )
        .map_err(metric_error)?;

        registry.register(Box::new(calls_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(call_failures.clone())).map_err(metric_error)?;
        registry.register(Box::new(active_calls.clone())).map_err(metric_error)?;
        registry.register(Box::new(stream_frames.clone())).map_err(metric_error)?;
        registry.register(Box::new(call_duration.clone())).map_err(metric_error)?;

        Ok(Self {
            registry,
            calls_total,
            call_failures,
            active_calls,
            stream_frames,
            call_duration,
        })
    }

    /// Counts a new call. The returned timer tracks it as active until dropped.
    pub fn start_call(&self) -> CallTimer {
        self.calls_total.inc();
        self.active_calls.inc();
        CallTimer {
            start_time: Instant::now(),
            active_calls: self.active_calls.clone(),
            call_duration: self.call_duration.clone(),
        }
    }

    pub fn record_failure(&self, err: &ProxyError) {
        self.call_failures.with_label_values(&[err.reason()]).inc();
    }

    pub fn record_stream_frame(&self) {
        self.stream_frames.inc();
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.get()
    }

    pub fn active_calls(&self) -> i64 {
        self.active_calls.get()
    }

    pub fn stream_frames(&self) -> u64 {
        self.stream_frames.get()
    }

    pub fn failures(&self, reason: &str) -> u64 {
        self.call_failures.with_label_values(&[reason]).get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| ProxyError::Config(format!("metrics are not utf-8: {}", e)))
    }
}

fn metric_error(err: prometheus::Error) -> ProxyError {
    ProxyError::Config(format!("metrics: {}", err))
}

pub struct CallTimer {
    start_time: Instant,
    active_calls: IntGauge,
    call_duration: Histogram,
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.active_calls.dec();
        self.call_duration.observe(self.start_time.elapsed().as_secs_f64());
    }
}

/// Serves `GET /metrics` on its own listener.
pub struct MonitoringServer {
    addr: SocketAddr,
    metrics: Arc<Metrics>,
}

impl MonitoringServer {
    pub fn new(addr: SocketAddr, metrics: Arc<Metrics>) -> Self {
        Self { addr, metrics }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        log::info!("Metrics endpoint listening on http://{}/metrics", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::debug!("Metrics endpoint shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = ServerBuilder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let metrics = metrics.clone();
                            async move { Ok::<_, Infallible>(route(&metrics, req)) }
                        }),
                    )
                    .await
                {
                    log::debug!("Metrics connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

fn route(metrics: &Metrics, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        return plain(StatusCode::NOT_FOUND, Bytes::new());
    }

    match metrics.encode() {
        Ok(payload) => {
            let mut response = plain(StatusCode::OK, Bytes::from(payload));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            log::error!("Failed to encode Prometheus metrics: {}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
    }
}

fn plain(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_timer_tracks_active_calls() {
        let metrics = Metrics::new().unwrap();
        {
            let _first = metrics.start_call();
            let _second = metrics.start_call();
            assert_eq!(metrics.active_calls(), 2);
        }
        assert_eq!(metrics.active_calls(), 0);
        assert_eq!(metrics.calls_total(), 2);
    }

    #[test]
    fn test_failures_by_reason() {
        let metrics = Metrics::new().unwrap();
        metrics.record_failure(&ProxyError::Cancelled);
        metrics.record_failure(&ProxyError::Cancelled);
        metrics.record_failure(&ProxyError::Upstream("refused".to_string()));
        assert_eq!(metrics.failures("cancelled"), 2);
        assert_eq!(metrics.failures("upstream"), 1);
        assert_eq!(metrics.failures("decode"), 0);
    }

    #[test]
    fn test_encode_exposition() {
        let metrics = Metrics::new().unwrap();
        drop(metrics.start_call());
        metrics.record_stream_frame();
        metrics.record_failure(&ProxyError::Cancelled);

        let text = metrics.encode().unwrap();
        assert!(text.contains("snooper_calls_total 1"));
        assert!(text.contains("snooper_stream_frames_total 1"));
        assert!(text.contains("snooper_call_failures_total{reason=\"cancelled\"} 1"));
        assert!(text.contains("snooper_call_duration_seconds_count 1"));
        assert!(text.contains("snooper_active_calls 0"));
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let server = MonitoringServer::new("127.0.0.1:0".parse().unwrap(), metrics);
        let handle = tokio::spawn(server.run(shutdown.clone()));

        shutdown.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
