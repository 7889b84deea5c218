//! Structured traffic log entries and the sink they are handed to.

use bytes::Bytes;
use hyper::header::HOST;
use http::request::Parts;
use log::{debug, info, log_enabled, Level};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Log target used for traffic lines, so they can be filtered apart from
/// the proxy's own diagnostics (`RUST_LOG=rpc_snooper::traffic=debug`).
pub const TRAFFIC_TARGET: &str = "rpc_snooper::traffic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Request,
    Response,
    StreamFrame,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Request => write!(f, "request"),
            EntryKind::Response => write!(f, "response"),
            EntryKind::StreamFrame => write!(f, "stream-frame"),
        }
    }
}

/// What the proxy knows about the inbound request, captured once per call and
/// shared by every entry of that call.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub host: String,
    pub scheme: &'static str,
    pub method: String,
    pub protocol: String,
    pub uri: String,
    pub path: String,
    pub client_ip: IpAddr,
}

impl RequestInfo {
    pub fn from_parts(parts: &Parts, remote_addr: SocketAddr, scheme: &'static str) -> Self {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        Self {
            host,
            scheme,
            method: parts.method.to_string(),
            protocol: format!("{:?}", parts.version),
            uri: parts.uri.to_string(),
            path: parts.uri.path().to_string(),
            client_ip: remote_addr.ip(),
        }
    }
}

/// Immutable snapshot of one request, buffered response or stream frame.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub call_index: u64,

    // Tags
    pub host: String,
    pub scheme: String,
    pub method: String,
    pub status: Option<u16>,
    pub protocol: String,
    pub uri: String,
    pub jrpc_method: String,

    // Fields
    pub client_ip: IpAddr,
    pub duration: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    #[serde(skip)]
    pub payload: Bytes,
}

impl LogEntry {
    fn base(kind: EntryKind, call_index: u64, info: &RequestInfo, jrpc_method: &str) -> Self {
        Self {
            kind,
            call_index,
            host: info.host.clone(),
            scheme: info.scheme.to_string(),
            method: info.method.clone(),
            status: None,
            protocol: info.protocol.clone(),
            uri: info.uri.clone(),
            jrpc_method: jrpc_method.to_string(),
            client_ip: info.client_ip,
            duration: 0.0,
            bytes_sent: 0,
            bytes_received: 0,
            payload: Bytes::new(),
        }
    }

    pub fn request(call_index: u64, info: &RequestInfo, jrpc_method: &str, content_length: u64, payload: Bytes) -> Self {
        Self {
            bytes_received: content_length,
            payload,
            ..Self::base(EntryKind::Request, call_index, info, jrpc_method)
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn response(
        call_index: u64,
        info: &RequestInfo,
        jrpc_method: &str,
        status: u16,
        elapsed: Duration,
        bytes_sent: u64,
        bytes_received: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            status: Some(status),
            duration: elapsed.as_secs_f64(),
            bytes_sent,
            bytes_received,
            payload,
            ..Self::base(EntryKind::Response, call_index, info, jrpc_method)
        }
    }

    pub fn stream_frame(call_index: u64, info: &RequestInfo, status: u16, elapsed: Duration, frame: Bytes) -> Self {
        Self {
            status: Some(status),
            duration: elapsed.as_secs_f64(),
            bytes_sent: frame.len() as u64,
            bytes_received: frame.len() as u64,
            payload: frame,
            ..Self::base(EntryKind::StreamFrame, call_index, info, "")
        }
    }
}

/// Sink for traffic entries. Implementations decide transport and format.
pub trait Logger: Send + Sync {
    fn log(&self, entry: &LogEntry);
}

/// Writes entries through the `log` facade: one `info` line per entry and the
/// decoded payload at `debug`.
#[derive(Debug, Default, Clone)]
pub struct StandardLogger;

impl Logger for StandardLogger {
    fn log(&self, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Request => info!(
                target: TRAFFIC_TARGET,
                "[call {}] {} {} {} {}://{}{} jrpc={} client={} bytes={}",
                entry.call_index,
                entry.kind,
                entry.protocol,
                entry.method,
                entry.scheme,
                entry.host,
                entry.uri,
                entry.jrpc_method,
                entry.client_ip,
                entry.bytes_received,
            ),
            EntryKind::Response | EntryKind::StreamFrame => info!(
                target: TRAFFIC_TARGET,
                "[call {}] {} status={} jrpc={} duration={:.3}s sent={} received={}",
                entry.call_index,
                entry.kind,
                entry.status.unwrap_or_default(),
                entry.jrpc_method,
                entry.duration,
                entry.bytes_sent,
                entry.bytes_received,
            ),
        }

        if !entry.payload.is_empty() && log_enabled!(target: TRAFFIC_TARGET, Level::Debug) {
            debug!(target: TRAFFIC_TARGET, "[call {}] {}", entry.call_index, render_payload(&entry.payload));
        }
    }
}

/// Pretty-prints JSON payloads, falls back to lossy UTF-8 for anything else.
pub fn render_payload(payload: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| String::from_utf8_lossy(payload).into_owned()),
        Err(_) => String::from_utf8_lossy(payload).trim_end().to_string(),
    }
}
