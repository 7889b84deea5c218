pub mod body_codec;
pub mod call_context;
pub mod common;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod event_stream;
pub mod jsonrpc;
pub mod log_entry;
pub mod logging;
pub mod monitoring;
pub mod relay;
pub mod server;

pub use call_context::{CallContext, CallContextManager};
pub use config::Config;
pub use error::ProxyError;
pub use log_entry::{LogEntry, Logger, StandardLogger};
pub use relay::{Relay, RelayOptions};
pub use server::Server;
