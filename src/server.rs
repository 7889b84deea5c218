use crate::error::ProxyError;
use crate::relay::{ConnInfo, Relay};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Owns the listening socket and hands every request to the relay.
pub struct Server {
    relay: Arc<Relay>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay, tls: None }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accepts connections until `shutdown` fires. Calls on a connection are
    /// cancelled when it closes or when the server shuts down.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        info!(
            "rpc-snooper listening on {}://{} -> {}",
            scheme,
            listener.local_addr()?,
            self.relay.options().target
        );

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let relay = self.relay.clone();
            let tls = self.tls.clone();
            let token = shutdown.child_token();
            let conn = ConnInfo { remote_addr, scheme };

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(tls_stream, relay, conn, token).await,
                        Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
                    },
                    None => serve_connection(stream, relay, conn, token).await,
                }
            });
        }
    }
}

async fn serve_connection<I>(io: I, relay: Arc<Relay>, conn: ConnInfo, token: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _cancel_on_close = token.clone().drop_guard();
    let call_parent = token.clone();

    let service = service_fn(move |req| {
        let relay = relay.clone();
        let parent = call_parent.clone();
        async move { Ok::<_, Infallible>(relay.serve(req, conn, &parent).await) }
    });

    let connection = ServerBuilder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(e) = result {
        debug!("Connection from {} ended with error: {}", conn.remote_addr, e);
    }
}
