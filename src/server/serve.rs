//! TCP accept loop.
//!
//! Serves a [`Server`] over HTTP/1.1 and HTTP/2 (auto-detected) behind the
//! request logging layer. Cancelling the shutdown token stops accepting,
//! and every open connection finishes its in-flight requests before
//! closing.

use super::Server;
use crate::error::BoxError;
use crate::logging_layer::logging_layer;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::{debug, error, info, warn};

/// Time a connection gets to drain after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Accepts connections on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, server: Server, shutdown: CancellationToken) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        prefix = %server.path_prefix(),
        "Twirp server listening"
    );

    let service = ServiceBuilder::new().layer(logging_layer()).service(server);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let service = service.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, service, conn_shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    Ok(())
}

/// Serves one connection until it closes or shutdown completes.
async fn handle_connection<S, B>(stream: TcpStream, peer_addr: SocketAddr, service: S, shutdown: CancellationToken)
where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let io = TokioIo::new(stream);
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, TowerToHyperService::new(service));

    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(SHUTDOWN_GRACE, conn).await.is_err() {
                warn!(peer = %peer_addr, "Connection did not drain in time, dropping");
            }
        }
    }
}
