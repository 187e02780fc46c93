//! Shared helpers for integration tests.
//!
//! Each test binary pulls these in with `mod helpers;`; not every binary
//! uses every helper.

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_intermediary;

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use twirp::Server;

/// A server running on an ephemeral local port. Shuts down on drop.
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    _handle: JoinHandle<()>,
}

impl RunningServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serves `server` on `127.0.0.1:0`.
pub async fn start(server: Server) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        twirp::serve(listener, server, token).await.unwrap();
    });
    RunningServer {
        addr,
        shutdown,
        _handle: handle,
    }
}
