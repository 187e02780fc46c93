//! Mock HTTP intermediary (proxy, load balancer) for client error tests.
//!
//! Answers every request with one canned response, whatever the path, and
//! remembers what it was sent.

#![allow(dead_code)]

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockIntermediary {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

#[derive(Debug)]
struct MockState {
    response: MockIntermediary,
    request_count: RwLock<u32>,
    last_headers: RwLock<Option<HeaderMap>>,
}

impl MockIntermediary {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .push((HeaderName::from_static(name), HeaderValue::from_static(value)));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub async fn start(self) -> (SocketAddr, MockHandle) {
        let state = Arc::new(MockState {
            response: self,
            request_count: RwLock::new(0),
            last_headers: RwLock::new(None),
        });

        let app = Router::new().fallback(respond).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (
            addr,
            MockHandle {
                state,
                _handle: handle,
            },
        )
    }
}

pub struct MockHandle {
    state: Arc<MockState>,
    _handle: JoinHandle<()>,
}

impl MockHandle {
    pub async fn request_count(&self) -> u32 {
        *self.state.request_count.read().await
    }

    pub async fn last_headers(&self) -> Option<HeaderMap> {
        self.state.last_headers.read().await.clone()
    }
}

async fn respond(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    *state.request_count.write().await += 1;
    *state.last_headers.write().await = Some(headers);

    let canned = &state.response;
    let mut response = (canned.status, canned.body.clone()).into_response();
    for (name, value) in &canned.headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}
