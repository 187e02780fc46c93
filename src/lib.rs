//! Twirp RPC runtime.
//!
//! Twirp routes `POST [prefix]/<package>.<Service>/<Method>` requests and
//! carries messages as protobuf (`application/protobuf`) or JSON
//! (`application/json`). Errors travel as a small JSON envelope with a
//! canonical code, a message and string metadata.
//!
//! # Layout
//!
//! - [`server`]: request dispatch for one service, a `tower::Service`, and
//!   a TCP accept loop.
//! - [`client`]: typed calls over a pluggable HTTP transport.
//! - [`stream`]: server-streaming responses and their wire framing.
//! - [`hooks`] and [`interceptor`]: lifecycle callbacks and middleware,
//!   shared by both sides.
//! - [`error`]: the error model and its envelope.

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod hooks;
pub mod interceptor;
pub mod logging_layer;
pub mod server;
pub mod stream;

pub use client::{Client, ClientBuilder, HttpClient};
pub use codec::{Codec, Message};
pub use context::Context;
pub use descriptor::{MethodDescriptor, MethodKind, ServiceDescriptor};
pub use error::{Error, ErrorCode, TwirpResult};
pub use hooks::{ClientHooks, ServerHooks};
pub use interceptor::{AnyMessage, Interceptor, Method};
pub use server::{Server, ServerBuilder, serve};
pub use stream::{ResponseStream, StreamReader, StreamSender};
