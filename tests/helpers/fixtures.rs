//! Haberdasher messages and service used across integration tests.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use twirp::stream;
use twirp::{
    Client, ClientBuilder, Codec, Context, Error, ErrorCode, MethodDescriptor, MethodKind, ResponseStream, Server,
    ServerBuilder, ServiceDescriptor,
};

pub const PACKAGE: &str = "twirp.example.haberdasher";
pub const SERVICE: &str = "Haberdasher";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Size {
    #[prost(int32, tag = "1")]
    pub inches: i32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Hat {
    #[prost(int32, tag = "1")]
    pub inches: i32,
    #[prost(string, tag = "2")]
    pub color: String,
    #[prost(string, tag = "3")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MakeHatsReq {
    #[prost(int32, tag = "1")]
    pub inches: i32,
    #[prost(int32, tag = "2")]
    pub quantity: i32,
    /// When non-zero, the stream fails after this many hats.
    #[prost(int32, tag = "3")]
    pub fail_after: i32,
}

pub fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(PACKAGE, SERVICE)
        .method(MethodDescriptor::unary("MakeHat", "Size", "Hat"))
        .method(MethodDescriptor::server_streaming("MakeHats", "MakeHatsReq", "Hat"))
        .method(MethodDescriptor::new("SendSizes", "Size", "Hat", MethodKind::Upload))
}

pub fn hat(inches: i32, n: i32) -> Hat {
    Hat {
        inches,
        color: if n % 2 == 0 { "white" } else { "black" }.to_string(),
        name: format!("hat-{n}"),
    }
}

pub async fn make_hat(_ctx: Context, size: Size) -> Result<Hat, Error> {
    if size.inches <= 0 {
        return Err(Error::invalid_argument("Inches", "I can't make a hat that small!"));
    }
    Ok(hat(size.inches, 0))
}

pub async fn make_hats(ctx: Context, req: MakeHatsReq) -> Result<ResponseStream<Hat>, Error> {
    if req.inches <= 0 {
        return Err(Error::invalid_argument("Inches", "I can't make hats that small!"));
    }
    if req.quantity < 0 {
        return Err(Error::invalid_argument("Quantity", "I can't make a negative quantity of hats!"));
    }

    let (tx, hats) = stream::channel(64);
    tokio::spawn(async move {
        for n in 0..req.quantity {
            if req.fail_after > 0 && n == req.fail_after {
                let _ = tx.fail(Error::new(ErrorCode::ResourceExhausted, "out of felt")).await;
                return;
            }
            if ctx.err().is_some() || tx.send(hat(req.inches, n)).await.is_err() {
                return;
            }
        }
        tx.finish();
    });
    Ok(hats)
}

/// The haberdasher with both methods registered.
pub fn haberdasher() -> ServerBuilder {
    Server::builder(descriptor())
        .unary("MakeHat", make_hat)
        .server_streaming("MakeHats", make_hats)
}

pub fn client(base_url: &str, codec: Codec) -> ClientBuilder {
    Client::builder(base_url, descriptor()).with_codec(codec)
}

pub const WAIT: Duration = Duration::from_secs(5);
