//! Deadlines and cancellation on both sides of a call.

mod helpers;

use helpers::fixtures::{self, Hat, MakeHatsReq, Size, WAIT};
use helpers::start;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use twirp::{Codec, Context, Error, ErrorCode, Server};

fn slow_server(started: Option<oneshot::Sender<Context>>) -> Server {
    let started = std::sync::Mutex::new(started);
    Server::builder(fixtures::descriptor())
        .unary("MakeHat", move |ctx: Context, size: Size| {
            if let Some(tx) = started.lock().unwrap().take() {
                let _ = tx.send(ctx.clone());
            }
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                fixtures::make_hat(ctx, size).await
            }
        })
        .server_streaming("MakeHats", fixtures::make_hats)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_client_deadline_aborts_call() {
    let server = start(slow_server(None)).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let ctx = Context::new().with_timeout(Duration::from_millis(100));
    let err = tokio::time::timeout(WAIT, client.call_unary::<Size, Hat>(ctx, "MakeHat", Size { inches: 1 }))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Internal);
    assert!(err.msg().starts_with("aborted because context was done"));
}

#[tokio::test]
async fn test_explicit_cancellation() {
    let server = start(slow_server(None)).await;
    let client = fixtures::client(&server.base_url(), Codec::Json).build().unwrap();

    let token = CancellationToken::new();
    let ctx = Context::new().with_cancellation(token.clone());
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_unary::<Size, Hat>(ctx, "MakeHat", Size { inches: 1 }).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err: Error = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(err.msg().starts_with("aborted because context was done"));
}

#[tokio::test]
async fn test_server_context_cancelled_when_client_disconnects() {
    let (started_tx, started_rx) = oneshot::channel();
    let server = start(slow_server(Some(started_tx))).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let call = tokio::spawn(async move {
        client
            .call_unary::<Size, Hat>(Context::new(), "MakeHat", Size { inches: 1 })
            .await
    });
    let server_ctx = tokio::time::timeout(WAIT, started_rx).await.unwrap().unwrap();
    assert!(server_ctx.err().is_none());

    call.abort();
    tokio::time::timeout(WAIT, server_ctx.done()).await.unwrap();
}

#[tokio::test]
async fn test_stream_reader_respects_deadline() {
    let server = Server::builder(fixtures::descriptor())
        .unary("MakeHat", fixtures::make_hat)
        .server_streaming("MakeHats", |_ctx: Context, _req: MakeHatsReq| async move {
            let (tx, hats) = twirp::stream::channel(1);
            tokio::spawn(async move {
                let _ = tx.send(fixtures::hat(1, 0)).await;
                tx.closed().await;
            });
            Ok::<_, Error>(hats)
        })
        .build()
        .unwrap();
    let server = start(server).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let ctx = Context::new().with_timeout(Duration::from_millis(200));
    let mut hats = client
        .call_server_streaming::<MakeHatsReq, Hat>(ctx, "MakeHats", MakeHatsReq::default())
        .await
        .unwrap();
    assert!(hats.next().await.unwrap().is_some());

    let err = tokio::time::timeout(WAIT, hats.next()).await.unwrap().unwrap_err();
    assert!(err.msg().starts_with("aborted because context was done"));
}
