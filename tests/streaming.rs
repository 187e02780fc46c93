//! Server-streaming over a real socket.

mod helpers;

use futures_util::StreamExt;
use helpers::fixtures::{self, Hat, MakeHatsReq, Size, WAIT};
use helpers::start;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use twirp::stream::channel;
use twirp::{Codec, Context, Error, ErrorCode, Server, ServerHooks};

fn req(quantity: i32, fail_after: i32) -> MakeHatsReq {
    MakeHatsReq {
        inches: 10,
        quantity,
        fail_after,
    }
}

#[tokio::test]
async fn test_large_protobuf_stream() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let mut hats = client
        .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(100_000, 0))
        .await
        .unwrap();
    let mut count = 0;
    while let Some(hat) = hats.next().await.unwrap() {
        assert_eq!(hat.name, format!("hat-{count}"));
        count += 1;
    }
    assert_eq!(count, 100_000);
}

#[tokio::test]
async fn test_json_stream() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;
    let client = fixtures::client(&server.base_url(), Codec::Json).build().unwrap();

    let hats = client
        .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(2_000, 0))
        .await
        .unwrap();
    let hats: Vec<Hat> = hats.into_stream().map(|hat| hat.unwrap()).collect().await;
    assert_eq!(hats.len(), 2_000);
    assert_eq!(hats[1999].name, "hat-1999");
}

#[tokio::test]
async fn test_empty_stream() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;

    for codec in [Codec::Protobuf, Codec::Json] {
        let client = fixtures::client(&server.base_url(), codec).build().unwrap();
        let mut hats = client
            .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(0, 0))
            .await
            .unwrap();
        assert!(hats.next().await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_stream_fails_midway() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;

    for codec in [Codec::Protobuf, Codec::Json] {
        let client = fixtures::client(&server.base_url(), codec).build().unwrap();
        let mut hats = client
            .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(50, 7))
            .await
            .unwrap();

        let mut received = 0;
        let err = loop {
            match hats.next().await {
                Ok(Some(_)) => received += 1,
                Ok(None) => panic!("stream ended without the trailer error"),
                Err(err) => break err,
            }
        };
        assert_eq!(received, 7);
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert_eq!(err.msg(), "out of felt");
        assert!(hats.next().await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_error_before_first_message_is_a_plain_error() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let err = client
        .call_server_streaming::<MakeHatsReq, Hat>(
            Context::new(),
            "MakeHats",
            MakeHatsReq {
                inches: 1,
                quantity: -1,
                fail_after: 0,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert_eq!(err.meta("argument"), "Quantity");
}

#[tokio::test]
async fn test_response_sent_fires_after_stream_ends() {
    let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let (sent_tx, sent_rx) = oneshot::channel();
    let sent_tx = Arc::new(Mutex::new(Some(sent_tx)));

    let (e1, e2) = (events.clone(), events.clone());
    let hooks = ServerHooks::new()
        .on_response_prepared(move |_ctx| e1.lock().unwrap().push("prepared"))
        .on_response_sent(move |ctx| {
            e2.lock().unwrap().push("sent");
            if let Some(tx) = sent_tx.lock().unwrap().take() {
                let _ = tx.send(ctx.status_code());
            }
        });
    let server = start(fixtures::haberdasher().hooks(hooks).build().unwrap()).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let mut hats = client
        .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(20, 0))
        .await
        .unwrap();
    while hats.next().await.unwrap().is_some() {}

    let status = tokio::time::timeout(WAIT, sent_rx).await.unwrap().unwrap();
    assert_eq!(status, Some(http::StatusCode::OK));
    assert_eq!(*events.lock().unwrap(), vec!["prepared", "sent"]);
}

#[tokio::test]
async fn test_producer_sees_client_going_away() {
    let (closed_tx, closed_rx) = oneshot::channel::<()>();
    let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));

    let server = Server::builder(fixtures::descriptor())
        .unary("MakeHat", fixtures::make_hat)
        .server_streaming("MakeHats", move |_ctx: Context, req: MakeHatsReq| {
            let closed_tx = closed_tx.clone();
            async move {
                let (tx, hats) = channel(4);
                tokio::spawn(async move {
                    let mut n = 0;
                    while tx.send(fixtures::hat(req.inches, n)).await.is_ok() {
                        n += 1;
                    }
                    if let Some(done) = closed_tx.lock().unwrap().take() {
                        let _ = done.send(());
                    }
                });
                Ok::<_, Error>(hats)
            }
        })
        .build()
        .unwrap();
    let server = start(server).await;
    let client = fixtures::client(&server.base_url(), Codec::Protobuf).build().unwrap();

    let mut hats = client
        .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(0, 0))
        .await
        .unwrap();
    for _ in 0..3 {
        assert!(hats.next().await.unwrap().is_some());
    }
    drop(hats);
    drop(client);

    tokio::time::timeout(WAIT, closed_rx).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unsupported_method_kind_is_internal() {
    let server = start(fixtures::haberdasher().build().unwrap()).await;
    let response = reqwest::Client::new()
        .post(server.url("/twirp/twirp.example.haberdasher.Haberdasher/SendSizes"))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let err = twirp::error::envelope::unmarshal_error(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(err.code(), ErrorCode::Internal);

    let client = fixtures::client(&server.base_url(), Codec::Json).build().unwrap();
    let hat: Hat = client
        .call_unary(Context::new(), "MakeHat", Size { inches: 1 })
        .await
        .unwrap();
    assert_eq!(hat.inches, 1);
}

#[tokio::test]
async fn test_panicking_producer_ends_with_internal_trailer() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let recorded = errors.clone();
    let hooks = ServerHooks::new().on_error(move |_ctx, err| recorded.lock().unwrap().push(err.msg().to_string()));

    let server = Server::builder(fixtures::descriptor())
        .hooks(hooks)
        .unary("MakeHat", fixtures::make_hat)
        .server_streaming("MakeHats", |_ctx: Context, req: MakeHatsReq| async move {
            let (tx, hats) = channel(4);
            tokio::spawn(async move {
                for n in 0..req.quantity {
                    if n == 3 {
                        panic!("needle snapped");
                    }
                    let _ = tx.send(fixtures::hat(req.inches, n)).await;
                }
                tx.finish();
            });
            Ok::<_, Error>(hats)
        })
        .build()
        .unwrap();
    let server = start(server).await;

    for codec in [Codec::Protobuf, Codec::Json] {
        let client = fixtures::client(&server.base_url(), codec).build().unwrap();
        let mut hats = client
            .call_server_streaming::<MakeHatsReq, Hat>(Context::new(), "MakeHats", req(10, 0))
            .await
            .unwrap();

        let mut received = 0;
        let err = loop {
            match hats.next().await {
                Ok(Some(_)) => received += 1,
                Ok(None) => panic!("{codec:?}: truncated stream read as complete"),
                Err(err) => break err,
            }
        };
        assert_eq!(received, 3, "{codec:?}");
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.msg(), twirp::stream::PRODUCER_ENDED_EARLY);
    }
    assert_eq!(
        *errors.lock().unwrap(),
        vec![twirp::stream::PRODUCER_ENDED_EARLY; 2]
    );
}
