//! Hooks that report request outcomes as `tracing` events.
//!
//! The server hooks record a start time when the request arrives and emit a
//! single completion event per request carrying method, status and latency,
//! plus a warning for every failed request. Client hooks do the same around
//! each outgoing call.

use super::{ClientHooks, ServerHooks};
use crate::context::Context;
use crate::error::{Error, ErrorCode};
use std::time::Instant;
use tracing::{debug, info, warn};

/// When the request entered the server or the call was prepared.
#[derive(Debug, Clone, Copy)]
pub struct RequestStart(pub Instant);

/// Code of the error that failed the request, kept for the completion event.
#[derive(Debug, Clone, Copy)]
struct FailedWith(ErrorCode);

/// Server hooks logging each request.
pub fn server_hooks() -> ServerHooks {
    ServerHooks::new()
        .on_request_received(|ctx| {
            ctx.extensions_mut().insert(RequestStart(Instant::now()));
            Ok(())
        })
        .on_request_routed(|ctx| {
            debug!(
                service = ctx.service_name().unwrap_or("unknown"),
                method = ctx.method_name().unwrap_or("unknown"),
                "Request routed"
            );
            Ok(())
        })
        .on_error(|ctx, err| {
            ctx.extensions_mut().insert(FailedWith(err.code()));
            log_error(ctx, err, "Request failed");
        })
        .on_response_sent(|ctx| {
            let latency_ms = ctx
                .extensions()
                .get::<RequestStart>()
                .map(|start| start.0.elapsed().as_millis() as u64);
            info!(
                service = ctx.service_name().unwrap_or("unknown"),
                method = ctx.method_name().unwrap_or("unknown"),
                status = ctx.status_code().map(|s| s.as_u16()),
                code = ctx.extensions().get::<FailedWith>().map(|f| f.0.as_str()),
                latency_ms,
                "Response sent"
            );
        })
}

/// Client hooks logging each call.
pub fn client_hooks() -> ClientHooks {
    ClientHooks::new()
        .on_request_prepared(|ctx, request| {
            ctx.extensions_mut().insert(RequestStart(Instant::now()));
            debug!(uri = %request.uri(), "Sending request");
            Ok(())
        })
        .on_response_received(|ctx| {
            let latency_ms = ctx
                .extensions()
                .get::<RequestStart>()
                .map(|start| start.0.elapsed().as_millis() as u64);
            info!(
                service = ctx.service_name().unwrap_or("unknown"),
                method = ctx.method_name().unwrap_or("unknown"),
                latency_ms,
                "Response received"
            );
        })
        .on_error(|ctx, err| log_error(ctx, err, "Call failed"))
}

fn log_error(ctx: &Context, err: &Error, message: &'static str) {
    warn!(
        service = ctx.service_name().unwrap_or("unknown"),
        method = ctx.method_name().unwrap_or("unknown"),
        code = %err.code(),
        msg = err.msg(),
        "{message}"
    );
}
