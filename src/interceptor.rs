//! Interceptors: middleware around a method call.
//!
//! A [`Method`] is a type-erased call taking the request as an opaque
//! [`AnyMessage`]. An [`Interceptor`] wraps one method into another. The
//! server applies interceptors around the service implementation, the client
//! around the transport call, so one interceptor type serves both sides.
//!
//! Interceptors see requests and responses only as `dyn Any`; an interceptor
//! that cares about a concrete message type downcasts it and passes anything
//! else through untouched.

use crate::context::Context;
use crate::error::Error;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Request or response as seen by interceptors.
pub type AnyMessage = Box<dyn Any + Send>;

/// A type-erased RPC call.
pub type Method =
    Arc<dyn Fn(Context, AnyMessage) -> BoxFuture<'static, Result<AnyMessage, Error>> + Send + Sync>;

/// Wraps a method into another method.
pub type Interceptor = Arc<dyn Fn(Method) -> Method + Send + Sync>;

/// Builds a [`Method`] from an async closure.
pub fn method_fn<F, Fut>(f: F) -> Method
where
    F: Fn(Context, AnyMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AnyMessage, Error>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(f(ctx, req)))
}

/// Builds an [`Interceptor`] from a closure.
pub fn interceptor_fn<F>(f: F) -> Interceptor
where
    F: Fn(Method) -> Method + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Composes interceptors so the first one is the outermost.
///
/// Returns `None` for an empty list and the interceptor itself for a single
/// element.
pub fn chain_interceptors(interceptors: &[Interceptor]) -> Option<Interceptor> {
    match interceptors {
        [] => None,
        [single] => Some(Arc::clone(single)),
        many => {
            let many: Vec<Interceptor> = many.to_vec();
            Some(Arc::new(move |next: Method| {
                many.iter()
                    .rev()
                    .fold(next, |inner, interceptor| interceptor(inner))
            }))
        }
    }
}

/// Applies an optional interceptor to a method.
pub(crate) fn intercept(interceptor: Option<&Interceptor>, method: Method) -> Method {
    match interceptor {
        Some(interceptor) => interceptor(method),
        None => method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    /// Prepends `prefix` to a `String` request and appends `suffix` to a
    /// `String` response.
    fn wrapping(prefix: &'static str, suffix: &'static str) -> Interceptor {
        interceptor_fn(move |next: Method| {
            method_fn(move |ctx, req: AnyMessage| {
                let next = Arc::clone(&next);
                async move {
                    let req = match req.downcast::<String>() {
                        Ok(s) => Box::new(format!("{prefix}{s}")) as AnyMessage,
                        Err(other) => other,
                    };
                    let resp = next(ctx, req).await?;
                    Ok::<AnyMessage, Error>(match resp.downcast::<String>() {
                        Ok(s) => Box::new(format!("{s}{suffix}")) as AnyMessage,
                        Err(other) => other,
                    })
                }
            })
        })
    }

    fn terminal() -> Method {
        method_fn(|_ctx, req: AnyMessage| async move {
            let req = req
                .downcast::<String>()
                .map_err(|_| Error::internal("expected a string"))?;
            Ok::<AnyMessage, Error>(Box::new(format!("{req}x")))
        })
    }

    async fn call(method: Method, input: &str) -> String {
        let resp = method(Context::new(), Box::new(input.to_string()))
            .await
            .unwrap();
        *resp.downcast::<String>().unwrap()
    }

    #[tokio::test]
    async fn test_chain_nesting_order() {
        let chained = chain_interceptors(&[
            wrapping("a", "1"),
            wrapping("b", "2"),
            wrapping("c", "3"),
        ])
        .unwrap();

        assert_eq!(call(chained(terminal()), "").await, "abcx321");
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        assert!(chain_interceptors(&[]).is_none());
        let method = intercept(None, terminal());
        assert_eq!(call(method, "q").await, "qx");
    }

    #[tokio::test]
    async fn test_single_element_returned_unchanged() {
        let only = wrapping("a", "1");
        let chained = chain_interceptors(std::slice::from_ref(&only)).unwrap();
        assert!(Arc::ptr_eq(&only, &chained));
        assert_eq!(call(chained(terminal()), "").await, "ax1");
    }

    #[tokio::test]
    async fn test_interceptor_can_short_circuit() {
        let deny = interceptor_fn(|_next: Method| {
            method_fn(|_ctx, _req| async {
                Err::<AnyMessage, _>(Error::new(ErrorCode::PermissionDenied, "denied"))
            })
        });
        let chained = chain_interceptors(&[wrapping("a", "1"), deny]).unwrap();
        let err = chained(terminal())(Context::new(), Box::new(String::new()))
            .await
            .unwrap_err();
        assert_eq!(err.msg(), "denied");
    }

    #[tokio::test]
    async fn test_foreign_types_pass_through() {
        let method = wrapping("a", "1")(method_fn(|_ctx, req: AnyMessage| async move { Ok::<_, Error>(req) }));
        let resp = method(Context::new(), Box::new(7u32)).await.unwrap();
        assert_eq!(*resp.downcast::<u32>().unwrap(), 7);
    }
}
