//! Handler trait and type erasure.
//!
//! Routes and middleware are both plain async functions taking a
//! [`Context`]. The router stores them behind one trait object type so a
//! chain can mix closures and `async fn` items freely:
//!
//! ```text
//! async fn list_users(ctx: Context) { … }   ← user writes this
//!        ↓ router.get("/users", list_users)
//! list_users.boxed()                         ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(list_users))            ← stored as BoxedHandler
//!        ↓
//! handler.call(ctx) at request time          ← one vtable dispatch
//! ```

use crate::context::Context;
use hyper::StatusCode;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A heap-allocated, type-erased handler future
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Object-safe dispatch interface behind [`BoxedHandler`]
pub trait ErasedHandler: Send + Sync {
    /// Run the handler for one request
    fn call(&self, ctx: Context) -> BoxFuture;
}

/// A type-erased handler shared by every request that matches its route
pub type BoxedHandler = Arc<dyn ErasedHandler>;

/// Implemented for every `Fn(Context) -> impl Future<Output = ()>`.
///
/// Middleware is a handler that calls [`Context::next`] somewhere in its body.
pub trait Handler: Send + Sync + 'static {
    /// Erase the concrete type so the handler can sit in a chain
    fn boxed(self) -> BoxedHandler;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn boxed(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut> ErasedHandler for FnHandler<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture {
        Box::pin((self.0)(ctx))
    }
}

/// Adapt a handler returning `anyhow::Result<()>`.
///
/// An `Err` is passed to [`Context::handle_error`], so handlers can use `?`
/// and still produce a proper status code:
///
/// ```
/// use jug_core::{fallible, Context, Engine, ResponseStatusError, Router};
///
/// async fn show_user(ctx: Context) -> anyhow::Result<()> {
///     let id: u64 = ctx.param_as("id")?;
///     if id == 0 {
///         return Err(ResponseStatusError::not_found("no such user").into());
///     }
///     ctx.respond_ok(&serde_json::json!({ "id": id }));
///     Ok(())
/// }
///
/// let mut engine = Engine::new();
/// engine.get("/users/{id}", fallible(show_user));
/// ```
pub fn fallible<F, Fut>(f: F) -> impl Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    move |ctx: Context| {
        let fut = f(ctx.clone());
        async move {
            if let Err(err) = fut.await {
                ctx.handle_error(err);
            }
        }
    }
}

/// Answers with `405 Method Not Allowed` and no body.
///
/// Registered by [`Engine::expand_methods`](crate::Engine::expand_methods)
/// for every verb a known path lacks.
pub async fn method_not_allowed(ctx: Context) {
    ctx.status(StatusCode::METHOD_NOT_ALLOWED);
}
