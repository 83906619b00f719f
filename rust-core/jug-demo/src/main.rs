//! # Jug Demo
//!
//! A small in-memory todo service exercising jug-core: route groups with
//! middleware, typed queries, JSON binding with validation, typed errors,
//! streaming and automatic 405 routes.
//!
//! ```text
//! PORT=3000 RUST_LOG=info cargo run -p jug-demo
//! curl -H 'X-User: ada' -d '{"title":"buy milk","tags":["errand"]}' localhost:3000/api/todos
//! ```

use hyper::StatusCode;
use jug_core::{
    fallible, Context, Engine, Handler, ResponseStatusError, Router, ServerConfig, Validatable,
    ValidationError, Validator,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TAGS: &[&str] = &["home", "work", "errand"];

/// Initialize tracing subscriber
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}

#[derive(Debug, Clone, Serialize)]
struct Todo {
    id: u64,
    owner: String,
    title: String,
    tags: Vec<String>,
    due: Option<String>,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct CreateTodo {
    title: String,
    #[serde(default)]
    tags: Vec<String>,
    due: Option<String>,
}

fn date_regex() -> Option<&'static Regex> {
    static DATE: OnceLock<Option<Regex>> = OnceLock::new();
    DATE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").ok())
        .as_ref()
}

impl Validatable for CreateTodo {
    fn validate(&self) -> Result<(), ValidationError> {
        Validator::new()
            .require_not_empty(&self.title, "title is required")
            .require_max_length(&self.title, 200, "title must be shorter than 200 bytes")
            .require_slice_enum(&self.tags, "tags must be one of home, work, errand", TAGS)
            .check(|v| {
                if let (Some(due), Some(date)) = (&self.due, date_regex()) {
                    v.require_matches_regex(due, date, "due must be YYYY-MM-DD");
                }
            })
            .validate()
    }
}

#[derive(Default)]
struct Store {
    todos: RwLock<BTreeMap<u64, Todo>>,
    next_id: AtomicU64,
}

/// Puts the caller's name under `"user"` or rejects the request
async fn require_user(ctx: Context) {
    let user = ctx
        .header("X-User")
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    match user {
        Some(user) => {
            ctx.set("user", user);
            ctx.next().await;
        }
        None => ctx.abort_with_error(StatusCode::UNAUTHORIZED, "missing X-User header"),
    }
}

async fn list_todos(store: Arc<Store>, ctx: Context) {
    let (done, limit) = match (ctx.bool_query("done"), ctx.default_int_query("limit", 50)) {
        (Ok(done), Ok(limit)) => (done, limit),
        (Err(err), _) | (_, Err(err)) => {
            ctx.respond_bad_request_error(err);
            return;
        }
    };
    let Some(user) = ctx.must_get::<String>("user") else {
        return;
    };

    let todos = store.todos.read().await;
    let items: Vec<&Todo> = todos
        .values()
        .filter(|t| t.owner == user)
        .filter(|t| done.map_or(true, |d| t.done == d))
        .take(usize::try_from(limit).unwrap_or(0))
        .collect();
    ctx.respond_ok(&items);
}

async fn create_todo(store: Arc<Store>, ctx: Context) {
    let Ok(input) = ctx.must_bind_json::<CreateTodo>() else {
        return;
    };
    let Some(user) = ctx.must_get::<String>("user") else {
        return;
    };

    let id = store.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let todo = Todo {
        id,
        owner: user,
        title: input.title,
        tags: input.tags,
        due: input.due,
        done: false,
    };
    store.todos.write().await.insert(id, todo.clone());
    info!(id, "Todo created");
    ctx.respond_created(&todo);
}

async fn show_todo(store: Arc<Store>, ctx: Context) -> anyhow::Result<()> {
    let id: u64 = ctx.param_as("id")?;
    let todos = store.todos.read().await;
    let todo = todos
        .get(&id)
        .ok_or_else(|| ResponseStatusError::not_found(format!("todo {id} not found")))?;
    ctx.respond_ok(todo);
    Ok(())
}

async fn complete_todo(store: Arc<Store>, ctx: Context) -> anyhow::Result<()> {
    let id: u64 = ctx.param_as("id")?;
    let user: String = ctx.get("user").unwrap_or_default();
    let mut todos = store.todos.write().await;
    let todo = todos
        .get_mut(&id)
        .ok_or_else(|| ResponseStatusError::not_found(format!("todo {id} not found")))?;
    if todo.owner != user {
        return Err(ResponseStatusError::forbidden("not your todo").into());
    }
    if todo.done {
        return Err(ResponseStatusError::conflict("todo already done").into());
    }
    todo.done = true;
    ctx.respond_ok(&*todo);
    Ok(())
}

async fn delete_todo(store: Arc<Store>, ctx: Context) -> anyhow::Result<()> {
    let id: u64 = ctx.param_as("id")?;
    let user: String = ctx.get("user").unwrap_or_default();
    let mut todos = store.todos.write().await;
    let todo = todos
        .get(&id)
        .ok_or_else(|| ResponseStatusError::not_found(format!("todo {id} not found")))?;
    if todo.owner != user {
        return Err(ResponseStatusError::forbidden("not your todo").into());
    }
    todos.remove(&id);
    info!(id, "Todo deleted");
    ctx.respond_no_content();
    Ok(())
}

/// Server-sent countdown, `?from=N`
async fn countdown(ctx: Context) {
    let from = match ctx.default_int_query("from", 5) {
        Ok(from) => from,
        Err(err) => {
            ctx.respond_bad_request_error(err);
            return;
        }
    };
    ctx.set_content_type("text/event-stream");

    let mut remaining = from;
    let gone = ctx
        .stream(|chunk| {
            chunk.extend_from_slice(format!("event:tick\ndata:{remaining}\n\n").as_bytes());
            remaining -= 1;
            remaining >= 0
        })
        .await;
    if gone {
        info!("Client left before the countdown finished");
    }
}

fn build_engine(store: &Arc<Store>) -> Engine {
    let mut engine = Engine::default();
    engine.no_route(vec![(|ctx: Context| async move {
        let path = ctx.path().to_string();
        ctx.respond_not_found_error(format!("no route for {path}"));
    })
    .boxed()]);

    engine.get("/ping", |ctx: Context| async move {
        ctx.string(StatusCode::OK, "pong");
    });
    engine.get("/events/countdown", countdown);

    let todos = engine.group("/api/todos", vec![require_user.boxed()]);
    let s = store.clone();
    todos.get("", move |ctx: Context| list_todos(s.clone(), ctx));
    let s = store.clone();
    todos.post("", move |ctx: Context| create_todo(s.clone(), ctx));
    let s = store.clone();
    todos.get("/:id", fallible(move |ctx: Context| show_todo(s.clone(), ctx)));
    let s = store.clone();
    todos.put("/:id/done", fallible(move |ctx: Context| complete_todo(s.clone(), ctx)));
    let s = store.clone();
    todos.delete("/:id", fallible(move |ctx: Context| delete_todo(s.clone(), ctx)));

    engine.expand_methods();
    engine
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let store = Arc::new(Store::default());
    let engine = build_engine(&store);
    engine.serve(ServerConfig::from_env()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use jug_core::App;

    async fn call(app: &App, method: &str, uri: &str, body: &'static str) -> (StatusCode, String) {
        call_as(app, "ada", method, uri, body).await
    }

    async fn call_as(
        app: &App,
        user: &str,
        method: &str,
        uri: &str,
        body: &'static str,
    ) -> (StatusCode, String) {
        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("X-User", user)
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap();
        let response = app.handle(req, None).await;
        let status = response.status();
        let body = response.into_body().into_bytes().await;
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn app() -> App {
        build_engine(&Arc::new(Store::default())).build().unwrap()
    }

    #[tokio::test]
    async fn test_todo_lifecycle() {
        let app = app();

        let (status, body) = call(
            &app,
            "POST",
            "/api/todos",
            r#"{"title":"buy milk","tags":["errand"],"due":"2026-11-01"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body.contains(r#""id":1"#));

        let (status, body) = call(&app, "GET", "/api/todos?done=false", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("buy milk"));

        assert_eq!(call(&app, "PUT", "/api/todos/1/done", "").await.0, StatusCode::OK);
        assert_eq!(
            call(&app, "PUT", "/api/todos/1/done", "").await.0,
            StatusCode::CONFLICT
        );
        assert_eq!(call(&app, "DELETE", "/api/todos/1", "").await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&app, "GET", "/api/todos/1", "").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_only_owner_changes_todo() {
        let app = app();
        let (status, _) = call(&app, "POST", "/api/todos", r#"{"title":"call mum"}"#).await;
        assert_eq!(status, StatusCode::CREATED);

        assert_eq!(
            call_as(&app, "grace", "DELETE", "/api/todos/1", "").await.0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            call_as(&app, "grace", "PUT", "/api/todos/1/done", "").await.0,
            StatusCode::FORBIDDEN
        );
        assert_eq!(call(&app, "GET", "/api/todos/1", "").await.0, StatusCode::OK);
        assert_eq!(call(&app, "DELETE", "/api/todos/1", "").await.0, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_validation_messages_are_joined() {
        let (status, body) = call(
            &app(),
            "POST",
            "/api/todos",
            r#"{"title":"","tags":["gym"],"due":"soon"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            r#"{"error":"title is required, tags must be one of home, work, errand, due must be YYYY-MM-DD"}"#
        );
    }

    #[tokio::test]
    async fn test_missing_user_and_bad_query() {
        let app = app();
        let req = hyper::Request::builder()
            .uri("/api/todos")
            .body(Bytes::new())
            .unwrap();
        assert_eq!(app.handle(req, None).await.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(
            call(&app, "GET", "/api/todos?limit=lots", "").await.0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_expanded_methods_and_fallback() {
        let app = app();
        assert_eq!(
            call(&app, "PATCH", "/api/todos/1", "").await.0,
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(call(&app, "POST", "/ping", "").await.0, StatusCode::METHOD_NOT_ALLOWED);

        let (status, body) = call(&app, "GET", "/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, r#"{"error":"no route for /nope"}"#);
    }

    #[tokio::test]
    async fn test_countdown_stream() {
        let (status, body) = call(&app(), "GET", "/events/countdown?from=2", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "event:tick\ndata:2\n\nevent:tick\ndata:1\n\nevent:tick\ndata:0\n\n"
        );
    }
}
