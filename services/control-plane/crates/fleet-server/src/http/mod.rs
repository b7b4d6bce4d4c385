//! HTTP surface of the control plane.
//!
//! - `/rpc/v1/*`  → agent protocol ([`rpc`])
//! - `/api/v1/*`  → operator endpoints ([`admin`])
//! - `/health`    → liveness probe

pub mod admin;
pub mod error;
pub mod extract;
pub mod rpc;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use fleet_common::routes;

use crate::dispatch::Dispatcher;
use crate::ledger::Ledger;

pub use error::ApiError;

/// State shared by every handler.
#[derive(Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    last_task_nanos: AtomicI64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            last_task_nanos: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        self.dispatcher.ledger()
    }

    /// `task_<unix nanos>`, strictly increasing within the process even when
    /// two creations land in the same nanosecond or the clock steps back.
    pub fn next_task_id(&self) -> String {
        let now = self
            .dispatcher
            .now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        let mut last = self.last_task_nanos.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self.last_task_nanos.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("task_{next}"),
                Err(actual) => last = actual,
            }
        }
    }
}

/// Run `f` on the blocking pool. Ledger writes hold a std lock and may touch
/// the filesystem.
pub(crate) async fn run_blocking<T, E, F>(state: &SharedState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppState) -> Result<T, E> + Send + 'static,
    E: Into<ApiError> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?
        .map_err(Into::into)
}

/// Build the full router over `state`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(routes::REGISTER, post(rpc::register))
        .route(routes::HEARTBEAT, post(rpc::heartbeat))
        .route(routes::GET_TASK, post(rpc::get_task))
        .route(routes::SUBMIT_RESULT, post(rpc::submit_result))
        .route(routes::HEALTH, get(admin::health))
        .route(routes::AGENTS, get(admin::list_agents))
        .route(
            routes::AGENT,
            get(admin::get_agent).delete(admin::delete_agent),
        )
        .route(
            routes::TASKS,
            get(admin::list_tasks).post(admin::create_task),
        )
        .route(routes::TASK, get(admin::get_task).delete(admin::delete_task))
        .route(routes::STATUS, get(admin::status))
        .route(routes::DEBUG, get(admin::debug))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod test_support {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    use crate::clock::ManualClock;

    pub fn state() -> (SharedState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let dispatcher = Dispatcher::new(Arc::new(Ledger::in_memory())).with_clock(clock.clone());
        (Arc::new(AppState::new(dispatcher)), clock)
    }

    pub async fn send(
        state: &SharedState,
        method: &str,
        uri: &str,
        body: Option<&impl Serialize>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn get(state: &SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        send(state, "GET", uri, None::<&()>).await
    }

    pub async fn delete(state: &SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        send(state, "DELETE", uri, None::<&()>).await
    }

    pub async fn post_as<T: DeserializeOwned>(
        state: &SharedState,
        uri: &str,
        body: &impl Serialize,
    ) -> T {
        let (status, json) = send(state, "POST", uri, Some(body)).await;
        assert!(status.is_success(), "{uri} returned {status}: {json}");
        serde_json::from_value(json).unwrap()
    }
}
