//! HTTP binding of the [`ControlSurface`].
//!
//! | Method  | Path         | Body                  |
//! |---------|--------------|-----------------------|
//! | `GET`   | `/v1/status` |                       |
//! | `PATCH` | `/v1/status` | `{"paused": bool}`    |
//! | `POST`  | `/v1/stop`   | `{"graceful": bool}`  |
//!
//! Every route answers with the current status. Control errors become `400`
//! or `409` responses with an `{"error": "..."}` body.
use std::net::SocketAddr;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    control::{ControlSurface, Status, StatusUpdate},
    error::ControlError,
};

#[derive(Debug)]
pub enum ApiError {
    Control(ControlError),
    BadRequest(String),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self::Control(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Control(err @ ControlError::PauseNotSupported(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            Self::Control(err) => (StatusCode::CONFLICT, err.to_string()),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(default = "graceful_by_default")]
    graceful: bool,
}

fn graceful_by_default() -> bool {
    true
}

impl Default for StopRequest {
    fn default() -> Self {
        Self { graceful: true }
    }
}

/// An empty body means the defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

async fn get_status(State(control): State<ControlSurface>) -> Json<Status> {
    Json(control.get_status())
}

async fn patch_status(
    State(control): State<ControlSurface>,
    body: Bytes,
) -> Result<Json<Status>, ApiError> {
    let update: StatusUpdate = parse_body(&body)?;
    Ok(Json(control.set_status(update)?))
}

async fn post_stop(
    State(control): State<ControlSurface>,
    body: Bytes,
) -> Result<Json<Status>, ApiError> {
    let request: StopRequest = parse_body(&body)?;
    Ok(Json(control.request_stop(request.graceful)))
}

pub fn router(control: ControlSurface) -> Router {
    Router::new()
        .route("/v1/status", get(get_status).patch(patch_status))
        .route("/v1/stop", post(post_stop))
        .with_state(control)
}

/// Serves the control API on `addr` until `shutdown` fires.
pub async fn serve(
    control: ControlSurface,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "control API listening");
    axum::serve(listener, router(control))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::TestOptions,
        executor::{ConstantVus, ExecutorConfig},
        metric::Registry,
        mock::MockVuFactory,
        run::TestRun,
        scenario::Scenario,
        scheduler::RunPhase,
    };

    fn test_run(pausable: bool) -> TestRun {
        let options = TestOptions::default().with_scenario(
            Scenario::builder()
                .name("api")
                .executor(ExecutorConfig::ConstantVus(ConstantVus {
                    vus: 2,
                    duration: Duration::from_secs(30),
                }))
                .pausable(pausable)
                .build(),
        );
        let factory = MockVuFactory::builder()
            .iteration_duration(Duration::from_millis(100))
            .build()
            .unwrap();
        TestRun::new(options, Arc::new(Registry::new()), Arc::new(factory)).unwrap()
    }

    async fn call(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn status_pause_and_stop() {
        let run = test_run(true);
        let control = run.control_surface();
        let app = router(control.clone());
        let handle = tokio::spawn(run.run());
        control.wait_for(RunPhase::Running).await;

        let (code, body) = call(&app, Method::GET, "/v1/status", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["phase"], "running");
        assert_eq!(body["paused"], false);
        assert!(body["thresholdsFailed"].as_array().unwrap().is_empty());

        let (code, body) = call(&app, Method::PATCH, "/v1/status", r#"{"paused": true}"#).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["phase"], "paused");

        let (code, body) = call(&app, Method::PATCH, "/v1/status", r#"{"paused": false}"#).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["paused"], false);

        let (code, _) = call(&app, Method::POST, "/v1/stop", "").await;
        assert_eq!(code, StatusCode::OK);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.summary.phase, RunPhase::Stopped);
        assert_eq!(outcome.exit_code().code(), 105);

        let (code, body) = call(&app, Method::PATCH, "/v1/status", r#"{"paused": true}"#).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_map_to_client_statuses() {
        let run = test_run(false);
        let control = run.control_surface();
        let app = router(control.clone());

        let (code, _) = call(&app, Method::PATCH, "/v1/status", r#"{"paused": true}"#).await;
        assert_eq!(code, StatusCode::CONFLICT, "not running yet");

        let handle = tokio::spawn(run.run());
        control.wait_for(RunPhase::Running).await;

        let (code, body) = call(&app, Method::PATCH, "/v1/status", r#"{"paused": true}"#).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("api"));

        let (code, _) = call(&app, Method::POST, "/v1/stop", "{not json").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = call(&app, Method::POST, "/v1/stop", r#"{"graceful": false}"#).await;
        assert_eq!(code, StatusCode::OK);
        handle.await.unwrap();
    }
}
