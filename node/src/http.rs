use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::warn;

use envmon_common::{
    pages::{portal_page, reset_page, status_page, submitted_page, CAPTIVE_PROBE_PATHS},
    portal::Responder,
    CredentialForm, PortalHandle, PortalRequest, ProvisioningError,
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The scheduler is rebuilt on every restart, so the handle lives in a slot
/// the node loop refills.
pub type PortalSlot = Arc<Mutex<Option<PortalHandle>>>;

#[derive(Clone)]
pub struct AppState {
    portal: PortalSlot,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    format: Option<String>,
}

pub fn router(portal: PortalSlot) -> Router {
    let mut app = Router::new()
        .route("/", get(handle_root))
        .route("/scan", get(handle_scan))
        .route("/configure", post(handle_configure))
        .route("/status", get(handle_status))
        .route("/reset", post(handle_reset));

    for path in CAPTIVE_PROBE_PATHS {
        app = app.route(path, get(handle_root));
    }

    app.layer(TraceLayer::new_for_http())
        .with_state(AppState { portal })
}

async fn handle_root(State(state): State<AppState>) -> Response {
    match ask(&state, PortalRequest::PortalPage).await {
        Ok(Some(networks)) => Html(portal_page(&networks)).into_response(),
        Ok(None) => match ask(&state, PortalRequest::Status).await {
            Ok(status) => Html(status_page(&status)).into_response(),
            Err(response) => response,
        },
        Err(response) => response,
    }
}

async fn handle_scan(State(state): State<AppState>) -> Response {
    match ask(&state, PortalRequest::ListNetworks).await {
        Ok(Ok(networks)) => Json(networks).into_response(),
        Ok(Err(err)) => provisioning_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_configure(
    State(state): State<AppState>,
    Form(form): Form<CredentialForm>,
) -> Response {
    let reply = ask(&state, |respond| PortalRequest::SubmitCredentials { form, respond }).await;
    match reply {
        Ok(Ok(ssid)) => Html(submitted_page(&ssid)).into_response(),
        Ok(Err(err)) => provisioning_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Response {
    match ask(&state, PortalRequest::Status).await {
        Ok(status) if wants_json(&headers, &query) => Json(status).into_response(),
        Ok(status) => Html(status_page(&status)).into_response(),
        Err(response) => response,
    }
}

async fn handle_reset(State(state): State<AppState>) -> Response {
    match ask(&state, PortalRequest::FactoryReset).await {
        Ok(Ok(())) => Html(reset_page()).into_response(),
        Ok(Err(err)) => provisioning_error_response(&err),
        Err(response) => response,
    }
}

/// Enqueues a request for the scheduler and waits for its answer.
async fn ask<T, F>(state: &AppState, build: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(Responder<T>) -> PortalRequest,
{
    let handle = state
        .portal
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| error_response(StatusCode::SERVICE_UNAVAILABLE, "node is starting"))?;

    let (tx, rx) = oneshot::channel();
    let request = build(Box::new(move |value| {
        let _ = tx.send(value);
    }));
    if !handle.send(request) {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "node is restarting",
        ));
    }

    match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "node is restarting",
        )),
        Err(_) => {
            warn!("portal request timed out");
            Err(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "node did not answer in time",
            ))
        }
    }
}

fn wants_json(headers: &HeaderMap, query: &StatusQuery) -> bool {
    if query
        .format
        .as_deref()
        .is_some_and(|format| format.eq_ignore_ascii_case("json"))
    {
        return true;
    }
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

fn provisioning_status(err: &ProvisioningError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn provisioning_error_response(err: &ProvisioningError) -> Response {
    error_response(provisioning_status(err), &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
