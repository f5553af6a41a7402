//! JSON-over-HTTP surface.
//!
//! Every failure body has the shape `{"Erro": "<message>"}`. Business-rule
//! rejections from booking map to 400 (bad request data) or 401 (caller not
//! allowed), unknown ids to 404, and storage trouble to 500.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, FromRef, MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::auth::{Caller, SessionResolver};
use crate::booking::{AppointmentBook, BookingError};
use crate::clock::Clock;
use crate::directory::UserDirectory;
use crate::limits::{FIRST_PAGE, MAX_BODY_BYTES};
use crate::model::{Appointment, Avatar, Notification, Role};
use crate::notifications::{NotificationDispatcher, NotificationError};
use crate::observability;

/// Shared handles every handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub book: Arc<AppointmentBook>,
    pub notifications: Arc<NotificationDispatcher>,
    pub directory: Arc<dyn UserDirectory>,
    pub sessions: Arc<dyn SessionResolver>,
    pub clock: Arc<dyn Clock>,
}

impl FromRef<AppState> for Arc<dyn SessionResolver> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route("/appointments/{id}", delete(cancel_appointment))
        .route("/notifications", get(list_notifications))
        .route("/notifications/stream", get(stream_notifications))
        .route("/notifications/{id}", put(mark_notification_read))
        .route("/health", get(health))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().clone();
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(elapsed.as_secs_f64());
    metrics::counter!(
        observability::REQUESTS_TOTAL,
        "route" => route.clone(),
        "status" => observability::status_label(status)
    )
    .increment(1);
    debug!("{method} {route} -> {status} in {elapsed:?}");
    response
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
    #[error("Only provider can load notifications")]
    ProviderOnly,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Booking(e) => match e {
                BookingError::Validation
                | BookingError::PastDate
                | BookingError::OutsideBusinessHours { .. }
                | BookingError::SlotTaken => StatusCode::BAD_REQUEST,
                BookingError::InvalidRole(_)
                | BookingError::Forbidden
                | BookingError::CancellationWindowExpired
                | BookingError::AlreadyCanceled => StatusCode::UNAUTHORIZED,
                BookingError::NotFound(_) => StatusCode::NOT_FOUND,
                BookingError::NotificationFailed(_) | BookingError::Storage(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Notification(e) => match e {
                NotificationError::NotFound(_) => StatusCode::NOT_FOUND,
                NotificationError::EmptyContent | NotificationError::ContentTooLong => {
                    StatusCode::BAD_REQUEST
                }
                NotificationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::ProviderOnly => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!("request failed: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "Erro": message }))).into_response()
    }
}

fn validation(_: impl std::fmt::Display) -> ApiError {
    ApiError::Booking(BookingError::Validation)
}

// ── Views ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProviderView {
    pub id: Ulid,
    pub name: String,
    pub avatar: Option<Avatar>,
}

/// Listing row: `{id, date, past, cancelable, provider:{id, name, avatar}}`.
#[derive(Debug, Serialize)]
pub struct AppointmentView {
    pub id: Ulid,
    pub date: String,
    pub past: bool,
    pub cancelable: bool,
    pub provider: ProviderView,
}

/// Full appointment record as returned by create and cancel.
#[derive(Debug, Serialize)]
pub struct AppointmentBody {
    pub id: Ulid,
    pub user_id: Ulid,
    pub provider_id: Ulid,
    pub date: String,
    pub canceled_at: Option<String>,
    pub created_at: String,
    pub past: bool,
    pub cancelable: bool,
}

impl AppState {
    fn appointment_body(&self, a: &Appointment) -> AppointmentBody {
        let calendar = &self.book.policy().calendar;
        let now = self.clock.now_ms();
        AppointmentBody {
            id: a.id,
            user_id: a.requester_id,
            provider_id: a.provider_id,
            date: calendar.to_rfc3339(a.date),
            canceled_at: a.canceled_at.map(|t| calendar.to_rfc3339(t)),
            created_at: calendar.to_rfc3339(a.created_at),
            past: a.past(now),
            cancelable: a.cancelable(now),
        }
    }

    async fn require_provider(&self, caller: Caller) -> Result<(), ApiError> {
        match self.directory.find(&caller.0).await {
            Some(user) if user.role() == Role::Provider => Ok(()),
            _ => Err(ApiError::ProviderOnly),
        }
    }
}

// ── Handlers ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointment {
    pub provider_id: Ulid,
    pub date: String,
}

async fn list_appointments(
    State(state): State<AppState>,
    caller: Caller,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<AppointmentView>>, ApiError> {
    let Query(query) = query.map_err(validation)?;
    let page = query.page.unwrap_or(FIRST_PAGE);
    let calendar = &state.book.policy().calendar;
    let now = state.clock.now_ms();

    let mut views = Vec::new();
    for a in state.book.list_for_requester(&caller.0, page) {
        let provider = state.directory.find(&a.provider_id).await;
        views.push(AppointmentView {
            id: a.id,
            date: calendar.to_rfc3339(a.date),
            past: a.past(now),
            cancelable: a.cancelable(now),
            provider: ProviderView {
                id: a.provider_id,
                name: provider.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
                avatar: provider.and_then(|p| p.avatar),
            },
        });
    }
    Ok(Json(views))
}

async fn create_appointment(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<CreateAppointment>, JsonRejection>,
) -> Result<Json<AppointmentBody>, ApiError> {
    let Json(body) = body.map_err(validation)?;
    let date = state
        .book
        .policy()
        .calendar
        .parse(&body.date)
        .ok_or(BookingError::Validation)?;
    let appointment = state.book.create(caller.0, body.provider_id, date).await?;
    Ok(Json(state.appointment_body(&appointment)))
}

async fn cancel_appointment(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<AppointmentBody>, ApiError> {
    let Path(id) = id.map_err(validation)?;
    let appointment = state.book.cancel(id, caller.0).await?;
    Ok(Json(state.appointment_body(&appointment)))
}

async fn list_notifications(
    State(state): State<AppState>,
    caller: Caller,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    state.require_provider(caller).await?;
    let Query(query) = query.map_err(validation)?;
    Ok(Json(
        state
            .notifications
            .list_for_recipient(&caller.0, query.page.unwrap_or(FIRST_PAGE)),
    ))
}

/// Only the recipient may mark a notification read; anyone else gets 404.
async fn mark_notification_read(
    State(state): State<AppState>,
    caller: Caller,
    id: Result<Path<Ulid>, PathRejection>,
) -> Result<Json<Notification>, ApiError> {
    let Path(id) = id.map_err(validation)?;
    match state.notifications.get(&id) {
        Some(n) if n.recipient_id == caller.0 => {}
        _ => return Err(NotificationError::NotFound(id).into()),
    }
    Ok(Json(state.notifications.mark_read(id).await?))
}

/// Server-sent events: one `notification` event per notification created for the caller.
async fn stream_notifications(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    state.require_provider(caller).await?;
    let rx = state.notifications.subscribe(caller.0);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    match SseEvent::default().event("notification").json_data(&notification) {
                        Ok(event) => return Some((Ok(event), rx)),
                        Err(e) => warn!("notification {} not encodable: {e}", notification.id),
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("subscriber lagged, {skipped} notification(s) dropped"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
