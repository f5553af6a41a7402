use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use ulid::Ulid;

use slotbook::auth::StaticSessions;
use slotbook::booking::{AppointmentBook, BookDeps, BookingPolicy};
use slotbook::clock::ManualClock;
use slotbook::directory::InMemoryDirectory;
use slotbook::http::{router, AppState};
use slotbook::mail::{CancellationMail, LogMailer};
use slotbook::model::{Avatar, UserProfile};
use slotbook::notifications::NotificationDispatcher;
use slotbook::queue::{JobQueue, QueueOptions};

const H: i64 = 3_600_000;
// 2026-03-05T00:00:00Z
const DAY: i64 = 1_772_668_800_000;

// ── Test infrastructure ──────────────────────────────────────

struct TestApp {
    app: Router,
    clock: Arc<ManualClock>,
    queue: JobQueue,
    bia: UserProfile,
}

const ANA: &str = "token-ana";
const CAIO: &str = "token-caio";
const BIA: &str = "token-bia";

fn profile(name: &str, provider: bool) -> UserProfile {
    UserProfile {
        id: Ulid::new(),
        name: name.into(),
        email: format!("{}@example.com", name.to_lowercase()),
        provider,
        avatar: None,
    }
}

fn start_test_app() -> TestApp {
    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let clock = Arc::new(ManualClock::new(DAY + 8 * H));
    let directory = Arc::new(InMemoryDirectory::new());
    let sessions = StaticSessions::new();

    let ana = profile("Ana", false);
    let caio = profile("Caio", false);
    let mut bia = profile("Bia", true);
    bia.avatar = Some(Avatar {
        id: Ulid::new(),
        path: "bia.png".into(),
        url: "http://localhost:3333/files/bia.png".into(),
    });
    for (token, user) in [(ANA, &ana), (CAIO, &caio), (BIA, &bia)] {
        directory.insert(user.clone());
        sessions.insert(token, user.id);
    }

    let notifications =
        Arc::new(NotificationDispatcher::open(&dir.join("notifications.wal"), clock.clone()).unwrap());
    let policy = BookingPolicy::default();
    let queue = JobQueue::builder(&dir, QueueOptions::default())
        .register(CancellationMail::new(Arc::new(LogMailer), policy.calendar))
        .build()
        .unwrap();
    let book = Arc::new(
        AppointmentBook::open(
            &dir.join("appointments.wal"),
            BookDeps {
                directory: directory.clone(),
                notifier: notifications.clone(),
                queue: queue.clone(),
                clock: clock.clone(),
                policy,
            },
        )
        .unwrap(),
    );

    let app = router(AppState {
        book,
        notifications,
        directory,
        sessions: Arc::new(sessions),
        clock: clock.clone(),
    });
    TestApp { app, clock, queue, bia }
}

async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

impl TestApp {
    async fn book(&self, token: &str, date: &str) -> (StatusCode, Value) {
        send(
            &self.app,
            Method::POST,
            "/appointments",
            Some(token),
            Some(json!({ "provider_id": self.bia.id.to_string(), "date": date })),
        )
        .await
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_public() {
    let t = start_test_app();
    let (status, body) = send(&t.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn anonymous_requests_rejected() {
    let t = start_test_app();
    let (status, body) = send(&t.app, Method::GET, "/appointments", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "Erro": "Token not provided" }));

    let (status, body) = send(&t.app, Method::GET, "/appointments", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "Erro": "Token invalid" }));
}

#[tokio::test]
async fn book_list_and_cancel() {
    let t = start_test_app();

    let (status, created) = t.book(ANA, "2026-03-05T14:30:00Z").await;
    assert_eq!(status, StatusCode::OK, "{created}");
    assert_eq!(created["date"], "2026-03-05T14:00:00.000+00:00");
    assert_eq!(created["provider_id"], t.bia.id.to_string());
    assert_eq!(created["canceled_at"], Value::Null);
    assert_eq!(created["cancelable"], true);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, list) = send(&t.app, Method::GET, "/appointments?page=1", Some(ANA), None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = list.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], id.as_str());
    assert_eq!(rows[0]["past"], false);
    assert_eq!(rows[0]["provider"]["name"], "Bia");
    assert_eq!(rows[0]["provider"]["avatar"]["path"], "bia.png");

    let uri = format!("/appointments/{id}");
    let (status, body) = send(&t.app, Method::DELETE, &uri, Some(CAIO), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["Erro"], "You don't have permission to cancel this appointment!");

    let (status, canceled) = send(&t.app, Method::DELETE, &uri, Some(ANA), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["canceled_at"], "2026-03-05T08:00:00.000+00:00");
    assert_eq!(t.queue.unfinished("CancellationMail").len(), 1);

    let (status, body) = send(&t.app, Method::DELETE, &uri, Some(ANA), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["Erro"], "This appointment has already been canceled");

    let (_, list) = send(&t.app, Method::GET, "/appointments", Some(ANA), None).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn booking_rejections_map_to_status_codes() {
    let t = start_test_app();

    let (status, body) = t.book(ANA, "2026-03-05T07:00:00Z").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Erro"], "Past dates are not permitted!");

    let (status, body) = t.book(ANA, "2026-03-05T21:00:00Z").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Erro"], "Choose an appointment time between 08:00 and 20:00");

    assert_eq!(t.book(ANA, "2026-03-05T10:00:00Z").await.0, StatusCode::OK);
    let (status, body) = t.book(CAIO, "2026-03-05T10:15:00Z").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Erro"], "Appointment date is not available!");

    let (status, body) = t.book(BIA, "2026-03-05T11:00:00Z").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["Erro"], "Only User can create appointments");
}

#[tokio::test]
async fn malformed_bodies_fail_validation() {
    let t = start_test_app();
    let bad = [
        json!({ "provider_id": "42", "date": "2026-03-05T14:00:00Z" }),
        json!({ "provider_id": t.bia.id.to_string(), "date": "tomorrow" }),
        json!({ "date": "2026-03-05T14:00:00Z" }),
    ];
    for body in bad {
        let (status, resp) = send(&t.app, Method::POST, "/appointments", Some(ANA), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp, json!({ "Erro": "validation fails!" }));
    }
}

#[tokio::test]
async fn cancel_unknown_or_too_late() {
    let t = start_test_app();
    let uri = format!("/appointments/{}", Ulid::new());
    let (status, _) = send(&t.app, Method::DELETE, &uri, Some(ANA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = t.book(ANA, "2026-03-05T12:00:00Z").await;
    t.clock.set(DAY + 10 * H + 1);
    let uri = format!("/appointments/{}", created["id"].as_str().unwrap());
    let (status, body) = send(&t.app, Method::DELETE, &uri, Some(ANA), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["Erro"], "You can only cancel appointments 2 hours in advance.");
}

#[tokio::test]
async fn provider_reads_and_marks_notifications() {
    let t = start_test_app();
    t.book(ANA, "2026-03-05T14:00:00Z").await;

    let (status, body) = send(&t.app, Method::GET, "/notifications", Some(ANA), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["Erro"], "Only provider can load notifications");

    let (status, list) = send(&t.app, Method::GET, "/notifications", Some(BIA), None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = list.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["content"], "Novo agendamento de Ana para dia 05 de março, às 14:00h");
    assert_eq!(rows[0]["read"], false);

    let uri = format!("/notifications/{}", rows[0]["id"].as_str().unwrap());
    let (status, _) = send(&t.app, Method::PUT, &uri, Some(ANA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, updated) = send(&t.app, Method::PUT, &uri, Some(BIA), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["read"], true);

    let uri = format!("/notifications/{}", Ulid::new());
    let (status, _) = send(&t.app, Method::PUT, &uri, Some(BIA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn notification_stream_is_provider_only() {
    let t = start_test_app();
    let (status, body) = send(&t.app, Method::GET, "/notifications/stream", Some(ANA), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "Erro": "Only provider can load notifications" }));

    let (status, _) = send(&t.app, Method::GET, "/notifications/stream", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn notification_stream_delivers_new_bookings() {
    let t = start_test_app();
    let req = Request::builder()
        .method(Method::GET)
        .uri("/notifications/stream")
        .header(header::AUTHORIZATION, format!("Bearer {BIA}"))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    // Subscribed before the booking exists.
    let (status, _) = t.book(ANA, "2026-03-05T14:00:00Z").await;
    assert_eq!(status, StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut frame = String::new();
    while !frame.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .unwrap();
        frame.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    assert!(frame.starts_with("event: notification\n"), "{frame}");
    let data = frame
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("data line");
    let notification: Value = serde_json::from_str(data).unwrap();
    assert_eq!(notification["recipient_id"], t.bia.id.to_string());
    assert_eq!(notification["content"], "Novo agendamento de Ana para dia 05 de março, às 14:00h");
    assert_eq!(notification["read"], false);
}
