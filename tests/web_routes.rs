#![cfg(feature = "web")]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use chrono::NaiveDate;
use salesboard::app::{AppState, build_router};
use salesboard::config::AppConfig;
use salesboard::login::Role;
use salesboard::uploads::UploadStore;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const HEADER: &str =
    "Sales Owner,Team,Practice,Function,Sales Stage,Amount,Probability,Expected Close Date";

struct Harness {
    _dir: TempDir,
    state: Arc<AppState>,
    app: Router,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().to_string_lossy().to_string();
    let config = AppConfig::from_lookup(|key| match key {
        "DATA_DIR" => Some(data_dir.clone()),
        "ADMIN_USERNAME" => Some("admin".into()),
        "ADMIN_PASSWORD" => Some("s3cret".into()),
        _ => None,
    })
    .unwrap();

    let uploads = UploadStore::new(&config.uploads_dir);
    let previous = format!("{HEADER}\nAnn,East,Cloud,Sales,Commit,100,50%,2024-03-01\n");
    let current = format!(
        "{HEADER}\nAnn,East,Cloud,Sales,Commit,150,50%,2024-03-08\nBob,West,Data,Sales,Closed Won,80,100%,2024-03-08\n"
    );
    uploads
        .save("pipeline.csv", previous.as_bytes(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        .unwrap();
    uploads
        .save("pipeline.csv", current.as_bytes(), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap())
        .unwrap();

    let state = Arc::new(AppState::new(config).unwrap());
    state
        .auth
        .store()
        .upsert("viewer", "look-only", Role::Viewer)
        .unwrap();
    let app = build_router(state.clone());
    Harness {
        _dir: dir,
        state,
        app,
    }
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

fn login_request(username: &str, password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/login")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("username={username}&password={password}")))
        .unwrap()
}

/// Logs in and returns the `session=...` cookie pair
async fn login(app: &Router, username: &str, password: &str) -> String {
    let response = send(app, login_request(username, password)).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.contains("HttpOnly"));
    cookie.split(';').next().unwrap().to_string()
}

fn get(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

fn multipart_upload(cookie: &str, file_name: &str, contents: &str, date: &str) -> Request<Body> {
    let boundary = "salesboardboundary";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"date\"\r\n\r\n{date}\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
         Content-Type: text/csv\r\n\r\n{contents}\r\n--{boundary}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/uploads")
        .header(header::COOKIE, cookie)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let h = harness();
    let response = send(
        &h.app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("\"dataset_loaded\":true"), "{body}");
}

#[tokio::test]
async fn pages_redirect_without_session() {
    let h = harness();
    for uri in ["/", "/pivot", "/api/pivot", "/export/pivot.csv", "/uploads"] {
        let response = send(&h.app, get(uri, "session=not-a-session")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{uri}");
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/login");
    }
}

#[tokio::test]
async fn fourth_attempt_is_locked_out() {
    let h = harness();

    let first = send(&h.app, login_request("admin", "wrong")).await;
    assert_eq!(first.status(), StatusCode::UNAUTHORIZED);
    assert!(body_text(first).await.contains("2 attempt(s) left"));
    let second = send(&h.app, login_request("admin", "wrong")).await;
    assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
    let third = send(&h.app, login_request("admin", "wrong")).await;
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

    // Right password, still inside the cooldown
    let fourth = send(&h.app, login_request("admin", "s3cret")).await;
    assert_eq!(fourth.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(fourth.headers().get(header::SET_COOKIE).is_none());
    assert!(body_text(fourth).await.contains("Too many failed attempts"));
}

#[tokio::test]
async fn dashboard_pivot_and_exports() {
    let h = harness();
    let cookie = login(&h.app, "admin", "s3cret").await;

    let dashboard = send(&h.app, get("/", &cookie)).await;
    assert_eq!(dashboard.status(), StatusCode::OK);
    let html = body_text(dashboard).await;
    assert!(html.contains("Bob"));
    assert!(html.contains("+50"));

    let api = send(&h.app, get("/api/pivot?keys=owner&metric=committed", &cookie)).await;
    assert_eq!(api.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_text(api).await).unwrap();
    assert_eq!(json["rows"][0]["key"][0], "Ann");
    assert_eq!(json["rows"][0]["current"]["committed"], 150.0);
    assert_eq!(json["rows"][0]["previous"]["committed"], 100.0);
    assert_eq!(json["total"]["current"]["closed_won"], 80.0);

    let csv = send(&h.app, get("/export/pivot.csv?keys=team", &cookie)).await;
    assert_eq!(csv.status(), StatusCode::OK);
    assert!(
        csv.headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("attachment")
    );
    let text = body_text(csv).await;
    assert!(text.starts_with("Team,Committed (Current)"), "{text}");
    assert!(text.lines().last().unwrap().starts_with("Total,"));

    let xlsx = send(&h.app, get("/export/pivot.xlsx", &cookie)).await;
    assert_eq!(xlsx.status(), StatusCode::OK);

    let bad = send(&h.app, get("/api/pivot?keys=region", &cookie)).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn viewers_cannot_upload() {
    let h = harness();
    let cookie = login(&h.app, "viewer", "look-only").await;

    let page = send(&h.app, get("/uploads", &cookie)).await;
    assert_eq!(page.status(), StatusCode::OK);
    assert!(!body_text(page).await.contains("multipart/form-data"));

    let contents = format!("{HEADER}\nCid,East,Cloud,Sales,Upside,5,10%,\n");
    let response = send(
        &h.app,
        multipart_upload(&cookie, "week.csv", &contents, "2024-03-15"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.state.uploads.list().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_upload_becomes_current_period() {
    let h = harness();
    let cookie = login(&h.app, "admin", "s3cret").await;

    let contents = format!("{HEADER}\nCid,East,Cloud,Sales,Upside,5,10%,\n");
    let response = send(
        &h.app,
        multipart_upload(&cookie, "week.csv", &contents, "2024-03-15"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.starts_with("/uploads?notice="), "{location}");

    let current = h
        .state
        .with_dataset(|d| d.map(|d| d.current.upload.file_name.clone()));
    assert_eq!(current.as_deref(), Some("2024-03-15_week.csv"));
    let previous = h.state.with_dataset(|d| {
        d.and_then(|d| d.previous.as_ref().map(|p| p.upload.file_name.clone()))
    });
    assert_eq!(previous.as_deref(), Some("2024-03-08_pipeline.csv"));

    // A file with missing columns is rejected and nothing is stored
    let response = send(
        &h.app,
        multipart_upload(&cookie, "broken.csv", "Owner,Amount\nAnn,1\n", "2024-03-22"),
    )
    .await;
    let location = response.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.starts_with("/uploads?error="), "{location}");
    assert_eq!(h.state.uploads.list().unwrap().len(), 3);
}

fn select_request(cookie: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/uploads/select")
        .header(header::COOKIE, cookie)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn selection_without_previous_field_uses_auto() {
    let h = harness();
    let cookie = login(&h.app, "admin", "s3cret").await;

    // Only the Current column was touched
    let response = send(&h.app, select_request(&cookie, "current=2024-03-01_pipeline.csv")).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.starts_with("/uploads?notice="), "{location}");
    let selection = h.state.with_dataset(|d| d.map(|d| d.selection())).unwrap();
    assert_eq!(selection.current.as_deref(), Some("2024-03-01_pipeline.csv"));
    assert_eq!(selection.previous, None);

    // No comparison, then the page offers "auto" pre-checked
    let response = send(
        &h.app,
        select_request(&cookie, "current=2024-03-08_pipeline.csv&previous="),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(h.state.with_dataset(|d| d.unwrap().previous.is_none()));
    let page = body_text(send(&h.app, get("/uploads", &cookie)).await).await;
    assert!(page.contains(r#"value="auto" checked"#), "{page}");
}

#[tokio::test]
async fn logout_ends_the_session() {
    let h = harness();
    let cookie = login(&h.app, "admin", "s3cret").await;

    let response = send(
        &h.app,
        Request::builder()
            .method("POST")
            .uri("/logout")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let after = send(&h.app, get("/", &cookie)).await;
    assert_eq!(after.status(), StatusCode::SEE_OTHER);
}
