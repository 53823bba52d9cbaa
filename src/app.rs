use axum::{
    Extension, Form, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::aggregate::{GroupKey, Metric};
use crate::config::AppConfig;
use crate::dataset::{Dataset, Selection};
use crate::downloader::{pivot_to_csv, pivot_to_xlsx};
use crate::error::{DashboardError, Result};
use crate::graph::{ChartOptions, render_pivot_chart};
use crate::loader::load_bytes;
use crate::login::{
    AuthGate, CredentialStore, Session, SessionStore, handle_login, handle_logout, require_auth,
    serve_login_page,
};
use crate::uploads::UploadStore;
use crate::view::{
    Chrome, DashboardPage, MeetingsPage, PivotPage, TableView, UploadRow, UploadsPage, Views,
    key_options, kpi_cards, metric_options,
};

/// Keys meetings can be grouped by
const MEETING_KEYS: [GroupKey; 3] = [GroupKey::Owner, GroupKey::Team, GroupKey::Week];

/// The loaded dataset and the last load failure, if any
#[derive(Debug, Default)]
struct Loaded {
    dataset: Option<Dataset>,
    error: Option<String>,
}

/// Shared state behind every handler
pub struct AppState {
    pub config: AppConfig,
    pub auth: AuthGate,
    pub sessions: SessionStore,
    pub uploads: UploadStore,
    pub views: Views,
    loaded: RwLock<Loaded>,
}

impl AppState {
    /// Opens the credential store, creates the bootstrap admin and loads
    /// the newest uploads
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = CredentialStore::open(&config.credentials_file)?;
        if let Some(admin) = &config.bootstrap_admin {
            store.ensure_admin(admin)?;
        }
        if store.list().is_empty() {
            log::warn!(
                "no users in {}; add one with salesboard-users or set ADMIN_USERNAME/ADMIN_PASSWORD",
                config.credentials_file.display()
            );
        }

        let state = Self {
            auth: AuthGate::new(store, config.limiter.clone()),
            sessions: SessionStore::new(config.session_ttl),
            uploads: UploadStore::new(&config.uploads_dir),
            views: Views::new()?,
            loaded: RwLock::new(Loaded::default()),
            config,
        };

        // A broken upload must not keep the server from starting
        let _ = state.reload(&Selection::default());
        Ok(state)
    }

    /// Replaces the loaded dataset
    ///
    /// On failure the previous dataset stays loaded and the error is shown
    /// as a warning until the next successful load.
    pub fn reload(&self, selection: &Selection) -> Result<()> {
        let outcome = Dataset::load(&self.uploads, selection);
        let mut loaded = self
            .loaded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome {
            Ok(dataset) => {
                log::info!(
                    "loaded {} sales and {} meeting rows from {}",
                    dataset.current_sales().len(),
                    dataset.current_meetings().len(),
                    dataset.current.upload.file_name
                );
                loaded.dataset = Some(dataset);
                loaded.error = None;
                Ok(())
            }
            Err(DashboardError::NoDataset) => {
                loaded.dataset = None;
                loaded.error = None;
                Ok(())
            }
            Err(e) => {
                log::warn!("failed to load dataset: {}", e);
                loaded.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Runs `f` against the loaded dataset
    pub fn with_dataset<R>(&self, f: impl FnOnce(Option<&Dataset>) -> R) -> R {
        let loaded = self
            .loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(loaded.dataset.as_ref())
    }

    /// Loader warnings plus the last load failure
    pub fn warnings(&self) -> Vec<String> {
        let loaded = self
            .loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut warnings = loaded
            .dataset
            .as_ref()
            .map(Dataset::warnings)
            .unwrap_or_default();
        if let Some(error) = &loaded.error {
            warnings.insert(0, error.clone());
        }
        warnings
    }
}

#[derive(Serialize)]
struct ApiError {
    status: String,
    message: String,
}

fn error_status(e: &DashboardError) -> StatusCode {
    match e {
        DashboardError::NoDataset => StatusCode::NOT_FOUND,
        DashboardError::UnknownKey(_)
        | DashboardError::UnknownMetric(_)
        | DashboardError::UnsupportedFile(_)
        | DashboardError::MissingColumns(_)
        | DashboardError::EmptyDataset(_)
        | DashboardError::Spreadsheet(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: DashboardError) -> Response {
    let status = error_status(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("request failed: {}", e);
    }
    (
        status,
        Json(ApiError {
            status: "error".to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

fn render_page<T: Serialize>(state: &AppState, name: &str, page: &T) -> Response {
    match state.views.render(name, page) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            log::error!("failed to render {}: {}", name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

fn chrome(state: &AppState, title: &str, active: &'static str, session: &Session) -> Chrome {
    let mut chrome = Chrome::new(title, active, session);
    chrome.warnings = state.warnings();
    chrome
}

/// Pivot metrics in column order, with `selected` first when it is not
/// already one of them
fn display_metrics(selected: Metric) -> Vec<Metric> {
    let mut metrics = Metric::PIVOT.to_vec();
    if !metrics.contains(&selected) {
        metrics.insert(0, selected);
    }
    metrics
}

fn keys_param(keys: &[GroupKey]) -> String {
    keys.iter().map(|k| k.slug()).collect::<Vec<_>>().join(",")
}

fn pivot_link(path: &str, keys: &[GroupKey], metric: Metric) -> String {
    format!(
        "{}?keys={}&metric={}",
        path,
        urlencoding::encode(&keys_param(keys)),
        metric.slug()
    )
}

/// Query of the pivot page and its JSON, export and chart endpoints
#[derive(Debug, Default, Deserialize)]
pub struct PivotQuery {
    pub keys: Option<String>,
    pub metric: Option<String>,
}

impl PivotQuery {
    /// Grouping keys and metric, defaulting to owner and total
    pub fn resolve(&self) -> Result<(Vec<GroupKey>, Metric)> {
        let keys = GroupKey::parse_list(self.keys.as_deref().unwrap_or_default())?;
        let metric = match self.metric.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            Some(raw) => raw.parse()?,
            None => Metric::Total,
        };
        Ok((keys, metric))
    }
}

async fn dashboard(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Response {
    let keys = [GroupKey::Owner];
    let chrome = chrome(&state, "Dashboard", "dashboard", &session);
    let page = state.with_dataset(|dataset| {
        let mut page = DashboardPage {
            chrome,
            has_data: dataset.is_some(),
            current_label: None,
            previous_label: None,
            kpis: Vec::new(),
            table: None,
            chart_url: None,
        };
        if let Some(dataset) = dataset {
            let (current, previous) = dataset.kpis();
            page.current_label = Some(dataset.current.label());
            page.previous_label = dataset.previous.as_ref().map(|p| p.label());
            page.kpis = kpi_cards(&current, dataset.previous.as_ref().map(|_| &previous));
            let table = dataset.pivot(&keys);
            if !table.rows.is_empty() {
                page.chart_url = Some(pivot_link("/chart/pivot.png", &keys, Metric::Total));
            }
            page.table = Some(TableView::from_pivot(&table, &Metric::PIVOT));
        }
        page
    });
    render_page(&state, "dashboard", &page)
}

async fn pivot_page(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<PivotQuery>,
) -> Response {
    let mut chrome = chrome(&state, "Pivot", "pivot", &session);
    let (keys, metric) = query.resolve().unwrap_or_else(|e| {
        chrome.warnings.push(e.to_string());
        (vec![GroupKey::Owner], Metric::Total)
    });

    let page = state.with_dataset(|dataset| {
        let table = dataset.map(|d| d.pivot(&keys));
        let has_rows = table.as_ref().is_some_and(|t| !t.rows.is_empty());
        PivotPage {
            chrome,
            has_data: dataset.is_some(),
            keys: keys_param(&keys),
            key_options: key_options(&keys, &GroupKey::ALL),
            metric_options: metric_options(metric),
            table: table
                .as_ref()
                .map(|t| TableView::from_pivot(t, &display_metrics(metric))),
            chart_url: has_rows.then(|| pivot_link("/chart/pivot.png", &keys, metric)),
            csv_url: has_rows.then(|| pivot_link("/export/pivot.csv", &keys, metric)),
            xlsx_url: has_rows.then(|| pivot_link("/export/pivot.xlsx", &keys, metric)),
        }
    });
    render_page(&state, "pivot", &page)
}

#[derive(Debug, Default, Deserialize)]
struct MeetingsQuery {
    keys: Option<String>,
}

async fn meetings_page(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<MeetingsQuery>,
) -> Response {
    let mut chrome = chrome(&state, "Meetings", "meetings", &session);
    let keys = GroupKey::parse_list(query.keys.as_deref().unwrap_or_default()).unwrap_or_else(|e| {
        chrome.warnings.push(e.to_string());
        vec![GroupKey::Owner]
    });

    let table = state.with_dataset(|dataset| match dataset.map(|d| d.meetings(&keys)) {
        Some(Ok(rows)) => Some(TableView::from_meetings(&rows, &keys)),
        Some(Err(e)) => {
            chrome.warnings.push(e.to_string());
            None
        }
        None => None,
    });
    let has_data = state.with_dataset(|dataset| dataset.is_some());

    let page = MeetingsPage {
        chrome,
        has_data,
        keys: keys_param(&keys),
        key_options: key_options(&keys, &MEETING_KEYS),
        table,
    };
    render_page(&state, "meetings", &page)
}

#[derive(Debug, Default, Deserialize)]
struct UploadsQuery {
    notice: Option<String>,
    error: Option<String>,
}

async fn uploads_page(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(query): Query<UploadsQuery>,
) -> Response {
    let mut chrome = chrome(&state, "Uploads", "uploads", &session);
    chrome.notice = query.notice;
    if let Some(error) = query.error {
        chrome.warnings.insert(0, error);
    }

    let uploads = state.uploads.list().unwrap_or_else(|e| {
        chrome.warnings.push(format!("Could not list uploads: {e}"));
        Vec::new()
    });
    let selection = state.with_dataset(|dataset| dataset.map(Dataset::selection).unwrap_or_default());

    let page = UploadsPage {
        chrome,
        uploads: uploads
            .iter()
            .map(|entry| {
                UploadRow::new(
                    entry,
                    selection.current.as_deref(),
                    selection.previous.as_deref(),
                )
            })
            .collect(),
        has_previous: selection.previous.is_some(),
        today: Local::now().date_naive().format("%Y-%m-%d").to_string(),
    };
    render_page(&state, "uploads", &page)
}

fn back_to_uploads(notice: Option<&str>, error: Option<&str>) -> Response {
    let target = match (notice, error) {
        (_, Some(error)) => format!("/uploads?error={}", urlencoding::encode(error)),
        (Some(notice), None) => format!("/uploads?notice={}", urlencoding::encode(notice)),
        (None, None) => "/uploads".to_string(),
    };
    Redirect::to(&target).into_response()
}

fn forbid(session: &Session) -> Option<Response> {
    if session.is_admin() {
        return None;
    }
    log::warn!("user '{}' tried an admin-only action", session.username);
    Some((StatusCode::FORBIDDEN, "Only administrators can change the data").into_response())
}

/// Handle spreadsheet uploads
///
/// The form carries a `file` field and an optional `date` (YYYY-MM-DD,
/// default today). The file is parsed before it is stored so a broken
/// spreadsheet never replaces the loaded data.
async fn upload_file(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    mut multipart: Multipart,
) -> Response {
    if let Some(response) = forbid(&session) {
        return response;
    }

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut date = Local::now().date_naive();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return back_to_uploads(None, Some(&format!("Upload failed: {e}"))),
        };
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((name, bytes.to_vec())),
                    Err(e) => return back_to_uploads(None, Some(&format!("Upload failed: {e}"))),
                }
            }
            "date" => {
                let raw = field.text().await.unwrap_or_default();
                if !raw.trim().is_empty() {
                    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
                        Ok(parsed) => date = parsed,
                        Err(_) => {
                            return back_to_uploads(None, Some(&format!("Invalid date '{raw}'")));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let Some((name, bytes)) = file.filter(|(name, bytes)| !name.is_empty() && !bytes.is_empty())
    else {
        return back_to_uploads(None, Some("No file data received"));
    };

    if let Err(e) = load_bytes(&name, &bytes) {
        log::warn!("rejected upload {}: {}", name, e);
        return back_to_uploads(None, Some(&format!("{name}: {e}")));
    }

    match state.uploads.save(&name, &bytes, date) {
        Ok(entry) => {
            log::info!("user '{}' uploaded {}", session.username, entry.file_name);
            match state.reload(&Selection::default()) {
                Ok(()) => back_to_uploads(Some(&format!("Uploaded {}", entry.file_name)), None),
                Err(e) => back_to_uploads(None, Some(&e.to_string())),
            }
        }
        Err(e) => back_to_uploads(None, Some(&e.to_string())),
    }
}

/// Period selection form; an empty `previous` means no comparison, while
/// `auto` or a missing field picks the upload before `current`
#[derive(Debug, Default, Deserialize)]
struct SelectForm {
    current: Option<String>,
    previous: Option<String>,
}

impl SelectForm {
    fn selection(&self) -> Selection {
        let current = self
            .current
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let previous = match self.previous.as_deref().map(str::trim) {
            None | Some("auto") => None,
            Some(other) => Some(other.to_string()),
        };
        Selection { current, previous }
    }
}

async fn select_uploads(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Form(form): Form<SelectForm>,
) -> Response {
    if let Some(response) = forbid(&session) {
        return response;
    }
    match state.reload(&form.selection()) {
        Ok(()) => back_to_uploads(Some("Selection updated"), None),
        Err(e) => back_to_uploads(None, Some(&e.to_string())),
    }
}

/// Runs `f` on the pivot a query asks for
fn with_pivot<R>(
    state: &AppState,
    query: &PivotQuery,
    f: impl FnOnce(&crate::aggregate::PivotTable, &[GroupKey], Metric) -> Result<R>,
) -> Result<R> {
    let (keys, metric) = query.resolve()?;
    state.with_dataset(|dataset| {
        let dataset = dataset.ok_or(DashboardError::NoDataset)?;
        f(&dataset.pivot(&keys), &keys, metric)
    })
}

async fn api_pivot(State(state): State<Arc<AppState>>, Query(query): Query<PivotQuery>) -> Response {
    match with_pivot(&state, &query, |table, _, _| Ok(table.clone())) {
        Ok(table) => Json(table).into_response(),
        Err(e) => error_response(e),
    }
}

fn attachment(content_type: &str, file_name: String, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn export_name(keys: &[GroupKey], extension: &str) -> String {
    format!(
        "pivot_{}_{}.{}",
        keys.iter().map(|k| k.slug()).collect::<Vec<_>>().join("-"),
        Local::now().format("%Y-%m-%d"),
        extension
    )
}

async fn export_csv(State(state): State<Arc<AppState>>, Query(query): Query<PivotQuery>) -> Response {
    let csv = with_pivot(&state, &query, |table, keys, metric| {
        Ok((export_name(keys, "csv"), pivot_to_csv(table, &display_metrics(metric))))
    });
    match csv {
        Ok((name, csv)) => attachment("text/csv; charset=utf-8", name, csv.into_bytes()),
        Err(e) => error_response(e),
    }
}

async fn export_xlsx(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PivotQuery>,
) -> Response {
    let xlsx = with_pivot(&state, &query, |table, keys, metric| {
        Ok((export_name(keys, "xlsx"), pivot_to_xlsx(table, &display_metrics(metric))?))
    });
    match xlsx {
        Ok((name, bytes)) => attachment(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            name,
            bytes,
        ),
        Err(e) => error_response(e),
    }
}

async fn chart_png(State(state): State<Arc<AppState>>, Query(query): Query<PivotQuery>) -> Response {
    let png = with_pivot(&state, &query, |table, keys, metric| {
        let options = ChartOptions {
            title: format!(
                "{} by {}",
                metric.label(),
                keys.iter().map(|k| k.label()).collect::<Vec<_>>().join(" / ")
            ),
            y_label: metric.label().to_string(),
            ..ChartOptions::default()
        };
        render_pivot_chart(table, metric, &options)
    });
    match png {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    dataset_loaded: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        dataset_loaded: state.with_dataset(|dataset| dataset.is_some()),
    })
}

/// Builds the application router
///
/// `/login`, `/logout`, `/health` and `/static` are public; every other
/// route needs a session.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", get(dashboard))
        .route("/pivot", get(pivot_page))
        .route("/meetings", get(meetings_page))
        .route("/uploads", get(uploads_page).post(upload_file))
        .route("/uploads/select", post(select_uploads))
        .route("/api/pivot", get(api_pivot))
        .route("/export/pivot.csv", get(export_csv))
        .route("/export/pivot.xlsx", get(export_xlsx))
        .route("/chart/pivot.png", get(chart_png))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/logout", post(handle_logout))
        .route("/health", get(health))
        .merge(protected)
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: AppConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let address = config.bind_address();
    let state = Arc::new(AppState::new(config)?);
    let app = build_router(state);

    let listener = TcpListener::bind(&address).await?;
    log::info!("listening on http://{}", address);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivot_query_defaults() {
        let (keys, metric) = PivotQuery::default().resolve().unwrap();
        assert_eq!(keys, vec![GroupKey::Owner]);
        assert_eq!(metric, Metric::Total);

        let query = PivotQuery {
            keys: Some("team,owner".into()),
            metric: Some("weighted".into()),
        };
        let (keys, metric) = query.resolve().unwrap();
        assert_eq!(keys, vec![GroupKey::Team, GroupKey::Owner]);
        assert_eq!(display_metrics(metric)[0], Metric::Weighted);
        assert_eq!(display_metrics(Metric::Upside), Metric::PIVOT.to_vec());
        assert_eq!(
            pivot_link("/export/pivot.csv", &keys, metric),
            "/export/pivot.csv?keys=team%2Cowner&metric=weighted"
        );
    }

    #[test]
    fn select_form_maps_to_selection() {
        let form = SelectForm {
            current: Some("2024-03-08_a.csv".into()),
            previous: Some("auto".into()),
        };
        assert_eq!(
            form.selection(),
            Selection {
                current: Some("2024-03-08_a.csv".into()),
                previous: None,
            }
        );
        let form = SelectForm {
            current: Some(String::new()),
            previous: Some(String::new()),
        };
        assert_eq!(form.selection().previous, Some(String::new()));
        assert_eq!(form.selection().current, None);

        // An untouched Previous column sends no field at all
        assert_eq!(SelectForm::default().selection(), Selection::default());
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(error_status(&DashboardError::NoDataset), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&DashboardError::UnknownKey("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&DashboardError::Chart("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
