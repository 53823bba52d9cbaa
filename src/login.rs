#![cfg(not(tarpaulin_include))]

#[cfg(feature = "web")]
use crate::app::AppState;
use crate::config::{BootstrapAdmin, LimiterConfig};
use crate::error::{DashboardError, Result};
use crate::limiter::{FailureOutcome, LoginLimiter, Verdict};
#[cfg(feature = "web")]
use crate::view::LoginPage;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
#[cfg(feature = "web")]
use axum::{
    Form,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};
#[cfg(feature = "web")]
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

/// What a signed-in user may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May upload files and select periods
    Admin,

    /// Read-only access to the dashboards
    Viewer,
}

impl std::str::FromStr for Role {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            other => Err(DashboardError::Credentials(format!("unknown role '{other}'"))),
        }
    }
}

/// Entry of the credential store
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Credential {
    /// Username (unique identifier for the user)
    pub username: String,

    /// Argon2 hash of the user's password
    pub password_hash: String,

    pub role: Role,
}

/// Login form data
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,

    /// Password in plaintext (only transmitted, never stored)
    pub password: String,
}

/// Hash a password using Argon2
///
/// # Errors
/// * `PasswordHash` if hashing fails
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DashboardError::PasswordHash(e.to_string()))
}

/// Verify a password against a stored hash
///
/// # Returns
/// * `Ok(true)` on a match, `Ok(false)` on a mismatch
///
/// # Errors
/// * `PasswordHash` if the stored hash is not a valid PHC string
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| DashboardError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// JSON file of credentials keyed by username
///
/// The whole file is held in memory and rewritten on every change.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    users: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    /// Opens the store, creating an empty `{}` file if none exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::write(&path, b"{}")?;
        }

        let contents = fs::read_to_string(&path)?;
        let users: HashMap<String, Credential> = serde_json::from_str(&contents).map_err(|e| {
            DashboardError::Credentials(format!("failed to parse {}: {}", path.display(), e))
        })?;

        log::debug!("loaded {} credential(s) from {}", users.len(), path.display());
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    fn save(&self, users: &HashMap<String, Credential>) -> Result<()> {
        let json = serde_json::to_string_pretty(users)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn get(&self, username: &str) -> Option<Credential> {
        self.users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(username)
            .cloned()
    }

    /// All credentials sorted by username
    pub fn list(&self) -> Vec<Credential> {
        let mut users: Vec<Credential> = self
            .users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Adds a user or replaces the password and role of an existing one
    pub fn upsert(&self, username: &str, password: &str, role: Role) -> Result<()> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(DashboardError::Credentials(
                "username and password cannot be empty".into(),
            ));
        }

        let credential = Credential {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role,
        };

        let mut users = self
            .users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        users.insert(username.to_string(), credential);
        self.save(&users)
    }

    /// Removes a user; returns whether it existed
    pub fn remove(&self, username: &str) -> Result<bool> {
        let mut users = self
            .users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let existed = users.remove(username).is_some();
        if existed {
            self.save(&users)?;
        }
        Ok(existed)
    }

    /// Creates the configured admin account if it is missing
    pub fn ensure_admin(&self, admin: &BootstrapAdmin) -> Result<()> {
        if self.get(&admin.username).is_none() {
            log::info!("creating bootstrap admin '{}'", admin.username);
            self.upsert(&admin.username, &admin.password, Role::Admin)?;
        }
        Ok(())
    }

    /// Checks a username/password pair, returning the role on success
    pub fn verify(&self, username: &str, password: &str) -> Result<Option<Role>> {
        match self.get(username) {
            Some(user) if verify_password(password, &user.password_hash)? => Ok(Some(user.role)),
            _ => Ok(None),
        }
    }
}

/// Result of one login attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success { role: Role },
    Failure { remaining_attempts: u32 },
    LockedOut { retry_after: Duration },
}

/// Credential check guarded by the attempt limiter
#[derive(Debug)]
pub struct AuthGate {
    store: CredentialStore,
    limiter: LoginLimiter,
}

impl AuthGate {
    pub fn new(store: CredentialStore, limiter: LimiterConfig) -> Self {
        Self {
            store,
            limiter: LoginLimiter::new(limiter),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn attempt(&self, username: &str, password: &str) -> Result<AttemptOutcome> {
        self.attempt_at(username, password, SystemTime::now())
    }

    /// Attempts a login at a given instant
    ///
    /// While a username is locked out its password is not checked at all,
    /// so a correct password is rejected too.
    pub fn attempt_at(
        &self,
        username: &str,
        password: &str,
        now: SystemTime,
    ) -> Result<AttemptOutcome> {
        let username = username.trim();
        if let Verdict::LockedOut { retry_after } = self.limiter.begin(username, now) {
            log::info!("rejected login for locked-out user '{}'", username);
            return Ok(AttemptOutcome::LockedOut { retry_after });
        }

        let verified = match self.store.verify(username, password) {
            Ok(verified) => verified,
            Err(e) => {
                self.limiter.release(username);
                return Err(e);
            }
        };

        match verified {
            Some(role) => {
                self.limiter.succeed(username);
                log::info!("user '{}' logged in", username);
                Ok(AttemptOutcome::Success { role })
            }
            None => {
                log::warn!("failed login for '{}'", username);
                Ok(match self.limiter.fail(username, now) {
                    FailureOutcome::Remaining(remaining_attempts) => {
                        AttemptOutcome::Failure { remaining_attempts }
                    }
                    FailureOutcome::LockedOut { retry_after } => {
                        AttemptOutcome::LockedOut { retry_after }
                    }
                })
            }
        }
    }
}

/// User session data
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub username: String,
    pub role: Role,
    pub expires_at: SystemTime,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// In-memory session table
#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session and returns its id
    pub fn create(&self, username: &str, role: Role) -> String {
        let now = SystemTime::now();
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            username: username.to_string(),
            role,
            expires_at: now + self.ttl,
        };

        let mut sessions = self.write();
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(session_id.clone(), session);
        session_id
    }

    /// Returns the session if it exists and has not expired
    ///
    /// Every expired session is dropped on lookup.
    pub fn validate(&self, session_id: &str) -> Option<Session> {
        let now = SystemTime::now();
        let mut sessions = self.write();
        sessions.retain(|_, session| session.expires_at > now);
        sessions.get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        self.write().remove(session_id);
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Web handler functions below (only compiled with "web" feature)

/// Query parameters accepted by the login page
#[cfg(feature = "web")]
#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    pub notice: Option<String>,
}

#[cfg(feature = "web")]
fn login_page(state: &AppState, status: StatusCode, page: LoginPage) -> Response {
    match state.views.login(&page) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            log::error!("failed to render login page: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

/// Serve the login page
#[cfg(feature = "web")]
pub async fn serve_login_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
) -> Response {
    login_page(
        &state,
        StatusCode::OK,
        LoginPage {
            notice: query.notice,
            ..LoginPage::default()
        },
    )
}

/// Handle login form submissions
///
/// A success sets the session cookie and redirects to the dashboard.
/// Failures re-render the form with 401, lockouts with 429.
#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<UserCredentials>,
) -> Response {
    let username = credentials.username.trim().to_string();
    let attempt = {
        let state = Arc::clone(&state);
        let username = username.clone();
        // Argon2 verification is CPU-bound
        tokio::task::spawn_blocking(move || state.auth.attempt(&username, &credentials.password))
            .await
    };
    let outcome = match attempt {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("login task failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Authentication error").into_response();
        }
    };

    match outcome {
        Ok(AttemptOutcome::Success { role }) => {
            let session_id = state.sessions.create(&username, role);
            let cookie = Cookie::build((SESSION_COOKIE, session_id))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax);
            (jar.add(cookie), Redirect::to("/")).into_response()
        }
        Ok(AttemptOutcome::Failure { remaining_attempts }) => login_page(
            &state,
            StatusCode::UNAUTHORIZED,
            LoginPage {
                error: Some(format!(
                    "Invalid username or password. {} attempt(s) left.",
                    remaining_attempts
                )),
                username: Some(username),
                ..LoginPage::default()
            },
        ),
        Ok(AttemptOutcome::LockedOut { retry_after }) => login_page(
            &state,
            StatusCode::TOO_MANY_REQUESTS,
            LoginPage {
                error: Some(format!(
                    "Too many failed attempts. Try again in {} second(s).",
                    retry_after.as_secs().max(1)
                )),
                username: Some(username),
                ..LoginPage::default()
            },
        ),
        Err(e) => {
            log::error!("authentication error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Authentication error").into_response()
        }
    }
}

/// Handle user logout
///
/// Drops the session and clears the cookie.
#[cfg(feature = "web")]
pub async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    let target = format!(
        "/login?notice={}",
        urlencoding::encode("You have been signed out.")
    );
    (jar, Redirect::to(&target)).into_response()
}

/// Authentication middleware
///
/// Lets requests with a valid session through, with the [`Session`] in the
/// request extensions; everything else is redirected to the login page.
#[cfg(feature = "web")]
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(session_cookie) = jar.get(SESSION_COOKIE) {
        if let Some(session) = state.sessions.validate(session_cookie.value()) {
            request.extensions_mut().insert(session);
            return next.run(request).await;
        }
    }

    Redirect::to("/login").into_response()
}
