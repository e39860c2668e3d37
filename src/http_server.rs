//! HTTP server implementation using Axum.
//!
//! Every file endpoint sits behind [`bind_session`], which ties the request
//! to a session (minting one when needed) before the handler runs.

use crate::confine::Jail;
use crate::error::FsError;
use crate::fs_ops::{self, DirEntryInfo};
use crate::navigate::{navigate, trim_name};
use crate::session::short;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Extension, Multipart, Query, Request, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{debug, error, info, info_span, Level};

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "session_id";

/// Reports the size of an accepted upload.
pub const BYTES_WRITTEN_HEADER: &str = "x-bytes-written";

/// The session a request is bound to, as seen when the request arrived.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub token: String,
    pub current_dir: PathBuf,
}

#[derive(Deserialize)]
struct FileQuery {
    #[serde(default)]
    file: String,
}

#[derive(Deserialize)]
struct DirQuery {
    #[serde(default)]
    dir: String,
}

#[derive(Deserialize)]
struct ListQuery {
    format: Option<String>,
}

#[derive(Serialize)]
struct Listing {
    path: String,
    entries: Vec<DirEntryInfo>,
}

/// Client-visible failure of a request.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "Upload too large").into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<FsError> for ApiError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::FileNotFound | FsError::DirectoryNotFound => {
                ApiError::NotFound(err.to_string())
            }
            FsError::Io { context, source } => {
                if exceeded_body_limit(&source) {
                    return ApiError::PayloadTooLarge;
                }
                error!(error = %source, "{}", context);
                ApiError::Internal(context.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

fn exceeded_body_limit(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<MultipartError>())
        .is_some_and(|e| e.status() == StatusCode::PAYLOAD_TOO_LARGE)
}

/// Builds the router. Exposed separately from [`run_server`] for tests.
pub fn router(state: AppState) -> Router {
    let upload_limit = match state.max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    let session_routes = Router::new()
        .route("/files", get(list_files))
        .route("/upload", post(upload_file).layer(upload_limit))
        .route("/download", get(download_file))
        .route("/cat", get(view_file))
        .route("/delete", delete(delete_file))
        .route("/cd", get(change_directory))
        .route("/mkdir", get(create_directory).post(create_directory))
        .route("/quit", get(quit).post(quit))
        .route_layer(middleware::from_fn_with_state(state.clone(), bind_session));

    Router::new()
        .merge(session_routes)
        .route("/health", get(health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` is cancelled.
///
/// The session sweeper runs for exactly as long as the server does.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let sweeper = state.sessions.spawn_sweeper(
        state.sweep_interval,
        state.session_ttl,
        shutdown.child_token(),
    );

    info!(
        addr = %listener.local_addr()?,
        root = %state.jail.root().display(),
        "Starting HTTP server"
    );
    let app = router(state);
    let signal = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "session sweeper panicked");
    }
    result
}

async fn health() -> &'static str {
    "OK"
}

/// Resolves the request's session cookie, creating a session when it is
/// missing or unknown, and attaches a new cookie to whatever the handler
/// returns.
async fn bind_session(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = jar.get(SESSION_COOKIE).map(|c| c.value().to_owned());
    let resolved = state.sessions.resolve(presented.as_deref()).await;
    let new_cookie = resolved.is_new.then(|| session_cookie(resolved.token.clone()));

    request.extensions_mut().insert(SessionContext {
        token: resolved.token,
        current_dir: resolved.current_dir,
    });
    let mut response = next.run(request).await;

    if let Some(cookie) = new_cookie {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "failed to encode session cookie"),
        }
    }
    response
}

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .build()
}

/// Joins a client-supplied file name under the session's directory.
fn file_target(jail: &Jail, session: &SessionContext, name: &str) -> Result<PathBuf, FsError> {
    if name.trim().is_empty() {
        return Err(FsError::InvalidFileName);
    }
    jail.join_entry(&session.current_dir, name)
}

async fn list_files(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let entries = fs_ops::list_dir(&session.current_dir).await?;

    let wants_json = query.format.as_deref() == Some("json")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
    if wants_json {
        return Ok(Json(Listing {
            path: state.jail.virtual_path(&session.current_dir),
            entries,
        })
        .into_response());
    }
    Ok(fs_ops::render_listing(&entries).into_response())
}

async fn upload_file(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "rejected upload form");
        ApiError::BadRequest("Error parsing form".into())
    })?;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ApiError::BadRequest("Error retrieving file".into())),
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(ApiError::PayloadTooLarge)
            }
            Err(e) => {
                debug!(error = %e, "malformed multipart body");
                return Err(ApiError::BadRequest("Error parsing form".into()));
            }
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ApiError::BadRequest("Error retrieving file".into()))?;
        let target = file_target(&state.jail, &session, &file_name)?;
        let written = fs_ops::write_stream(&state.jail, &target, field).await?;

        info!(
            token = short(&session.token),
            path = %state.jail.virtual_path(&target),
            bytes = written,
            "file uploaded"
        );
        return Ok((
            [(BYTES_WRITTEN_HEADER, written.to_string())],
            "File uploaded successfully",
        )
            .into_response());
    }
}

#[derive(Clone, Copy)]
enum Disposition {
    Attachment,
    Inline,
}

async fn download_file(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_file(&state, &session, &query.file, Disposition::Attachment).await
}

async fn view_file(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_file(&state, &session, &query.file, Disposition::Inline).await
}

async fn serve_file(
    state: &AppState,
    session: &SessionContext,
    name: &str,
    disposition: Disposition,
) -> Result<Response, ApiError> {
    let target = file_target(&state.jail, session, name)?;
    let (file, len) = fs_ops::open_file(&state.jail, &target).await?;

    let (content_type, disposition) = match disposition {
        Disposition::Attachment => (
            "application/octet-stream",
            format!("attachment; filename={}", display_name(&target)),
        ),
        Disposition::Inline => ("text/plain; charset=utf-8", "inline".to_string()),
    };
    let disposition = HeaderValue::from_bytes(disposition.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    debug!(path = %state.jail.virtual_path(&target), size = len, "serving file");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
            (header::CONTENT_LENGTH, HeaderValue::from(len)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn delete_file(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<FileQuery>,
) -> Result<&'static str, ApiError> {
    let target = file_target(&state.jail, &session, &query.file)?;
    fs_ops::delete(&state.jail, &target).await?;
    info!(
        token = short(&session.token),
        path = %state.jail.virtual_path(&target),
        "file deleted"
    );
    Ok("File deleted successfully")
}

async fn change_directory(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<DirQuery>,
) -> Result<String, ApiError> {
    let new_dir = navigate(&session.current_dir, &query.dir, &state.jail).await?;
    state.sessions.update(&session.token, new_dir.clone()).await;

    let shown = state.jail.virtual_path(&new_dir);
    debug!(token = short(&session.token), dir = %shown, "directory changed");
    Ok(format!("Directory changed to {shown}"))
}

async fn create_directory(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<DirQuery>,
) -> Result<&'static str, ApiError> {
    let name = trim_name(&query.dir)?;
    let target = state.jail.join_entry(&session.current_dir, name)?;
    fs_ops::create_dir(&state.jail, &target).await?;
    info!(
        token = short(&session.token),
        path = %state.jail.virtual_path(&target),
        "directory created"
    );
    Ok("Directory created")
}

async fn quit(
    State(state): State<AppState>,
    Extension(session): Extension<SessionContext>,
) -> &'static str {
    state.sessions.remove(&session.token).await;
    "Connection closed"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_errors_map_to_statuses() {
        let status = |e: FsError| ApiError::from(e).into_response().status();
        assert_eq!(status(FsError::PathViolation), StatusCode::BAD_REQUEST);
        assert_eq!(status(FsError::InvalidDirectoryName), StatusCode::BAD_REQUEST);
        assert_eq!(status(FsError::NotADirectory), StatusCode::BAD_REQUEST);
        assert_eq!(status(FsError::NotAFile), StatusCode::BAD_REQUEST);
        assert_eq!(status(FsError::FileNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(FsError::DirectoryNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status(FsError::io(
                "Error deleting file",
                io::Error::from(io::ErrorKind::PermissionDenied)
            )),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn session_cookie_is_http_only_for_whole_site() {
        let cookie = session_cookie("abc123".into()).to_string();
        assert!(cookie.starts_with("session_id=abc123"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        assert!(!cookie.contains("Max-Age"));
        assert!(!cookie.contains("Expires"));
    }

    #[test]
    fn empty_file_name_is_rejected_before_joining() {
        let dir = tempfile::TempDir::new().unwrap();
        let jail = Jail::new(dir.path()).unwrap();
        let session = SessionContext {
            token: "t".into(),
            current_dir: jail.root().to_path_buf(),
        };
        assert!(matches!(
            file_target(&jail, &session, "  "),
            Err(FsError::InvalidFileName)
        ));
        assert!(matches!(
            file_target(&jail, &session, "../x"),
            Err(FsError::PathViolation)
        ));
    }
}
