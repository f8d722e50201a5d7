use actix_web::dev::HttpResponseBuilder;
use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

/// Failures raised by the artifact store.
///
/// `NotFound` is a normal signal for the layers above: the artifact is not
/// mirrored locally and the request should fall through to upstream.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact not found")]
    NotFound,
    #[error("permission denied: `{0}`")]
    PermissionDenied(std::io::Error),
    #[error("IO error: `{0}`")]
    Io(std::io::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(e),
            _ => StorageError::Io(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sqlite error: `{0}`")]
    Sqlite(rusqlite::Error),
    #[error("`{0}` already exists")]
    Duplicate(String),
    #[error("invalid package spec: `{0}`")]
    InvalidSpec(String),
}

/// Unique-index violations get their own variant so handlers can map them to
/// a client error instead of a 500.
impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(cause, _)
                if cause.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CatalogError::Duplicate(e.to_string())
            }
            _ => CatalogError::Sqlite(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream request failed: `{0}`")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status `{0}`")]
    UpstreamStatus(u16),
    #[error("upstream index decode failed: `{0}`")]
    Decode(#[from] serde_json::Error),
    #[error("catalog failure: `{0}`")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("TLS error: `{0}`")]
    Tls(#[from] rustls::TLSError),
    #[error("certificate error: `{0}`")]
    Cert(#[from] rcgen::RcgenError),
    #[error("malformed request: `{0}`")]
    BadRequest(String),
    #[error("upstream request failed: `{0}`")]
    Upstream(#[from] reqwest::Error),
}

/// Errors surfaced by the management API listener.
///
/// Conflicts are reported as 400s (not 409s) to match what the registry
/// surface promises its clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("catalog failure: `{0}`")]
    Catalog(CatalogError),
    #[error("storage failure: `{0}`")]
    Storage(#[from] StorageError),
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Duplicate(what) => ApiError::Conflict(format!("{} already exists", what)),
            other => ApiError::Catalog(other),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Conflict(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("api failure: {}", self);
        }
        HttpResponseBuilder::new(self.status_code()).body(self.to_string())
    }
}
