use authority_cache::{OAuthError, ResolveError};
use axum::{http::StatusCode, response::IntoResponse};
use serde::Serialize;

pub type AppResult<T> = Result<T, RequestError>;

#[derive(Debug)]
pub struct RequestError {
    pub code: StatusCode,
    pub message: String,
    /// 認可機関が無効と判定された場合のOAuthエラー
    pub oauth_error: Option<OAuthError>,
}

impl RequestError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            oauth_error: None,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> axum::response::Response {
        (self.code, axum::Json::<RequestErrorRaw>(self.into())).into_response()
    }
}

#[derive(Serialize)]
struct RequestErrorRaw {
    code: u16,
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    oauth_error: Option<OAuthError>,
}

impl From<RequestError> for RequestErrorRaw {
    fn from(err: RequestError) -> Self {
        Self {
            code: err.code.as_u16(),
            error: err
                .code
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .into(),
            message: err.message,
            oauth_error: err.oauth_error,
        }
    }
}

impl From<ResolveError> for RequestError {
    fn from(err: ResolveError) -> Self {
        let message = err.to_string();
        match err {
            ResolveError::InvalidAuthorityUrl(_) => {
                RequestError::new(StatusCode::BAD_REQUEST, message)
            }
            ResolveError::InvalidAuthority { error, .. } => RequestError {
                code: StatusCode::BAD_REQUEST,
                message,
                oauth_error: Some(error),
            },
            ResolveError::Discovery(_)
            | ResolveError::Metadata(_)
            | ResolveError::NotValidated(_) => RequestError::new(StatusCode::BAD_GATEWAY, message),
            ResolveError::Initialize(_) => {
                RequestError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }
}
