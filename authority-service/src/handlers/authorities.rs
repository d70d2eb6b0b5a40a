use authority_cache::{Authority, OAuthError, ResolvedAuthority};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::{
    common::{AppResult, RequestError},
    state::AppState,
};

#[derive(Deserialize)]
pub struct ResolveQuery {
    authority: String,
}

/// 認可機関を解決する。
///
/// request:
///     GET /api/authorities/resolve?authority=https://sts.windows.net/common
///
/// response:
/// ```json
/// {
///     "authority": "https://sts.windows.net/common",
///     "network_url": "https://login.microsoftonline.com/common",
///     "cache_url": "https://login.windows.net/common",
///     "aliases": ["https://sts.windows.net/common", "https://login.microsoftonline.com/common"]
/// }
/// ```
///
/// 無効と判定された認可機関、または不正な認可機関の場合は`400 Bad Request`、
/// インスタンスディスカバリーに失敗した場合は`502 Bad Gateway`を返す。
pub async fn resolve(
    State(app_state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> AppResult<Json<ResolvedAuthority>> {
    let resolved = app_state
        .resolver
        .resolve(&query.authority)
        .await
        .map_err(|e| {
            tracing::warn!(authority = %query.authority, error = %e, "Failed to resolve authority");
            RequestError::from(e)
        })?;
    Ok(Json(resolved))
}

/// 無効な認可機関の登録リクエスト
///
/// ```json
/// {
///     "authority": "https://login.contoso.com/tenant",
///     "error": "invalid_instance",
///     "error_description": "AADSTS50049: Unknown or invalid instance."
/// }
/// ```
#[derive(Deserialize)]
pub struct InvalidAuthorityRequest {
    authority: String,
    #[serde(flatten)]
    error: OAuthError,
}

/// 無効な認可機関を登録する。
///
/// 登録した認可機関は、プロセスが終了するまで解決に失敗する。
pub async fn add_invalid(
    State(app_state): State<AppState>,
    Json(request): Json<InvalidAuthorityRequest>,
) -> AppResult<StatusCode> {
    let authority = Authority::parse(&request.authority)
        .map_err(|e| RequestError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    app_state
        .cache()
        .add_invalid_record(authority.url(), request.error)
        .await;
    Ok(StatusCode::NO_CONTENT)
}
