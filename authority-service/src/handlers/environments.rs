use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use crate::state::AppState;

/// 環境の解決結果
#[derive(Serialize)]
pub struct EnvironmentResponse {
    /// 指定された環境
    environment: String,
    /// トークンキャッシュのキーに使用する環境
    cache_environment: String,
    /// 同一視される環境（トークンキャッシュを検索する順）
    aliases: Vec<String>,
}

/// 環境を解決する。
///
/// 環境が認可機関キャッシュに存在しない場合は、指定された環境をそのまま返す。
pub async fn environment(
    State(app_state): State<AppState>,
    Path(environment): Path<String>,
) -> Json<EnvironmentResponse> {
    let cache = app_state.cache();
    let cache_environment = cache.cache_environment_for_environment(&environment).await;
    let aliases = cache.cache_aliases_for_environment(&environment).await;
    Json(EnvironmentResponse {
        environment,
        cache_environment,
        aliases,
    })
}
