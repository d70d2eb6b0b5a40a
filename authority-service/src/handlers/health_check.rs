use axum::{http::StatusCode, response::IntoResponse};

/// ヘルスチェック
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
