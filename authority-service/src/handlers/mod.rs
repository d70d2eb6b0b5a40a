mod authorities;
mod environments;
mod health_check;

use axum::{Router, routing};

use self::authorities::{add_invalid, resolve};
use self::environments::environment;
use self::health_check::health_check;

use crate::state::AppState;

/// ルートを作成する。
///
/// # Returns
///
/// 作成したルーター
pub fn create_routes() -> Router<AppState> {
    Router::new().nest("/api", create_api_routes())
}

fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health-check", routing::get(health_check))
        .merge(create_authority_routes())
        .route("/environments/{environment}", routing::get(environment))
}

/// 認可機関の解決と、無効な認可機関の登録を行うルートを作成する。
fn create_authority_routes() -> Router<AppState> {
    Router::new()
        .route("/authorities/resolve", routing::get(resolve))
        .route("/authorities/invalid", routing::post(add_invalid))
}
