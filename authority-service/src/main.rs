use std::{sync::Arc, time::Duration};

use authority_cache::{AuthorityCache, AuthorityResolver, CloudInstanceTable, RetryConfig};
use axum::http::{HeaderName, Response};
use axum::{body::Body, http::Request};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, RequestId};
use tower_http::{request_id::SetRequestIdLayer, trace::TraceLayer};
use tracing::Span;
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt};

mod common;
mod config;
mod handlers;
mod state;

use crate::config::{AppConfig, DiscoveryConfig};
use crate::handlers::create_routes;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // アプリケーション設定の読み込み
    let app_config = AppConfig::load()?;
    let web_server_port = app_config.web.port;

    // ログの設定
    LogTracer::init().map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize LogTracer");
        e
    })?;
    let subscriber = create_subscriber("authority-service", &app_config.log_level);
    set_global_default(subscriber).map_err(|e| {
        tracing::error!(error = %e, "Failed to set global default subscriber");
        e
    })?;
    tracing::info!("Starting the application...");

    // 認可機関キャッシュとリゾルバーの構築
    //
    // クラウドインスタンスのレコードは、ここでキャッシュに登録される。
    let cache = Arc::new(AuthorityCache::new(CloudInstanceTable::with_instances(
        app_config.cloud_instances,
    )));
    let resolver = build_resolver(&app_config.discovery, cache)?;

    // ルーターの作成
    let app_state = AppState { resolver };
    let x_request_id = HeaderName::from_static("x-request-id");
    let router = create_routes()
        .with_state(app_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_response(on_response),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid));

    // Webサーバーの起動
    let shutdown_token = CancellationToken::new();
    tracing::info!("Starting the web server on port {}", web_server_port);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", web_server_port)).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to start the web server");
            e
        })?;

    if shutdown_token.is_cancelled() {
        tracing::info!("Application has been shut down gracefully");
    } else {
        tracing::warn!("Application has been shut down unexpectedly");
    }

    Ok(())
}

/// ログ購読者を作成する。
///
/// # Arguments
///
/// * `name` - アプリケーション名
/// * `level` - ログレベル
///
/// # Returns
///
/// 作成したログ購読者
fn create_subscriber(name: &str, level: &str) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let formatting_layer = BunyanFormattingLayer::new(name.into(), std::io::stdout);
    Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

/// 設定から認可機関リゾルバーを構築する。
fn build_resolver(
    config: &DiscoveryConfig,
    cache: Arc<AuthorityCache>,
) -> anyhow::Result<Arc<AuthorityResolver>> {
    let retry_config = RetryConfig::new(
        config.request_max_attempts,
        Duration::from_millis(config.request_retry_initial_wait),
        config.request_retry_backoff_multiplier,
        config.request_retry_jitter_min,
        config.request_retry_jitter_max,
        Duration::from_millis(config.request_retry_max_wait),
    )?;
    let mut builder = AuthorityResolver::builder()
        .cache(cache)
        .connection_timeout(Duration::from_secs(config.connection_timeout))?
        .timeout(Duration::from_secs(config.timeout))?
        .retry_config(retry_config);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.instance_discovery_endpoint(endpoint.clone())?;
    }
    Ok(builder.build()?)
}

/// シャットダウンシグナルを受け取るまで待機する非同期関数
///
/// # Arguments
///
/// * `token` - シャットダウン用のキャンセレーショントークン
async fn shutdown_signal(token: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    // SIGTERMが利用できないOSでは、永遠に完了しないFutureを使用
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("unknown");
    tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri().path(),
    )
}

fn on_response(response: &Response<Body>, latency: Duration, _span: &Span) {
    let status = response.status();
    if status.is_server_error() {
        tracing::error!(%status, latency_ms = latency.as_millis(), "request failed");
    } else if status.is_client_error() {
        tracing::warn!(%status, latency_ms = latency.as_millis(), "client error");
    } else {
        tracing::info!(%status, latency_ms = latency.as_millis(), "request completed");
    }
}
