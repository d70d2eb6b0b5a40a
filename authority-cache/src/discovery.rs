use std::borrow::Cow;
use std::time::Duration;

use rand::distr::{Distribution as _, Uniform};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::authority::Authority;
use crate::record::OAuthError;

/// 既定のインスタンスディスカバリーエンドポイント
pub const DEFAULT_INSTANCE_DISCOVERY_ENDPOINT: &str =
    "https://login.microsoftonline.com/common/discovery/instance";

/// インスタンスディスカバリーのAPIバージョン
const INSTANCE_DISCOVERY_API_VERSION: &str = "1.1";

/// インスタンスディスカバリーの結果型
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// インスタンスディスカバリーのエラー
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// インスタンスディスカバリークライアントの初期化に失敗
    #[error("{0}")]
    Initialize(Cow<'static, str>),

    /// インスタンスディスカバリーエンドポイントへのリクエストに失敗
    #[error("Failed to request instance discovery from {1}: {0}")]
    RequestError(reqwest::Error, Url),

    /// インスタンスディスカバリーエンドポイントが想定外のステータスを返した
    #[error("Instance discovery at {0} returned status {1}")]
    UnexpectedStatus(Url, StatusCode),

    /// インスタンスディスカバリーのレスポンスのパースに失敗
    #[error("Failed to parse instance discovery response from {0}: {1}")]
    ResponseParseError(Url, reqwest::Error),
}

/// 再試行設定
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大試行回数
    max_attempts: u32,
    /// 最初の待機時間
    initial_wait: Duration,
    /// 待機時間の増加乗数
    backoff_multiplier: f64,
    /// 最大待機時間
    max_wait: Duration,
    /// ジッター分布（待機時間に乗算されるランダム係数）
    jitter_dist: Uniform<f64>,
}

impl RetryConfig {
    /// コンストラクタ
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - 最大試行回数
    /// * `initial_wait` - 最初の待機時間
    /// * `backoff_multiplier` - 待機時間の増加乗数
    /// * `jitter_min` - ジッターの最小値
    /// * `jitter_max` - ジッターの最大値
    /// * `max_wait` - 最大待機時間
    pub fn new(
        max_attempts: u32,
        initial_wait: Duration,
        backoff_multiplier: f64,
        jitter_min: f64,
        jitter_max: f64,
        max_wait: Duration,
    ) -> DiscoveryResult<Self> {
        if max_attempts == 0 {
            return Err(DiscoveryError::Initialize(
                "Instance discovery max attempts must be greater than zero".into(),
            ));
        }
        if backoff_multiplier < 1.0 {
            return Err(DiscoveryError::Initialize(
                "Instance discovery backoff multiplier must be at least 1.0".into(),
            ));
        }
        if jitter_min < 0.0 || jitter_max < 0.0 || jitter_min > jitter_max {
            return Err(DiscoveryError::Initialize(
                "Invalid jitter min/max values".into(),
            ));
        }
        if max_wait.is_zero() {
            return Err(DiscoveryError::Initialize(
                "Instance discovery max wait must be greater than zero".into(),
            ));
        }
        let jitter_dist = Uniform::new_inclusive(jitter_min, jitter_max).map_err(|e| {
            DiscoveryError::Initialize(format!("Failed to create jitter distribution: {e}").into())
        })?;

        Ok(Self {
            max_attempts,
            initial_wait,
            backoff_multiplier,
            max_wait,
            jitter_dist,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 試行回数に応じた待機時間を計算する。
    ///
    /// 待機時間は`initial_wait * (multiplier ^ (attempts - 1)) * jitter`で計算し、`max_wait`で頭打ちにする。
    fn calculate_delay(&self, attempts: u32) -> Duration {
        let mut delay_millis = self.initial_wait.as_millis() as f64
            * self
                .backoff_multiplier
                .powf(attempts.saturating_sub(1) as f64);
        // 同じ時刻に再試行が集中しないように、ランダムなジッターを乗算
        delay_millis *= self.jitter_dist.sample(&mut rand::rng());
        Duration::from_millis(delay_millis as u64).min(self.max_wait)
    }
}

/// 再試行可能なステータスかどうかを判定する。
///
/// サーバーエラーとレートリミットエラーは再試行可能とみなす。
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// 再試行可能なエラーかどうかを判定する。
///
/// タイムアウト、接続エラー、および再試行可能なステータスは再試行可能とみなす。
fn is_retryable_error(e: &reqwest::Error) -> bool {
    if e.is_timeout() || e.is_connect() {
        return true;
    }
    e.status().is_some_and(is_retryable_status)
}

/// インスタンスディスカバリーのレスポンス
///
/// ```json
/// {
///     "tenant_discovery_endpoint": "https://login.microsoftonline.com/common/v2.0/.well-known/openid-configuration",
///     "api-version": "1.1",
///     "metadata": [
///         {
///             "preferred_network": "login.microsoftonline.com",
///             "preferred_cache": "login.windows.net",
///             "aliases": ["login.microsoftonline.com", "login.windows.net", "sts.windows.net"]
///         }
///     ]
/// }
/// ```
#[derive(Deserialize)]
struct InstanceDiscoveryResponse {
    tenant_discovery_endpoint: Url,
    #[serde(default)]
    metadata: Vec<Value>,
}

/// インスタンスディスカバリーの結果
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    /// 認可機関が有効で、メタデータを取得した
    Metadata {
        /// OpenID構成エンドポイント
        tenant_discovery_endpoint: Url,
        /// インスタンスメタデータのエントリ
        metadata: Vec<Value>,
    },
    /// 認可機関が無効と判定された
    Rejected(OAuthError),
}

/// インスタンスディスカバリークライアント
///
/// 認可機関のインスタンスメタデータを取得する。取得したメタデータの解釈は行わない。
#[derive(Clone)]
pub struct InstanceDiscoveryClient {
    /// HTTPクライアント
    client: reqwest::Client,
    /// インスタンスディスカバリーエンドポイント
    endpoint: Url,
    /// 再試行設定
    retry_config: RetryConfig,
}

impl InstanceDiscoveryClient {
    /// コンストラクタ
    ///
    /// # Arguments
    ///
    /// * `endpoint` - インスタンスディスカバリーエンドポイント
    /// * `connection_timeout` - エンドポイントに接続する際のタイムアウト
    /// * `timeout` - エンドポイントからの応答を待つタイムアウト
    /// * `retry_config` - 再試行設定
    pub fn new(
        endpoint: Url,
        connection_timeout: Duration,
        timeout: Duration,
        retry_config: RetryConfig,
    ) -> DiscoveryResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connection_timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                DiscoveryError::Initialize(
                    format!("Failed to build instance discovery client: {e}").into(),
                )
            })?;
        Ok(Self {
            client,
            endpoint,
            retry_config,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// 認可機関のインスタンスディスカバリーURLを返す。
    pub fn discovery_url(&self, authority: &Authority) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("api-version", INSTANCE_DISCOVERY_API_VERSION)
            .append_pair(
                "authorization_endpoint",
                authority.authorization_endpoint().as_str(),
            );
        url
    }

    /// 認可機関のインスタンスメタデータを取得する。
    ///
    /// # Arguments
    ///
    /// * `authority` - 認可機関
    ///
    /// # Returns
    ///
    /// * インスタンスディスカバリーの結果、またはエラー
    ///
    /// # Notes
    ///
    /// エンドポイントが`400 Bad Request`とOAuthエラーを返した場合は、認可機関が無効と判定されたとみなし、
    /// エラーではなく`DiscoveryOutcome::Rejected`を返す。
    ///
    /// タイムアウト、接続エラー、サーバーエラーおよびレートリミットエラーの場合は、指数バックオフで再試行する。
    pub async fn discover(&self, authority: &Authority) -> DiscoveryResult<DiscoveryOutcome> {
        let url = self.discovery_url(authority);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match self.client.get(url.as_str()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response
                            .json::<InstanceDiscoveryResponse>()
                            .await
                            .map_err(|e| DiscoveryError::ResponseParseError(url.clone(), e))?;
                        if body.metadata.is_empty() {
                            tracing::warn!(
                                authority = %authority,
                                "Instance discovery response contains no metadata"
                            );
                        }
                        return Ok(DiscoveryOutcome::Metadata {
                            tenant_discovery_endpoint: body.tenant_discovery_endpoint,
                            metadata: body.metadata,
                        });
                    }
                    if status == StatusCode::BAD_REQUEST {
                        let error = response
                            .json::<OAuthError>()
                            .await
                            .map_err(|e| DiscoveryError::ResponseParseError(url.clone(), e))?;
                        tracing::warn!(
                            authority = %authority,
                            code = %error.code,
                            "Instance discovery rejected authority"
                        );
                        return Ok(DiscoveryOutcome::Rejected(error));
                    }
                    if !is_retryable_status(status) {
                        return Err(DiscoveryError::UnexpectedStatus(url, status));
                    }
                    DiscoveryError::UnexpectedStatus(url.clone(), status)
                }
                Err(e) => {
                    if !is_retryable_error(&e) {
                        return Err(DiscoveryError::RequestError(e, url));
                    }
                    DiscoveryError::RequestError(e, url.clone())
                }
            };

            if attempts >= self.retry_config.max_attempts {
                tracing::error!(
                    error = %failure,
                    attempts = attempts,
                    "Instance discovery failed after max attempts"
                );
                return Err(failure);
            }
            // 試行回数に対して指数関数的に待機時間を増加させる（指数バックオフ）
            let delay = self.retry_config.calculate_delay(attempts);
            tracing::warn!(
                error = %failure,
                attempts = attempts,
                delay_ms = %delay.as_millis(),
                "Instance discovery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
