use authority_cache::CloudInstance;
use config::Config;
use serde::Deserialize;
use url::Url;

/// 環境変数で設定を上書きする際の接頭辞
///
/// `AUTHORITY__WEB__PORT=8080`のように、`__`で階層を区切る。
const ENV_PREFIX: &str = "AUTHORITY";

type ConfigResult<T> = Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    LoadError(config::ConfigError),
    #[error("{0}")]
    DeserializeError(config::ConfigError),
}

#[derive(Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub web: WebConfig,
    pub discovery: DiscoveryConfig,
    /// 組み込みのクラウドインスタンスに追加するクラウドインスタンス
    #[serde(default)]
    pub cloud_instances: Vec<CloudInstance>,
}

impl AppConfig {
    pub fn load() -> ConfigResult<Self> {
        Self::load_from("config.yaml")
    }

    pub fn load_from(path: &str) -> ConfigResult<Self> {
        let config = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(ConfigError::LoadError)?;
        config
            .try_deserialize()
            .map_err(ConfigError::DeserializeError)
    }
}

#[derive(Deserialize)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Deserialize)]
pub struct DiscoveryConfig {
    /// インスタンスディスカバリーエンドポイント
    ///
    /// 設定しない場合は、パブリッククラウドのエンドポイントを使用する。
    #[serde(default)]
    pub endpoint: Option<Url>,

    /// インスタンスディスカバリーエンドポイントに接続する際のタイムアウト（秒）
    pub connection_timeout: u64,

    /// インスタンスディスカバリーエンドポイントからの応答を待つタイムアウト（秒）
    pub timeout: u64,

    /// インスタンスディスカバリーエンドポイントにリクエストする最大試行回数
    pub request_max_attempts: u32,

    /// インスタンスディスカバリーエンドポイントへ再試行する際の最初の待機時間（ミリ秒）
    pub request_retry_initial_wait: u64,

    /// 再試行リクエストを送信するまでに待機する時間を増加させる乗数
    ///
    /// 待機時間は、`initial_wait * (multiplier ^ (attempt_number - 1)) * jitter`で計算される
    /// 指数バックオフとなる。
    pub request_retry_backoff_multiplier: f64,

    /// 待機時間に乗算するジッターの最小値
    pub request_retry_jitter_min: f64,

    /// 待機時間に乗算するジッターの最大値
    pub request_retry_jitter_max: f64,

    /// 再試行リクエストを送信するまでに待機する最大時間（ミリ秒）
    pub request_retry_max_wait: u64,
}
