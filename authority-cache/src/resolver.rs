use std::borrow::Cow;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use url::Url;

use crate::authority::{Authority, AuthorityError, AuthorityKey};
use crate::cache::{AuthorityCache, AuthorityCacheError};
use crate::discovery::{
    DEFAULT_INSTANCE_DISCOVERY_ENDPOINT, DiscoveryError, DiscoveryOutcome,
    InstanceDiscoveryClient, RetryConfig,
};
use crate::record::OAuthError;

/// インスタンスディスカバリーエンドポイントに接続する際の既定のタイムアウト
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// インスタンスディスカバリーエンドポイントからの応答を待つ既定のタイムアウト
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// 認可機関の解決処理の結果型
pub type ResolveResult<T> = Result<T, ResolveError>;

/// 認可機関の解決エラー
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// 認可機関リゾルバーの初期化に失敗
    #[error("{0}")]
    Initialize(Cow<'static, str>),

    /// 認可機関のURLが不正
    #[error(transparent)]
    InvalidAuthorityUrl(#[from] AuthorityError),

    /// 認可機関が無効と判定されている
    #[error("Authority {authority} is invalid: {error}")]
    InvalidAuthority { authority: Url, error: OAuthError },

    /// インスタンスディスカバリーに失敗
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// インスタンスメタデータの処理に失敗
    #[error(transparent)]
    Metadata(#[from] AuthorityCacheError),

    /// 他のタスクによる検証が、レコードを登録せずに終了した
    #[error("Authority {0} could not be validated")]
    NotValidated(Url),
}

/// 解決した認可機関
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAuthority {
    /// 正規化した認可機関
    pub authority: Url,
    /// ネットワーク呼び出しに使用するURL
    pub network_url: Url,
    /// トークンキャッシュのキーに使用するURL
    pub cache_url: Url,
    /// 同一視されるURL（トークンキャッシュを検索する順）
    pub aliases: Vec<Url>,
}

/// 検証中の認可機関をキー、検証完了を待機しているタスクに通知する`Notify`を値に持つハッシュマップ
type ValidationMap = HashMap<AuthorityKey, Arc<Notify>>;

/// 認可機関リゾルバー
///
/// 認可機関キャッシュにレコードが存在しない場合は、インスタンスディスカバリーで認可機関を検証して、
/// 取得したメタデータをキャッシュに登録する。
///
/// 同じ認可機関を同時に解決する場合、インスタンスディスカバリーを行うのは1つのタスクのみで、
/// 他のタスクは検証の完了を待機してキャッシュを読み直す。
pub struct AuthorityResolver {
    /// 認可機関キャッシュ
    cache: Arc<AuthorityCache>,
    /// インスタンスディスカバリークライアント
    client: InstanceDiscoveryClient,
    /// 検証中の認可機関
    validations: Mutex<ValidationMap>,
}

impl AuthorityResolver {
    pub fn builder() -> AuthorityResolverBuilder {
        AuthorityResolverBuilder::default()
    }

    pub fn cache(&self) -> &Arc<AuthorityCache> {
        &self.cache
    }

    pub fn client(&self) -> &InstanceDiscoveryClient {
        &self.client
    }

    /// 認可機関のURL文字列を解決する。
    pub async fn resolve(&self, authority: &str) -> ResolveResult<ResolvedAuthority> {
        let authority = Authority::parse(authority)?;
        self.resolve_authority(&authority).await
    }

    /// 認可機関を解決する。
    ///
    /// # Arguments
    ///
    /// * `authority` - 認可機関
    ///
    /// # Returns
    ///
    /// * 解決した認可機関、またはエラー
    ///
    /// # Notes
    ///
    /// 無効な認可機関として登録されている場合は、インスタンスディスカバリーを行わずにエラーを返す。
    ///
    /// 他のタスクが同じ認可機関を検証している場合は、その検証が完了するまで待機する。
    /// 待機した検証がレコードを登録しなかった場合は、再度検証せずに`ResolveError::NotValidated`を返す。
    pub async fn resolve_authority(
        &self,
        authority: &Authority,
    ) -> ResolveResult<ResolvedAuthority> {
        if let Some(resolved) = self.cached(authority).await? {
            return Ok(resolved);
        }

        let key = authority.key();
        let waiting = {
            let mut validations = self.lock_validations();
            match validations.entry(key.clone()) {
                Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Notify::new()));
                    None
                }
            }
        };

        if let Some(notify) = waiting {
            // 通知を受け取れる状態にしてから、検証がまだ終わっていないことを確認する
            let mut notified = std::pin::pin!(notify.notified());
            notified.as_mut().enable();
            if self.is_validating(&key, &notify) {
                tracing::debug!(authority = %authority, "Waiting for authority validation");
                notified.await;
            }
            return match self.cached(authority).await? {
                Some(resolved) => Ok(resolved),
                None => Err(ResolveError::NotValidated(authority.url().clone())),
            };
        }

        // このタスクが検証を担当する
        //
        // 検証が成功、失敗またはキャンセルされた場合でも、ガードの破棄で待機しているタスクに通知する。
        let _guard = ValidationGuard {
            validations: &self.validations,
            key,
        };
        if let Some(resolved) = self.cached(authority).await? {
            return Ok(resolved);
        }
        self.validate(authority).await
    }

    /// インスタンスディスカバリーで認可機関を検証する。
    async fn validate(&self, authority: &Authority) -> ResolveResult<ResolvedAuthority> {
        tracing::info!(authority = %authority, "Validating authority with instance discovery");
        match self.client.discover(authority).await? {
            DiscoveryOutcome::Metadata {
                tenant_discovery_endpoint,
                mut metadata,
            } => {
                if metadata.is_empty() {
                    // エントリがない場合は、問い合わせたホストのみを別名に持つレコードを登録する
                    metadata.push(json!({ "aliases": [] }));
                }
                self.cache
                    .process_metadata(&metadata, &tenant_discovery_endpoint, authority.url())
                    .await?;
                Ok(self.resolved(authority).await)
            }
            DiscoveryOutcome::Rejected(error) => {
                self.cache
                    .add_invalid_record(authority.url(), error.clone())
                    .await;
                Err(ResolveError::InvalidAuthority {
                    authority: authority.url().clone(),
                    error,
                })
            }
        }
    }

    /// キャッシュから認可機関を解決する。
    ///
    /// 検証済みのレコードが存在しない場合は`None`を返す。
    async fn cached(&self, authority: &Authority) -> ResolveResult<Option<ResolvedAuthority>> {
        if let Some(invalid) = self.cache.invalid_record_for_authority(authority.url()).await {
            return Err(ResolveError::InvalidAuthority {
                authority: invalid.authority,
                error: invalid.error,
            });
        }
        match self.cache.record_for_authority(authority.url()).await {
            Some(record) if record.validated() => Ok(Some(self.resolved(authority).await)),
            _ => Ok(None),
        }
    }

    async fn resolved(&self, authority: &Authority) -> ResolvedAuthority {
        let url = authority.url();
        ResolvedAuthority {
            authority: url.clone(),
            network_url: self.cache.network_url_for_authority(url).await,
            cache_url: self.cache.cache_url_for_authority(url).await,
            aliases: self.cache.cache_aliases_for_authority(url).await,
        }
    }

    fn is_validating(&self, key: &AuthorityKey, notify: &Arc<Notify>) -> bool {
        self.lock_validations()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, notify))
    }

    fn lock_validations(&self) -> MutexGuard<'_, ValidationMap> {
        lock_validations(&self.validations)
    }
}

fn lock_validations(validations: &Mutex<ValidationMap>) -> MutexGuard<'_, ValidationMap> {
    // ロック中のパニックは無視する
    validations.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 認可機関を検証中であることを示すガード
struct ValidationGuard<'a> {
    validations: &'a Mutex<ValidationMap>,
    key: AuthorityKey,
}

impl Drop for ValidationGuard<'_> {
    fn drop(&mut self) {
        let mut validations = lock_validations(self.validations);
        if let Some(notify) = validations.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

/// 認可機関リゾルバービルダー
#[derive(Default)]
pub struct AuthorityResolverBuilder {
    cache: Option<Arc<AuthorityCache>>,
    instance_discovery_endpoint: Option<Url>,
    connection_timeout: Option<Duration>,
    timeout: Option<Duration>,
    retry_config: Option<RetryConfig>,
}

impl AuthorityResolverBuilder {
    /// 認可機関キャッシュを設定する。
    ///
    /// 設定しない場合は、組み込みのクラウドインスタンス表で構築したキャッシュを使用する。
    pub fn cache(mut self, cache: Arc<AuthorityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// インスタンスディスカバリーエンドポイントを設定する。
    ///
    /// # Arguments
    ///
    /// * `endpoint` - インスタンスディスカバリーエンドポイント
    ///
    /// # Returns
    ///
    /// * 自身のインスタンス
    pub fn instance_discovery_endpoint(mut self, endpoint: Url) -> ResolveResult<Self> {
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(ResolveError::Initialize(
                format!("Invalid instance discovery endpoint: {endpoint}").into(),
            ));
        }
        self.instance_discovery_endpoint = Some(endpoint);
        Ok(self)
    }

    /// インスタンスディスカバリーエンドポイントに接続する際のタイムアウトを設定する。
    ///
    /// # Arguments
    ///
    /// * `timeout` - 接続タイムアウト
    ///
    /// # Returns
    ///
    /// * 自身のインスタンス
    pub fn connection_timeout(mut self, timeout: Duration) -> ResolveResult<Self> {
        if timeout.is_zero() {
            return Err(ResolveError::Initialize(
                "Instance discovery connection timeout must be greater than zero".into(),
            ));
        }
        self.connection_timeout = Some(timeout);
        Ok(self)
    }

    /// インスタンスディスカバリーエンドポイントからの応答を待つタイムアウトを設定する。
    ///
    /// # Arguments
    ///
    /// * `timeout` - 応答待機タイムアウト
    ///
    /// # Returns
    ///
    /// * 自身のインスタンス
    pub fn timeout(mut self, timeout: Duration) -> ResolveResult<Self> {
        if timeout.is_zero() {
            return Err(ResolveError::Initialize(
                "Instance discovery timeout must be greater than zero".into(),
            ));
        }
        self.timeout = Some(timeout);
        Ok(self)
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }

    /// 認可機関リゾルバーを構築する。
    ///
    /// # Returns
    ///
    /// * 認可機関リゾルバー、またはエラー
    pub fn build(self) -> ResolveResult<Arc<AuthorityResolver>> {
        let endpoint = match self.instance_discovery_endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(DEFAULT_INSTANCE_DISCOVERY_ENDPOINT).map_err(|e| {
                ResolveError::Initialize(
                    format!("Invalid default instance discovery endpoint: {e}").into(),
                )
            })?,
        };
        let retry_config = match self.retry_config {
            Some(retry_config) => retry_config,
            None => RetryConfig::new(
                3,
                Duration::from_millis(100),
                2.0,
                0.8,
                1.2,
                Duration::from_secs(2),
            )?,
        };
        let client = InstanceDiscoveryClient::new(
            endpoint,
            self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            retry_config,
        )?;
        let cache = self.cache.unwrap_or_default();

        tracing::info!(
            endpoint = %client.endpoint(),
            instances = cache.instances().len(),
            "Authority resolver initialized"
        );
        Ok(Arc::new(AuthorityResolver {
            cache,
            client,
            validations: Mutex::new(ValidationMap::new()),
        }))
    }
}
