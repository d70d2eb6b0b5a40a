use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use crate::authority::{AuthorityKey, Environment, url_with_environment};
use crate::cloud_instance::CloudInstanceTable;
use crate::invalid::InvalidAuthorityTracker;
use crate::metadata::{self, MetadataError};
use crate::record::{AuthorityCacheRecord, InvalidAuthorityRecord, OAuthError};

/// 認可機関キャッシュ処理の結果型
pub type AuthorityCacheResult<T> = Result<T, AuthorityCacheError>;

/// 認可機関キャッシュのエラー
///
/// 失敗し得るのはメタデータの処理のみで、参照系の操作は失敗しない。
#[derive(Debug, thiserror::Error)]
pub enum AuthorityCacheError {
    /// インスタンスメタデータの処理に失敗
    #[error("Failed to process metadata for {authority}: {source}")]
    Metadata {
        authority: Url,
        #[source]
        source: MetadataError,
    },
}

/// 環境をキー、認可機関キャッシュレコードを値としたハッシュマップ
type RecordMap = HashMap<Environment, Arc<AuthorityCacheRecord>>;

/// ロックで保護するキャッシュの状態
struct CacheState {
    /// 有効なレコード
    records: RecordMap,
    /// 無効な認可機関
    invalid: InvalidAuthorityTracker,
}

/// 認可機関キャッシュ
///
/// 認可機関から、ネットワーク呼び出しに使用するURL、トークンキャッシュのキーに使用するURL、
/// および同一視されるURLを解決する。
///
/// アプリケーションで1つだけ構築して、`Arc`で共有することを想定している。
/// 参照系の操作は共有ロック、更新系の操作は排他ロックを取得する。
pub struct AuthorityCache {
    /// クラウドインスタンス表
    instances: CloudInstanceTable,
    /// レコードと無効な認可機関
    state: RwLock<CacheState>,
}

impl AuthorityCache {
    /// コンストラクタ
    ///
    /// クラウドインスタンス表のすべての環境について、検証済みのレコードを登録する。
    ///
    /// # Arguments
    ///
    /// * `instances` - クラウドインスタンス表
    pub fn new(instances: CloudInstanceTable) -> Self {
        let mut records = RecordMap::new();
        for instance in instances.instances() {
            let record = Arc::new(AuthorityCacheRecord::from_cloud_instance(instance));
            for alias in instance.aliases() {
                records.insert(alias.clone(), Arc::clone(&record));
            }
        }
        tracing::info!(
            instances = instances.len(),
            environments = records.len(),
            "Loaded cloud instances into authority cache"
        );

        Self {
            instances,
            state: RwLock::new(CacheState {
                records,
                invalid: InvalidAuthorityTracker::default(),
            }),
        }
    }

    pub fn instances(&self) -> &CloudInstanceTable {
        &self.instances
    }

    /// ネットワーク呼び出しに使用するURLを返す。
    ///
    /// レコードが存在しない場合は、指定した認可機関をそのまま返す。
    pub async fn network_url_for_authority(&self, authority: &Url) -> Url {
        match self.record_for_authority(authority).await {
            Some(record) => url_with_environment(authority, record.network_host()),
            None => authority.clone(),
        }
    }

    /// トークンキャッシュのキーに使用するURLを返す。
    ///
    /// レコードが存在しない場合は、指定した認可機関をそのまま返す。
    pub async fn cache_url_for_authority(&self, authority: &Url) -> Url {
        match self.record_for_authority(authority).await {
            Some(record) => url_with_environment(authority, record.cache_host()),
            None => authority.clone(),
        }
    }

    /// トークンキャッシュのキーに使用する環境を返す。
    ///
    /// クラウドインスタンス表、キャッシュしたレコードの順に解決し、どちらにも存在しない場合は
    /// 指定した環境をそのまま返す。
    pub async fn cache_environment_for_environment(&self, environment: &str) -> String {
        let Ok(parsed) = Environment::parse(environment) else {
            return environment.to_string();
        };
        if let Some(instance) = self.instances.find(&parsed) {
            return instance.preferred_cache().to_string();
        }
        match self.find_record(&parsed).await {
            Some(record) => record.cache_host().to_string(),
            None => environment.to_string(),
        }
    }

    /// 認可機関と同一視されるURLを、トークンキャッシュを検索する順に返す。
    ///
    /// 最初の要素は常に指定した認可機関で、その後にレコードの別名が続く。
    pub async fn cache_aliases_for_authority(&self, authority: &Url) -> Vec<Url> {
        let state = self.state.read().await;
        authority_aliases(&state.records, authority)
    }

    /// 環境と同一視される環境を、トークンキャッシュを検索する順に返す。
    ///
    /// 最初の要素は常に指定した環境。
    pub async fn cache_aliases_for_environment(&self, environment: &str) -> Vec<String> {
        let mut aliases = vec![environment.to_string()];
        let Ok(parsed) = Environment::parse(environment) else {
            return aliases;
        };
        if let Some(record) = self.find_record(&parsed).await {
            for alias in record.aliases() {
                if *alias != parsed && !aliases.iter().any(|known| known == alias.as_str()) {
                    aliases.push(alias.to_string());
                }
            }
        }
        aliases
    }

    /// 複数の認可機関と同一視されるURLを、重複を除いて返す。
    ///
    /// 重複する場合は最初に現れたものを残す。
    pub async fn cache_aliases_for_authorities(&self, authorities: &[Url]) -> Vec<Url> {
        let state = self.state.read().await;
        let mut merged: Vec<Url> = Vec::new();
        for authority in authorities {
            for alias in authority_aliases(&state.records, authority) {
                if !merged.contains(&alias) {
                    merged.push(alias);
                }
            }
        }
        merged
    }

    /// インスタンスメタデータを処理して、作成したレコードをキャッシュに登録する。
    ///
    /// # Arguments
    ///
    /// * `metadata` - インスタンスメタデータのエントリ
    /// * `open_id_config_endpoint` - メタデータを取得したOpenID構成エンドポイント
    /// * `authority` - 問い合わせた認可機関
    ///
    /// # Returns
    ///
    /// * 成功した場合は`Ok(())`、メタデータを処理できなかった場合はエラー
    ///
    /// # Notes
    ///
    /// レコードの作成はロックの外で行い、作成したレコードは1回の排他ロックでまとめて登録する。
    /// したがって、参照系の操作が登録途中のレコードを観測することはない。
    pub async fn process_metadata(
        &self,
        metadata: &[Value],
        open_id_config_endpoint: &Url,
        authority: &Url,
    ) -> AuthorityCacheResult<()> {
        let processed = metadata::process_metadata(metadata, open_id_config_endpoint, authority)
            .map_err(|source| {
                tracing::warn!(
                    authority = %authority,
                    error = %source,
                    "Failed to process authority metadata"
                );
                AuthorityCacheError::Metadata {
                    authority: authority.clone(),
                    source,
                }
            })?;

        let count = processed.len();
        {
            let mut state = self.state.write().await;
            for (environment, record) in processed.into_records() {
                state.records.insert(environment, record);
            }
        }
        tracing::info!(
            authority = %authority,
            endpoint = %open_id_config_endpoint,
            records = count,
            "Processed authority metadata"
        );

        Ok(())
    }

    /// 無効な認可機関を登録する。
    ///
    /// 同じ認可機関が既に登録されている場合は、OAuthエラーを置き換える。
    /// ホストを持たないURLは登録できないため無視する。
    pub async fn add_invalid_record(&self, authority: &Url, error: OAuthError) {
        let Some(key) = AuthorityKey::from_url(authority) else {
            tracing::warn!(authority = %authority, "Ignored invalid record for URL without host");
            return;
        };
        let mut state = self.state.write().await;
        let previous = state.invalid.record(key.clone(), authority.clone(), error);
        tracing::info!(
            authority = %authority,
            key = %key,
            replaced = previous.is_some(),
            invalid_authorities = state.invalid.len(),
            "Recorded invalid authority"
        );
    }

    /// 無効な認可機関として登録されたレコードを返す。
    pub async fn invalid_record_for_authority(
        &self,
        authority: &Url,
    ) -> Option<InvalidAuthorityRecord> {
        let key = AuthorityKey::from_url(authority)?;
        self.state.read().await.invalid.get(&key).cloned()
    }

    /// 認可機関のホストに対応するレコードを返す。
    pub async fn record_for_authority(&self, authority: &Url) -> Option<Arc<AuthorityCacheRecord>> {
        let environment = Environment::from_url(authority)?;
        self.find_record(&environment).await
    }

    /// 環境に対応するレコードを返す。
    pub async fn record_for_environment(
        &self,
        environment: &str,
    ) -> Option<Arc<AuthorityCacheRecord>> {
        let environment = Environment::parse(environment).ok()?;
        self.find_record(&environment).await
    }

    async fn find_record(&self, environment: &Environment) -> Option<Arc<AuthorityCacheRecord>> {
        self.state.read().await.records.get(environment).cloned()
    }
}

impl Default for AuthorityCache {
    fn default() -> Self {
        Self::new(CloudInstanceTable::builtin())
    }
}

/// 認可機関と同一視されるURLを返す。
fn authority_aliases(records: &RecordMap, authority: &Url) -> Vec<Url> {
    let mut aliases = vec![authority.clone()];
    let Some(environment) = Environment::from_url(authority) else {
        return aliases;
    };
    if let Some(record) = records.get(&environment) {
        for alias in record.aliases() {
            if *alias == environment {
                continue;
            }
            let url = url_with_environment(authority, alias);
            if !aliases.contains(&url) {
                aliases.push(url);
            }
        }
    }
    aliases
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::RecordSource;

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[tokio::test]
    async fn cloud_instances_are_loaded_at_construction() {
        let cache = AuthorityCache::default();

        let record = cache.record_for_environment("sts.windows.net").await.unwrap();
        assert!(record.validated());
        assert_eq!(record.source(), RecordSource::CloudInstance);
        assert_eq!(
            cache
                .network_url_for_authority(&url("https://sts.windows.net/common"))
                .await
                .as_str(),
            "https://login.microsoftonline.com/common"
        );
        assert_eq!(
            cache
                .cache_url_for_authority(&url("https://login.microsoft.com/common"))
                .await
                .as_str(),
            "https://login.windows.net/common"
        );
    }

    #[tokio::test]
    async fn cloud_instance_aliases_follow_table_order() {
        let cache = AuthorityCache::default();
        let aliases = cache
            .cache_aliases_for_environment("login.windows.net")
            .await;
        assert_eq!(
            aliases,
            [
                "login.windows.net",
                "login.microsoftonline.com",
                "login.microsoft.com",
                "sts.windows.net"
            ]
        );
    }

    #[tokio::test]
    async fn cache_environment_prefers_cloud_table_then_records() {
        let cache = AuthorityCache::default();
        assert_eq!(
            cache.cache_environment_for_environment("login.microsoftonline.com").await,
            "login.windows.net"
        );
        assert_eq!(
            cache.cache_environment_for_environment("login.contoso.com").await,
            "login.contoso.com"
        );

        cache
            .process_metadata(
                &[json!({
                    "preferred_network": "login.contoso.com",
                    "preferred_cache": "cache.contoso.com",
                    "aliases": ["login.contoso.com", "cache.contoso.com"]
                })],
                &url("https://login.contoso.com/tenant/.well-known/openid-configuration"),
                &url("https://login.contoso.com/tenant"),
            )
            .await
            .unwrap();
        assert_eq!(
            cache.cache_environment_for_environment("login.contoso.com").await,
            "cache.contoso.com"
        );
    }

    #[tokio::test]
    async fn failed_metadata_leaves_store_untouched() {
        let cache = AuthorityCache::default();
        let authority = url("https://login.contoso.com/tenant");

        let result = cache
            .process_metadata(
                &[
                    json!({ "aliases": ["login.contoso.com"] }),
                    json!({ "aliases": "not-a-list" }),
                ],
                &url("https://login.contoso.com/tenant/.well-known/openid-configuration"),
                &authority,
            )
            .await;

        assert!(matches!(result, Err(AuthorityCacheError::Metadata { .. })));
        assert!(cache.record_for_authority(&authority).await.is_none());
        assert_eq!(cache.network_url_for_authority(&authority).await, authority);
    }

    #[tokio::test]
    async fn urls_without_host_are_returned_verbatim() {
        let cache = AuthorityCache::default();
        let opaque = url("data:text/plain,authority");

        assert_eq!(cache.network_url_for_authority(&opaque).await, opaque);
        assert_eq!(cache.cache_aliases_for_authority(&opaque).await, [opaque.clone()]);

        cache
            .add_invalid_record(&opaque, OAuthError::new("invalid_instance", ""))
            .await;
        assert!(cache.invalid_record_for_authority(&opaque).await.is_none());
    }
}
