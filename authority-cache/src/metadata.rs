use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::authority::{AuthorityError, Environment};
use crate::record::AuthorityCacheRecord;

/// インスタンスメタデータ処理の結果型
pub type MetadataResult<T> = Result<T, MetadataError>;

/// インスタンスメタデータ処理のエラー
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// メタデータにエントリが存在しない
    #[error("Metadata document contains no entries")]
    Empty,

    /// エントリの形式が不正
    #[error("Failed to read metadata entry {index}: {source}")]
    InvalidEntry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    /// エントリに含まれるホストが不正
    #[error("Invalid host in metadata entry {index}: {source}")]
    InvalidHost {
        index: usize,
        #[source]
        source: AuthorityError,
    },

    /// URLからホストを取得できない
    #[error("URL has no usable host: {0}")]
    MissingHost(Url),
}

/// インスタンスメタデータのエントリ
///
/// ```json
/// {
///     "preferred_network": "login.microsoftonline.com",
///     "preferred_cache": "login.windows.net",
///     "aliases": ["login.microsoftonline.com", "login.windows.net", "sts.windows.net"]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct MetadataEntry {
    preferred_network: Option<String>,
    preferred_cache: Option<String>,
    aliases: Vec<String>,
}

/// ホストを検証したエントリ
struct ParsedEntry {
    network_host: Environment,
    cache_host: Environment,
    aliases: Vec<Environment>,
}

/// インスタンスメタデータから作成したレコード
///
/// 環境とレコードの組をメタデータの記載順に保持する。
/// 同じレコードは、そのレコードの別名の数だけ共有される。
#[derive(Debug)]
pub struct ProcessedMetadata {
    records: Vec<(Environment, Arc<AuthorityCacheRecord>)>,
}

impl ProcessedMetadata {
    pub fn records(&self) -> &[(Environment, Arc<AuthorityCacheRecord>)] {
        &self.records
    }

    pub fn into_records(self) -> Vec<(Environment, Arc<AuthorityCacheRecord>)> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// インスタンスメタデータを処理して、認可機関キャッシュレコードを作成する。
///
/// # Arguments
///
/// * `metadata` - インスタンスメタデータのエントリ
/// * `open_id_config_endpoint` - メタデータを取得したOpenID構成エンドポイント
/// * `authority` - 問い合わせた認可機関
///
/// # Returns
///
/// * 別名ごとのレコード、またはエラー
///
/// # Notes
///
/// エントリが1つでも読み取れない場合は、メタデータ全体を失敗とし、レコードを1つも返さない。
///
/// 問い合わせた認可機関のホストがどのエントリの別名にも含まれない場合は、最初のエントリの別名の末尾に追加する。
///
/// 同じホストが複数のエントリに含まれる場合は、後のエントリが優先される。
pub fn process_metadata(
    metadata: &[Value],
    open_id_config_endpoint: &Url,
    authority: &Url,
) -> MetadataResult<ProcessedMetadata> {
    if metadata.is_empty() {
        return Err(MetadataError::Empty);
    }
    let queried_host = Environment::from_url(authority)
        .ok_or_else(|| MetadataError::MissingHost(authority.clone()))?;
    let endpoint_host = Environment::from_url(open_id_config_endpoint)
        .ok_or_else(|| MetadataError::MissingHost(open_id_config_endpoint.clone()))?;

    let mut entries = metadata
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let entry = MetadataEntry::deserialize(value)
                .map_err(|source| MetadataError::InvalidEntry { index, source })?;
            parse_entry(index, entry, &endpoint_host)
        })
        .collect::<MetadataResult<Vec<_>>>()?;

    if !entries.iter().any(|entry| entry.aliases.contains(&queried_host))
        && let Some(first) = entries.first_mut()
    {
        first.aliases.push(queried_host);
    }

    let mut records = Vec::new();
    let mut claimed: HashMap<Environment, usize> = HashMap::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let record = Arc::new(AuthorityCacheRecord::from_metadata(
            entry.network_host,
            entry.cache_host,
            entry.aliases,
        ));
        for alias in record.aliases() {
            if let Some(previous) = claimed.insert(alias.clone(), index) {
                tracing::warn!(
                    environment = %alias,
                    previous_entry = previous,
                    entry = index,
                    "Host appears in multiple metadata entries, the later entry wins"
                );
            }
            records.push((alias.clone(), Arc::clone(&record)));
        }
    }

    Ok(ProcessedMetadata { records })
}

/// エントリのホストを検証する。
///
/// `preferred_network`が存在しない場合はOpenID構成エンドポイントのホストを、
/// `preferred_cache`が存在しない場合はネットワーク呼び出しに使用するホストを使用する。
fn parse_entry(
    index: usize,
    entry: MetadataEntry,
    endpoint_host: &Environment,
) -> MetadataResult<ParsedEntry> {
    let invalid_host = |source: AuthorityError| MetadataError::InvalidHost { index, source };

    let network_host = match entry.preferred_network.as_deref() {
        Some(host) => Environment::parse(host).map_err(invalid_host)?,
        None => endpoint_host.clone(),
    };
    let cache_host = match entry.preferred_cache.as_deref() {
        Some(host) => Environment::parse(host).map_err(invalid_host)?,
        None => network_host.clone(),
    };
    let mut aliases: Vec<Environment> = Vec::with_capacity(entry.aliases.len());
    for alias in &entry.aliases {
        let alias = Environment::parse(alias).map_err(invalid_host)?;
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
    }

    Ok(ParsedEntry {
        network_host,
        cache_host,
        aliases,
    })
}
