use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::authority::Environment;
use crate::cloud_instance::CloudInstance;

/// 認可機関キャッシュレコードの出所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// クラウドインスタンス表から作成した
    CloudInstance,
    /// インスタンスメタデータから作成した
    Metadata,
}

/// 認可機関キャッシュレコード
///
/// ストアに登録した後は変更しない。更新する場合は新しいレコードで置き換える。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityCacheRecord {
    /// 認可機関の検証に成功しているかどうか
    validated: bool,
    /// ネットワーク呼び出しに使用するホスト
    network_host: Environment,
    /// トークンキャッシュのキーに使用するホスト
    cache_host: Environment,
    /// 同一視されるホスト（キャッシュを検索する優先順）
    aliases: Vec<Environment>,
    /// レコードを作成した時刻
    validated_at: Instant,
    /// レコードの出所
    source: RecordSource,
}

impl AuthorityCacheRecord {
    /// クラウドインスタンスからレコードを作成する。
    ///
    /// クラウドインスタンス表は信頼できるため、常に検証済みとする。
    pub fn from_cloud_instance(instance: &CloudInstance) -> Self {
        Self {
            validated: true,
            network_host: instance.preferred_network().clone(),
            cache_host: instance.preferred_cache().clone(),
            aliases: instance.aliases().to_vec(),
            validated_at: Instant::now(),
            source: RecordSource::CloudInstance,
        }
    }

    /// インスタンスメタデータからレコードを作成する。
    ///
    /// # Arguments
    ///
    /// * `network_host` - ネットワーク呼び出しに使用するホスト
    /// * `cache_host` - トークンキャッシュのキーに使用するホスト
    /// * `aliases` - 同一視されるホスト
    pub fn from_metadata(
        network_host: Environment,
        cache_host: Environment,
        aliases: Vec<Environment>,
    ) -> Self {
        Self {
            validated: true,
            network_host,
            cache_host,
            aliases,
            validated_at: Instant::now(),
            source: RecordSource::Metadata,
        }
    }

    pub fn validated(&self) -> bool {
        self.validated
    }

    pub fn network_host(&self) -> &Environment {
        &self.network_host
    }

    pub fn cache_host(&self) -> &Environment {
        &self.cache_host
    }

    pub fn aliases(&self) -> &[Environment] {
        &self.aliases
    }

    pub fn validated_at(&self) -> Instant {
        self.validated_at
    }

    pub fn source(&self) -> RecordSource {
        self.source
    }

    pub fn has_alias(&self, environment: &Environment) -> bool {
        self.aliases.contains(environment)
    }
}

/// OAuthエラー
///
/// トークンエンドポイントやインスタンスディスカバリーが返すエラーレスポンスの
/// `{"error": ..., "error_description": ...}`に対応する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthError {
    /// エラーコード（`invalid_instance`など）
    #[serde(rename = "error")]
    pub code: String,
    /// エラーの説明
    #[serde(rename = "error_description", default)]
    pub description: String,
}

impl OAuthError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.description)
        }
    }
}

/// 無効な認可機関のレコード
///
/// 一度登録すると、プロセスが終了するまで削除されない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAuthorityRecord {
    /// 無効と判定された認可機関
    pub authority: Url,
    /// 無効と判定したOAuthエラー
    pub error: OAuthError,
    /// 登録した時刻
    pub recorded_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_error_reads_wire_field_names() {
        let error: OAuthError = serde_json::from_str(
            r#"{"error":"invalid_instance","error_description":"AADSTS50049: Unknown or invalid instance."}"#,
        )
        .unwrap();
        assert_eq!(error.code, "invalid_instance");
        assert_eq!(error.description, "AADSTS50049: Unknown or invalid instance.");

        let error: OAuthError = serde_json::from_str(r#"{"error":"invalid_request"}"#).unwrap();
        assert_eq!(error.to_string(), "invalid_request");
    }
}
