use serde::Deserialize;
use url::Url;

/// 認可機関（authority）関連の処理の結果型
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// 認可機関関連のエラー
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    /// URLとして解析できない
    #[error("Failed to parse authority URL {1}: {0}")]
    InvalidUrl(url::ParseError, String),

    /// 認可機関のスキームがhttpsではない
    #[error("Authority must use https: {0}")]
    UnsupportedScheme(Url),

    /// URLにホストが含まれていない
    #[error("Authority has no host: {0}")]
    MissingHost(Url),

    /// 環境（ホスト）として解釈できない文字列
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),
}

/// 環境
///
/// クラウドインスタンスへの入口となるホスト名で、小文字に正規化される。
/// スキームの既定ポート以外のポートを使用する場合は`host:port`の形式で保持する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Environment(String);

impl Environment {
    /// 文字列から環境を作成する。
    ///
    /// # Arguments
    ///
    /// * `value` - `host`または`host:port`形式の文字列
    ///
    /// # Returns
    ///
    /// * 小文字に正規化した環境、またはエラー
    pub fn parse(value: &str) -> AuthorityResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty()
            || trimmed.contains(['/', '?', '#', '@', '\\'])
            || trimmed.chars().any(char::is_whitespace)
        {
            return Err(AuthorityError::InvalidEnvironment(value.to_string()));
        }
        let url = Url::parse(&format!("https://{trimmed}"))
            .map_err(|_| AuthorityError::InvalidEnvironment(value.to_string()))?;
        Self::from_url(&url).ok_or_else(|| AuthorityError::InvalidEnvironment(value.to_string()))
    }

    /// URLのホスト部分から環境を作成する。
    ///
    /// ホストを持たないURLの場合は`None`を返す。
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str().filter(|host| !host.is_empty())?;
        let host = host.to_ascii_lowercase();
        Some(match url.port() {
            Some(port) => Self(format!("{host}:{port}")),
            None => Self(host),
        })
    }

    /// 組み込みのクラウドインスタンス表など、検証済みの値から環境を作成する。
    pub(crate) fn from_static(value: &'static str) -> Self {
        Self(value.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ホストとポートに分割する。
    fn host_and_port(&self) -> (&str, Option<u16>) {
        match self.0.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (&self.0, None),
            },
            _ => (&self.0, None),
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 認可機関のキー
///
/// 小文字のホスト（必要な場合はポートを含む）と、小文字のパスの最初のセグメント（テナント）を
/// `/`で連結したもの。パスのセグメントが存在しない場合はホストのみとなる。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorityKey(String);

impl AuthorityKey {
    pub fn from_url(url: &Url) -> Option<Self> {
        let environment = Environment::from_url(url)?;
        Some(match first_path_segment(url) {
            Some(tenant) => Self(format!("{}/{}", environment, tenant.to_lowercase())),
            None => Self(environment.0),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AuthorityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 認可機関
///
/// `https://host/tenant`の形式に正規化したURLを保持する。
/// クエリ、フラグメントおよびテナントより後のパスは取り除かれる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    url: Url,
    environment: Environment,
}

impl Authority {
    /// 文字列から認可機関を作成する。
    ///
    /// # Arguments
    ///
    /// * `value` - 認可機関のURL文字列
    ///
    /// # Returns
    ///
    /// * 正規化した認可機関、またはエラー
    pub fn parse(value: &str) -> AuthorityResult<Self> {
        let url = Url::parse(value.trim())
            .map_err(|e| AuthorityError::InvalidUrl(e, value.to_string()))?;
        Self::from_url(&url)
    }

    /// URLから認可機関を作成する。
    pub fn from_url(url: &Url) -> AuthorityResult<Self> {
        if url.scheme() != "https" {
            return Err(AuthorityError::UnsupportedScheme(url.clone()));
        }
        let environment =
            Environment::from_url(url).ok_or_else(|| AuthorityError::MissingHost(url.clone()))?;
        let path = match first_path_segment(url) {
            Some(tenant) => format!("/{tenant}"),
            None => String::new(),
        };

        let mut normalized = url.clone();
        normalized.set_query(None);
        normalized.set_fragment(None);
        normalized.set_path(&path);
        Ok(Self {
            url: normalized,
            environment,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// テナント（パスの最初のセグメント）
    pub fn tenant(&self) -> Option<&str> {
        first_path_segment(&self.url)
    }

    pub fn key(&self) -> AuthorityKey {
        match self.tenant() {
            Some(tenant) => AuthorityKey(format!("{}/{}", self.environment, tenant.to_lowercase())),
            None => AuthorityKey(self.environment.0.clone()),
        }
    }

    /// 認可機関の認可エンドポイント
    ///
    /// インスタンスディスカバリーの`authorization_endpoint`パラメーターに使用する。
    pub fn authorization_endpoint(&self) -> Url {
        let mut endpoint = self.url.clone();
        if let Ok(mut segments) = endpoint.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["oauth2", "v2.0", "authorize"]);
        }
        endpoint
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// URLのホストを、指定した環境に置き換えたURLを返す。
///
/// ホストを置き換えられないURL（`data:`など）の場合は、入力したURLをそのまま返す。
///
/// # Arguments
///
/// * `url` - 置き換え元のURL
/// * `environment` - 置き換え後の環境
///
/// # Returns
///
/// ホストとポートを置き換えたURL
pub fn url_with_environment(url: &Url, environment: &Environment) -> Url {
    let (host, port) = environment.host_and_port();
    let mut rewritten = url.clone();
    if rewritten.set_host(Some(host)).is_err() || rewritten.set_port(port).is_err() {
        tracing::warn!(url = %url, environment = %environment, "Failed to rewrite URL host");
        return url.clone();
    }
    rewritten
}

fn first_path_segment(url: &Url) -> Option<&str> {
    url.path_segments()?.find(|segment| !segment.is_empty())
}
