//! 認可機関キャッシュ
//!
//! 認可機関（authority）のホストを、ネットワーク呼び出しに使用するホスト、トークンキャッシュのキーに使用するホスト、
//! および同一視されるホストに解決する。
//!
//! 既知のクラウドインスタンスは構築時に登録され、それ以外の認可機関はインスタンスディスカバリーで取得した
//! メタデータから登録される。
pub mod authority;
pub mod cache;
pub mod cloud_instance;
pub mod discovery;
mod invalid;
pub mod metadata;
pub mod record;
pub mod resolver;

pub use authority::{Authority, AuthorityError, AuthorityKey, Environment};
pub use cache::{AuthorityCache, AuthorityCacheError, AuthorityCacheResult};
pub use cloud_instance::{CloudInstance, CloudInstanceTable};
pub use discovery::{DiscoveryError, DiscoveryOutcome, InstanceDiscoveryClient, RetryConfig};
pub use record::{AuthorityCacheRecord, InvalidAuthorityRecord, OAuthError, RecordSource};
pub use resolver::{
    AuthorityResolver, AuthorityResolverBuilder, ResolveError, ResolveResult, ResolvedAuthority,
};
