use std::collections::HashMap;
use std::time::Instant;

use url::Url;

use crate::authority::AuthorityKey;
use crate::record::{InvalidAuthorityRecord, OAuthError};

/// 無効な認可機関の記録
///
/// 認可機関のキーをキー、無効な認可機関のレコードを値に持つ。
/// 有効なレコードとは別に保持し、同じキーの有効なレコードが存在しても、こちらの判定を優先する。
#[derive(Debug, Default)]
pub(crate) struct InvalidAuthorityTracker {
    records: HashMap<AuthorityKey, InvalidAuthorityRecord>,
}

impl InvalidAuthorityTracker {
    /// 無効な認可機関を登録する。
    ///
    /// 同じキーのレコードが既に存在する場合は置き換え、置き換えたレコードを返す。
    pub(crate) fn record(
        &mut self,
        key: AuthorityKey,
        authority: Url,
        error: OAuthError,
    ) -> Option<InvalidAuthorityRecord> {
        self.records.insert(
            key,
            InvalidAuthorityRecord {
                authority,
                error,
                recorded_at: Instant::now(),
            },
        )
    }

    pub(crate) fn get(&self, key: &AuthorityKey) -> Option<&InvalidAuthorityRecord> {
        self.records.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_twice_replaces_the_error() {
        let url = Url::parse("https://login.contoso.com/tenant").unwrap();
        let key = AuthorityKey::from_url(&url).unwrap();
        let mut tracker = InvalidAuthorityTracker::default();

        let previous = tracker.record(
            key.clone(),
            url.clone(),
            OAuthError::new("invalid_instance", "first"),
        );
        assert!(previous.is_none());

        let previous = tracker.record(
            key.clone(),
            url.clone(),
            OAuthError::new("invalid_request", "second"),
        );
        assert_eq!(previous.unwrap().error.code, "invalid_instance");
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(&key).unwrap().error.code, "invalid_request");
    }
}
