use std::sync::Arc;

use authority_cache::{AuthorityCache, AuthorityResolver};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<AuthorityResolver>,
}

impl AppState {
    pub fn cache(&self) -> &AuthorityCache {
        self.resolver.cache()
    }
}
