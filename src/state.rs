// src/state.rs
use std::sync::Arc;

use crate::config::Config;
use crate::identity::IdentityResolver;
use crate::live::{Broadcaster, Registry};
use crate::store::VoteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VoteStore>,
    pub live: Broadcaster,
    pub identity: Arc<IdentityResolver>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: Arc<dyn VoteStore>, config: Config) -> Self {
        let registry = Registry::new(config.live.idle_timeout, config.live.buffer);
        let identity = IdentityResolver::new(&config.jwt_secret, config.trust_forwarded_for);

        Self {
            live: Broadcaster::new(store.clone(), registry),
            store,
            identity: Arc::new(identity),
            config: Arc::new(config),
        }
    }
}
