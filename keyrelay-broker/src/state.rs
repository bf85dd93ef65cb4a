use std::sync::Arc;

use crate::auth::TokenRegistry;
use keyrelay_core::Broker;

pub type SharedBroker = Arc<Broker>;
pub type SharedTokens = Arc<TokenRegistry>;

#[derive(Clone)]
pub struct AppState {
    pub broker: SharedBroker,
    pub tokens: SharedTokens,
}

impl AppState {
    pub fn new(broker: SharedBroker, tokens: SharedTokens) -> Self {
        Self { broker, tokens }
    }
}
