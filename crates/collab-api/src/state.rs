use std::sync::Arc;

use collab_db::Database;
use collab_gateway::publisher::SponsorshipPublisher;
use collab_gateway::registry::Registry;
use collab_gateway::router::MessageRouter;
use collab_gateway::store::Store;

pub type AppState = Arc<AppStateInner>;

/// Composition root: one store, one registry, and every component that
/// shares them.
pub struct AppStateInner {
    pub store: Store,
    pub registry: Registry,
    pub router: MessageRouter,
    pub publisher: SponsorshipPublisher,
}

impl AppStateInner {
    pub fn new(db: Database, jwt_secret: &str) -> AppState {
        let store = Store::new(Arc::new(db));
        let registry = Registry::new();
        Arc::new(Self {
            router: MessageRouter::new(store.clone(), registry.clone(), jwt_secret),
            publisher: SponsorshipPublisher::new(registry.clone()),
            store,
            registry,
        })
    }
}
