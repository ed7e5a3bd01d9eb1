use std::sync::Arc;

use ledger::{
    Ledger, StoreError,
    auth::AuthService,
    memory::{MemoryBlobStore, MemoryIdentity, MemoryStore},
    ports::{BlobStore, Clock, DocumentStore, IdentityProvider, SystemClock},
};
use tracing::info;

use super::{
    config::{Backend, Config},
    database::RedisStore,
    identity::HttpIdentityProvider,
    storage::HttpBlobStore,
};

pub struct State {
    pub config: Config,
    pub ledger: Ledger,
    pub auth: AuthService,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        info!("Using {} backend", config.backend);

        let state = match config.backend {
            Backend::Redis => {
                let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
                let blobs = Arc::new(HttpBlobStore::new(
                    &config.blob_url,
                    &config.blob_public_url,
                    config.blob_token.clone(),
                ));
                let identity = Arc::new(HttpIdentityProvider::new(&config.identity_url));

                Self::from_parts(config, store, blobs, identity, Arc::new(SystemClock))
            }
            Backend::Memory => {
                let blobs = Arc::new(MemoryBlobStore::new(&config.blob_public_url));

                Self::from_parts(
                    config,
                    Arc::new(MemoryStore::default()),
                    blobs,
                    Arc::new(MemoryIdentity::default()),
                    Arc::new(SystemClock),
                )
            }
        };

        Ok(state)
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger: Ledger::new(store.clone(), blobs, clock.clone()),
            auth: AuthService::new(identity, store, clock),
            config,
        })
    }
}
