use std::{sync::Arc, time::Duration};

use crate::{
    cache::{LocalCache, SettingsHandle},
    config::Config,
    extract::ExtractClient,
    images::ImageClient,
    store::{DocumentStore, RedisStore},
    sync::SyncBridge,
};

pub struct AppState {
    pub config: Config,
    pub settings: Arc<SettingsHandle>,
    pub bridge: Arc<SyncBridge>,
    pub images: ImageClient,
    pub extract: ExtractClient,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let cache = Arc::new(LocalCache::new(&config.data_dir));
        let settings = Arc::new(SettingsHandle::load(cache.clone()));
        let store: Arc<dyn DocumentStore> = Arc::new(RedisStore::connect(&config.redis_url).await);

        let bridge = SyncBridge::new(
            store,
            cache,
            settings.clone(),
            Duration::from_millis(config.debounce_ms),
        );
        // Pick the shared list back up if this device was already a member.
        bridge.resume().await;

        let images = ImageClient::new(&config);
        let extract = ExtractClient::new(&config);

        Arc::new(Self {
            config,
            settings,
            bridge,
            images,
            extract,
        })
    }
}
