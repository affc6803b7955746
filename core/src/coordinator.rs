use std::sync::Arc;

use leaseq_config::{CoordSettings, validate_settings};
use tracing::info;

use crate::atomics::AtomicOps;
use crate::error::{CoordError, Result};
use crate::keys::KeySpace;
use crate::lock::{LockManager, LockOptions};
use crate::queue::JobQueue;
use crate::scripts::ScriptLibrary;
use crate::store::{KeyValueStore, RedisStore, summarize_redis_dsn};

/// Entry point: one store connection shared by the queue, locks and atomics.
#[derive(Clone)]
pub struct Coordinator {
    settings: Arc<CoordSettings>,
    scripts: ScriptLibrary,
    queue: JobQueue,
    locks: LockManager,
    atomics: AtomicOps,
}

impl Coordinator {
    /// Connects to `settings.redis_dsn` and registers every script.
    pub async fn connect(settings: CoordSettings) -> Result<Self> {
        validate_settings(&settings).map_err(|err| CoordError::InvalidArgument(err.to_string()))?;
        let store = RedisStore::connect(&settings.redis_dsn).await?;
        info!(
            redis = %summarize_redis_dsn(&settings.redis_dsn),
            key_prefix = %settings.key_prefix,
            "coordinator connected"
        );
        Self::with_store(settings, Arc::new(store)).await
    }

    pub async fn with_store(settings: CoordSettings, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let settings = Arc::new(settings);
        let keys = KeySpace::new(settings.key_prefix.clone());
        let scripts = ScriptLibrary::new(store);
        scripts.register_all().await?;

        let queue = JobQueue::new(scripts.clone(), keys.clone(), settings.clone());
        let locks = LockManager::new(
            scripts.clone(),
            keys.clone(),
            LockOptions::from_settings(&settings.lock),
        );
        let atomics = AtomicOps::new(scripts.clone(), keys);
        Ok(Self {
            settings,
            scripts,
            queue,
            locks,
            atomics,
        })
    }

    pub fn settings(&self) -> &CoordSettings {
        &self.settings
    }

    pub fn scripts(&self) -> &ScriptLibrary {
        &self.scripts
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn atomics(&self) -> &AtomicOps {
        &self.atomics
    }

    pub async fn ping(&self) -> Result<()> {
        self.scripts.store().ping().await
    }
}
