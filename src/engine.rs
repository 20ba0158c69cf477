use crate::config::EngineConfig;
use crate::db::{Database, StoreError};
use crate::directory::{BusinessDirectory, UserDirectory};
use crate::election::ElectionManager;
use crate::stream::{LocalPubSub, UpdateHub};
use crate::tasks::{LocalJobQueue, RecomputeCoordinator, ResultRecomputer, RESULT_QUEUE_NAME};
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// The wired-up election core: store, update hub, recompute workers and manager.
pub struct Engine {
    manager: Arc<ElectionManager>,
    queue: Arc<LocalJobQueue>,
}

impl Engine {
    pub async fn start(
        config: &EngineConfig,
        businesses: Arc<dyn BusinessDirectory>,
        users: Arc<dyn UserDirectory>,
    ) -> Result<Self, StoreError> {
        let db = Arc::new(Database::connect(&config.database_url, config.database_max_connections).await?);
        let updates = Arc::new(UpdateHub::new(Arc::new(LocalPubSub::new(
            config.update_stream_capacity,
        ))));

        let recomputer = Arc::new(ResultRecomputer::new(Arc::clone(&db), Arc::clone(&updates)));
        let queue = LocalJobQueue::start(
            RESULT_QUEUE_NAME,
            recomputer.clone(),
            config.recompute_workers,
            Duration::from_secs(config.job_retention_secs),
        );
        let coordinator = Arc::new(RecomputeCoordinator::new(queue.clone(), recomputer));

        let manager = ElectionManager::new(db, coordinator, updates, businesses, users)
            .with_active_id_attempts(config.active_id_attempts);
        info!("Election engine started on {}", config.database_url);

        Ok(Self {
            manager: Arc::new(manager),
            queue,
        })
    }

    pub fn manager(&self) -> Arc<ElectionManager> {
        Arc::clone(&self.manager)
    }

    /// Stops taking recompute jobs and waits for the running ones.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
