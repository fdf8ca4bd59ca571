//! # Heartbeat and worker registry.
//!
//! Each pool publishes two TTL-guarded keys and one membership mark:
//! `worker:{id}:heartbeat` (epoch seconds, TTL = heartbeat timeout),
//! `worker:{id}:info` (serialized [`WorkerInfo`], TTL = 2x timeout), and
//! its id in `workers:active`.
//!
//! ## Rules
//! - Only the owning pool writes its record; readers treat missing or
//!   expired data as "unknown"
//! - A missed heartbeat tick extends `last_heartbeat` staleness but never
//!   tears down the pool
//! - Enumeration garbage-collects ids whose info key has expired

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{select, sync::Mutex, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::BrokerError;
use crate::store::{keys, Store};

/// Snapshot of one worker pool, as persisted under `worker:{id}:info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Pool id.
    pub id: String,
    /// Pool state label (`idle`/`busy`/`paused`/`shutting_down`).
    pub state: String,
    /// When the pool started.
    pub started_at: DateTime<Utc>,
    /// Last successful heartbeat write.
    pub last_heartbeat: DateTime<Utc>,
    /// Executions in flight.
    pub active_tasks: usize,
    /// Configured concurrency gate capacity.
    pub concurrency: usize,
}

/// Periodic liveness publisher for one worker pool.
pub struct Heartbeat {
    store: Arc<dyn Store>,
    worker_id: String,
    interval: Duration,
    timeout: Duration,
    info: Mutex<WorkerInfo>,
}

impl Heartbeat {
    /// Creates a heartbeat for `worker_id`.
    pub fn new(
        store: Arc<dyn Store>,
        worker_id: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        let worker_id = worker_id.into();
        let now = Utc::now();
        Self {
            store,
            info: Mutex::new(WorkerInfo {
                id: worker_id.clone(),
                state: "idle".to_string(),
                started_at: now,
                last_heartbeat: now,
                active_tasks: 0,
                concurrency,
            }),
            worker_id,
            interval,
            timeout,
        }
    }

    /// Updates the published pool state label.
    pub async fn update_state(&self, state: &str) {
        self.info.lock().await.state = state.to_string();
    }

    /// Updates the published in-flight count.
    pub async fn update_active_tasks(&self, count: usize) {
        self.info.lock().await.active_tasks = count;
    }

    /// Registers the worker and refreshes liveness until the token fires,
    /// then deregisters.
    pub async fn run(&self, token: CancellationToken) {
        self.register().await;
        info!(worker_id = %self.worker_id, interval = ?self.interval, "heartbeat started");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }

        self.deregister().await;
        info!(worker_id = %self.worker_id, "heartbeat stopped");
    }

    /// One refresh: liveness key, info record, membership mark.
    async fn beat(&self) {
        let now = Utc::now();

        let hb = self
            .store
            .kv_set(
                &keys::worker_heartbeat_key(&self.worker_id),
                &now.timestamp().to_string(),
                Some(self.timeout),
            )
            .await;
        if let Err(e) = hb {
            error!(worker_id = %self.worker_id, error = %e, "failed to send heartbeat");
            return;
        }

        let info_json = {
            let mut info = self.info.lock().await;
            info.last_heartbeat = now;
            serde_json::to_string(&*info)
        };
        if let Ok(json) = info_json {
            if let Err(e) = self
                .store
                .kv_set(
                    &keys::worker_info_key(&self.worker_id),
                    &json,
                    Some(self.timeout * 2),
                )
                .await
            {
                error!(worker_id = %self.worker_id, error = %e, "failed to update worker info");
            }
        }

        self.store
            .set_add(keys::WORKERS_ACTIVE, &self.worker_id)
            .await
            .ok();
    }

    async fn register(&self) {
        self.store
            .set_add(keys::WORKERS_ACTIVE, &self.worker_id)
            .await
            .ok();
        self.beat().await;
    }

    async fn deregister(&self) {
        self.store
            .set_remove(keys::WORKERS_ACTIVE, &self.worker_id)
            .await
            .ok();
        self.store
            .kv_delete(&keys::worker_heartbeat_key(&self.worker_id))
            .await
            .ok();
        self.store
            .kv_delete(&keys::worker_info_key(&self.worker_id))
            .await
            .ok();
    }
}

/// Read/admin side of the worker registry.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn Store>,
}

impl WorkerRegistry {
    /// Creates a registry handle over the store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Enumerates live workers, pruning ids whose info key has expired.
    pub async fn list_live_workers(&self) -> Result<Vec<WorkerInfo>, BrokerError> {
        let ids = self.store.set_members(keys::WORKERS_ACTIVE).await?;
        let mut workers = Vec::with_capacity(ids.len());

        for id in ids {
            match self.store.kv_get(&keys::worker_info_key(&id)).await? {
                Some(data) => {
                    if let Ok(info) = serde_json::from_str::<WorkerInfo>(&data) {
                        workers.push(info);
                    }
                }
                None => {
                    // Info expired: the worker is gone, drop the mark.
                    self.store.set_remove(keys::WORKERS_ACTIVE, &id).await?;
                }
            }
        }
        Ok(workers)
    }

    /// Liveness check on the heartbeat key.
    pub async fn is_alive(&self, worker_id: &str) -> Result<bool, BrokerError> {
        self.store
            .kv_exists(&keys::worker_heartbeat_key(worker_id))
            .await
    }

    /// Remote pause check; presence of the pause key means paused.
    pub async fn is_paused(&self, worker_id: &str) -> Result<bool, BrokerError> {
        self.store
            .kv_exists(&keys::worker_paused_key(worker_id))
            .await
    }

    /// Writes the remote pause key for a worker.
    pub async fn pause(&self, worker_id: &str) -> Result<(), BrokerError> {
        self.store
            .kv_set(&keys::worker_paused_key(worker_id), "1", None)
            .await
    }

    /// Removes the remote pause key, resuming the worker.
    pub async fn resume(&self, worker_id: &str) -> Result<(), BrokerError> {
        self.store
            .kv_delete(&keys::worker_paused_key(worker_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn registry_lists_beating_workers() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let hb = Arc::new(Heartbeat::new(
            store.clone(),
            "w1",
            Duration::from_millis(20),
            Duration::from_millis(200),
            4,
        ));

        let token = CancellationToken::new();
        let handle = {
            let hb = hb.clone();
            let token = token.clone();
            tokio::spawn(async move { hb.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        let registry = WorkerRegistry::new(store.clone());
        assert!(registry.is_alive("w1").await.unwrap());
        let workers = registry.list_live_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id, "w1");
        assert_eq!(workers[0].concurrency, 4);

        token.cancel();
        handle.await.unwrap();

        // Deregistered on stop.
        assert!(!registry.is_alive("w1").await.unwrap());
        assert!(registry.list_live_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_info_is_garbage_collected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set_add(keys::WORKERS_ACTIVE, "ghost").await.unwrap();

        let registry = WorkerRegistry::new(store.clone());
        assert!(registry.list_live_workers().await.unwrap().is_empty());
        assert_eq!(store.set_len(keys::WORKERS_ACTIVE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_the_key() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = WorkerRegistry::new(store);

        assert!(!registry.is_paused("w1").await.unwrap());
        registry.pause("w1").await.unwrap();
        assert!(registry.is_paused("w1").await.unwrap());
        registry.resume("w1").await.unwrap();
        assert!(!registry.is_paused("w1").await.unwrap());
    }
}
