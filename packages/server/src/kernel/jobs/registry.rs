//! Worker registry: lazy, race-free resolution of pipeline identifiers to
//! singleton executors.
//!
//! Descriptors are registered at startup; executors are built on first use.
//! Concurrent `get` calls for the same new id share one initialization
//! future, so exactly one factory invocation observes its result; a
//! duplicate instance produced by a race is disposed of via the atomic
//! check-and-set on publication. Unknown pipelines fail fast before any
//! future is created, and failed initializations remove their pending entry
//! so nothing errored is left parked in the shared map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::executor::{ExecutorOptions, ExecutorStats, JobExecutor};
use super::repository::JobRepository;
use super::worker::WorkerDescriptor;
use crate::kernel::event_hub::EventHub;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("unknown pipeline: {pipeline_id}")]
    UnknownPipeline {
        pipeline_id: String,
        known: Vec<String>,
    },

    #[error("failed to initialize pipeline {pipeline_id}: {reason}")]
    InitFailed { pipeline_id: String, reason: String },
}

type InitResult = Result<Arc<JobExecutor>, RegistryError>;
type InitFuture = Shared<BoxFuture<'static, InitResult>>;

/// Pipeline summary for the API surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineInfo {
    pub id: String,
    pub name: String,
    /// Whether the executor has been instantiated.
    pub registered: bool,
}

#[derive(Default)]
struct RegistryMaps {
    cache: HashMap<String, Arc<JobExecutor>>,
    pending: HashMap<String, InitFuture>,
}

pub struct WorkerRegistry {
    descriptors: HashMap<String, WorkerDescriptor>,
    maps: Mutex<RegistryMaps>,
    repository: Arc<JobRepository>,
    events: EventHub,
    defaults: ExecutorOptions,
}

impl WorkerRegistry {
    pub fn new(
        repository: Arc<JobRepository>,
        events: EventHub,
        defaults: ExecutorOptions,
    ) -> Self {
        Self {
            descriptors: HashMap::new(),
            maps: Mutex::new(RegistryMaps::default()),
            repository,
            events,
            defaults,
        }
    }

    /// Register a pipeline descriptor. Startup-only; the registry is not
    /// mutated afterwards.
    pub fn register(&mut self, descriptor: WorkerDescriptor) {
        self.descriptors
            .insert(descriptor.pipeline_id.clone(), descriptor);
    }

    pub fn is_registered(&self, pipeline_id: &str) -> bool {
        self.descriptors.contains_key(pipeline_id)
    }

    pub fn known_pipelines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.descriptors.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pipelines(&self) -> Vec<PipelineInfo> {
        let maps = self.maps.lock().unwrap();
        let mut infos: Vec<PipelineInfo> = self
            .descriptors
            .values()
            .map(|descriptor| PipelineInfo {
                id: descriptor.pipeline_id.clone(),
                name: descriptor.name.clone(),
                registered: maps.cache.contains_key(&descriptor.pipeline_id),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Stats for every instantiated executor.
    pub fn stats(&self) -> HashMap<String, ExecutorStats> {
        let maps = self.maps.lock().unwrap();
        maps.cache
            .iter()
            .map(|(id, executor)| (id.clone(), executor.stats()))
            .collect()
    }

    /// Resolve a pipeline id to its singleton executor, initializing lazily.
    pub async fn get(&self, pipeline_id: &str) -> Result<Arc<JobExecutor>, RegistryError> {
        let init = {
            let mut maps = self.maps.lock().unwrap();
            if let Some(executor) = maps.cache.get(pipeline_id) {
                return Ok(executor.clone());
            }
            if let Some(pending) = maps.pending.get(pipeline_id) {
                pending.clone()
            } else {
                // Fail fast before creating any future: nothing errored may
                // be parked in the pending map.
                let Some(descriptor) = self.descriptors.get(pipeline_id) else {
                    return Err(RegistryError::UnknownPipeline {
                        pipeline_id: pipeline_id.to_string(),
                        known: self.known_pipelines(),
                    });
                };

                let future = self.init_future(descriptor);
                maps.pending.insert(pipeline_id.to_string(), future.clone());
                future
            }
        };

        // The factory runs off-lock; every concurrent caller awaits the same
        // shared future.
        match init.await {
            Ok(executor) => {
                let existing = {
                    let mut maps = self.maps.lock().unwrap();
                    maps.pending.remove(pipeline_id);
                    match maps.cache.get(pipeline_id) {
                        Some(existing) => Some(existing.clone()),
                        None => {
                            maps.cache
                                .insert(pipeline_id.to_string(), executor.clone());
                            None
                        }
                    }
                };

                match existing {
                    Some(existing) if !Arc::ptr_eq(&existing, &executor) => {
                        // A concurrent resolution won the publication race;
                        // dispose of the duplicate instance.
                        warn!(pipeline_id = %pipeline_id, "disposing duplicate executor instance");
                        tokio::spawn(async move { executor.shutdown(Duration::ZERO).await });
                        Ok(existing)
                    }
                    Some(existing) => Ok(existing),
                    None => {
                        info!(pipeline_id = %pipeline_id, "executor initialized");
                        Ok(executor)
                    }
                }
            }
            Err(init_error) => {
                // Remove the pending entry so a later call can retry.
                self.maps.lock().unwrap().pending.remove(pipeline_id);
                error!(pipeline_id = %pipeline_id, error = %init_error, "executor initialization failed");
                Err(init_error)
            }
        }
    }

    fn init_future(&self, descriptor: &WorkerDescriptor) -> InitFuture {
        let factory = descriptor.factory.clone();
        let pipeline_id = descriptor.pipeline_id.clone();
        let options = descriptor
            .options
            .clone()
            .unwrap_or_else(|| self.defaults.clone());
        let repository = self.repository.clone();
        let events = self.events.clone();

        async move {
            let worker = factory().await.map_err(|e| RegistryError::InitFailed {
                pipeline_id: pipeline_id.clone(),
                reason: format!("{e:#}"),
            })?;
            Ok(JobExecutor::start(
                pipeline_id,
                worker,
                repository,
                events,
                options,
            ))
        }
        .boxed()
        .shared()
    }

    /// Shut down every cached executor concurrently and clear the cache.
    /// Workers without a meaningful `shutdown` are tolerated (the default
    /// hook is a no-op).
    pub async fn shutdown_all(&self, grace: Duration) {
        let executors: Vec<Arc<JobExecutor>> = {
            let mut maps = self.maps.lock().unwrap();
            maps.pending.clear();
            maps.cache.drain().map(|(_, executor)| executor).collect()
        };

        if executors.is_empty() {
            return;
        }
        info!(count = executors.len(), "shutting down executors");
        futures::future::join_all(
            executors
                .iter()
                .map(|executor| executor.shutdown(grace)),
        )
        .await;
    }
}
