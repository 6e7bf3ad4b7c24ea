//! Resource management

use crate::error::ForecastError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate resources to
/// tasks. Resource management is performed using a Tokio Semaphore.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for computations offloaded from the async runtime.
    tasks: Option<Semaphore>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(task_limit: Option<usize>) -> Self {
        Self {
            tasks: task_limit.map(Semaphore::new),
        }
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<SemaphorePermit>, ForecastError> {
        optional_acquire(&self.tasks).await
    }
}

/// Acquire a permit on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
) -> Result<Option<SemaphorePermit>, ForecastError> {
    if let Some(sem) = sem {
        sem.acquire().await.map(Some).map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
