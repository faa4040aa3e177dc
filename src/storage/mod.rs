//! Storage backends for endpoints, check results, streams and metrics
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with embedded migrations
//! - **In-Memory**: No persistence, for testing or `backend: none`
//!
//! ## Usage
//!
//! ```no_run
//! use api_monitor::config::StorageConfig;
//! use api_monitor::storage::Storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Storage::open(&StorageConfig::default()).await?;
//!     let endpoints = storage.repository.get_active_endpoints().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{
    EndpointCounts, EndpointRepository, MetricAggregate, MetricsStore, ResultStats, StreamEntry,
    StreamSink,
};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;

use crate::config::StorageConfig;

/// The three storage contracts, served by one backend
#[derive(Clone)]
pub struct Storage {
    pub repository: Arc<dyn EndpointRepository>,
    pub streams: Arc<dyn StreamSink>,
    pub metrics: Arc<dyn MetricsStore>,
}

impl Storage {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EndpointRepository + StreamSink + MetricsStore + 'static,
    {
        Self {
            repository: backend.clone(),
            streams: backend.clone(),
            metrics: backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryBackend::new()))
    }

    /// Open the configured backend
    pub async fn open(config: &StorageConfig) -> StorageResult<Self> {
        match config {
            StorageConfig::None => {
                info!("using in-memory storage, nothing is persisted");
                Ok(Self::in_memory())
            }

            #[cfg(feature = "storage-sqlite")]
            StorageConfig::Sqlite { path } => {
                let backend = sqlite::SqliteBackend::new(path).await?;
                Ok(Self::from_backend(Arc::new(backend)))
            }

            #[cfg(not(feature = "storage-sqlite"))]
            StorageConfig::Sqlite { path } => {
                tracing::warn!(
                    "SQLite support not compiled in, ignoring {} and using in-memory storage",
                    path.display()
                );
                Ok(Self::in_memory())
            }
        }
    }
}
