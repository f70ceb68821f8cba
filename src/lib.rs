pub mod catalog;
pub mod cli;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod distance;
pub mod indexer;
pub mod manager;
pub mod persist;
pub mod pool;
pub mod signature;
pub mod utils;

pub use catalog::{Catalog, Entry};
pub use config::{CatalogConfig, Opts};
pub use indexer::{CatalogIndexer, IndexReport, IndexingConfig};
pub use manager::IndexingOptions;
pub use persist::CatalogPersistence;
pub use pool::{TaskError, TaskHandle, WorkerPool};
pub use signature::Signature;
