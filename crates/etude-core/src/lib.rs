// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resource;
pub mod signal;
pub mod slab;
pub mod store;
pub mod sync;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::Config;
pub use error::{EtudeError, EtudeResult};
pub use pool::{PoolError, ResourcePool};
pub use reactor::Reactor;
pub use store::{Backend, BackendConfig, MemoryBackend, UserStore};
