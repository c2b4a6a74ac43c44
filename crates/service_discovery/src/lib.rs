//! # Service Discovery
//!
//! Lets backend processes find sibling services whose membership changes at
//! runtime, and spread calls across them.
//!
//! Instances publish themselves in a [`CoordinationStore`] as
//! `root/serviceName/instanceId -> address`. A [`ServicePool`] keeps one
//! connection per accepted instance, follows changes through a store watch
//! and offers:
//!
//! * round-robin selection with [`ServicePool::get_service`]
//! * selection by instance id with [`ServicePool::get_service_with_id`]
//! * addition notifications with [`ServicePool::register_callback`]
//!
//! ```no_run
//! use service_discovery::{DiscoveryConfig, MemoryStore, ServicePool, TcpDialer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), service_discovery::DiscoveryError> {
//! let store = MemoryStore::new();
//! store.set("/backends/snowflake/s1", "127.0.0.1:50003")?;
//!
//! let pool = ServicePool::start(
//!     Arc::new(store.clone()),
//!     TcpDialer::new(Duration::from_secs(3)),
//!     DiscoveryConfig::default(),
//! )
//! .await;
//! let snowflake = pool.get_service("snowflake");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dialer;
pub mod error;
pub mod memory;
pub mod pool;
pub mod store;

pub use config::DiscoveryConfig;
pub use dialer::{Dialer, ServiceConnection, TcpDialer};
pub use error::DiscoveryError;
pub use memory::MemoryStore;
pub use pool::ServicePool;
pub use store::{CoordinationStore, Node, Snapshot, WatchAction, WatchEvent, WatchStream};
