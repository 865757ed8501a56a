//! # dirsearch-broker
//!
//! Federated directory-search broker. A client opens a session on a logical search target and
//! the broker fans its queries out over the role's ordered search path, returning a single
//! paginated result stream.
//!
//! ## Modules
//!
//! - [`broker`] - The [`Broker`] and its builder
//! - [`session`] - Search sessions and their pagination state machine
//! - [`search_config`] - Per-role search path, policy and reachability
//! - [`path`] - Ordered node lists with reachability flags
//! - [`prober`] - Background reachability prober
//! - [`policy_store`] - Persisted per-role policy
//! - [`persistence`] - Named blob storage
//! - [`markers`] - Active-policy marker files
//! - [`augment`] - Attribute augmentation from a companion node
//! - [`discovery`] - Network node discovery
//! - [`routing`] - Node-name prefix routing across backends
//! - [`events`] - Change notifications
//! - [`plugin`] - Host plugin surface
//!
//! ## Example
//!
//! ```no_run
//! use dirsearch_broker::{Broker, PageRequest};
//! use dirsearch_core::config::BrokerConfig;
//! use dirsearch_core::memory::MemoryDirectory;
//! use dirsearch_core::query::RecordQuery;
//! use std::sync::Arc;
//!
//! # async fn example() -> dirsearch_core::Result<()> {
//! let broker = Broker::builder(BrokerConfig::default())
//!     .with_directory(Arc::new(MemoryDirectory::new()))
//!     .build()?;
//! broker.initialize().await?;
//!
//! let session = broker.open_search("/Search", 501).await?;
//! let page = broker
//!     .get_record_list(session, RecordQuery::new(), PageRequest::new(64 * 1024))
//!     .await?;
//! println!("{} records", page.records.len());
//! broker.close_search(session).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod augment;
pub mod broker;
mod continuation;
pub mod discovery;
pub mod events;
pub mod markers;
pub mod path;
pub mod persistence;
pub mod plugin;
pub mod policy_store;
pub mod prober;
pub mod routing;
pub mod search_config;
pub mod session;

pub use broker::{Broker, BrokerBuilder, NodeInfo};
pub use discovery::{DiscoveryProxy, DiscoveryStatus, NodeDiscovery, StaticDiscovery};
pub use events::{BrokerEvent, BrokerEvents, EventLog, LoggingEvents};
pub use persistence::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use plugin::{DirectoryPlugin, PluginState, Request, Response};
pub use policy_store::{AugmentConfig, FilePolicyStore, PolicyRecord, PolicyStore};
pub use routing::RoutingDirectory;
pub use search_config::SearchConfig;
pub use session::{PageRequest, SearchPage, SearchSession};
