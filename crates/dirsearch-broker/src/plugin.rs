//! Host plugin surface.
//!
//! A directory-services host drives the broker through [`DirectoryPlugin`]: it validates and
//! initializes the plugin once, forwards client calls as [`Request`]s, toggles its state, runs
//! the periodic task on a timer and finally shuts it down.

use crate::broker::{Broker, NodeInfo};
use crate::policy_store::AugmentConfig;
use crate::session::{PageRequest, SearchPage};
use async_trait::async_trait;
use dirsearch_core::ids::{ContinuationId, SessionId};
use dirsearch_core::query::{AttributeQuery, RecordQuery};
use dirsearch_core::types::{SearchPolicy, SearchRole};
use dirsearch_core::Result;
use serde::{Deserialize, Serialize};

/// Whether the plugin serves requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Requests are served.
    Active,
    /// Requests fail with `ServiceUnavailable`.
    Inactive,
}

/// A client call forwarded by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Open a session on a search target.
    OpenSearch {
        /// Target name, e.g. `/Search`
        target: String,
        /// Uid of the caller
        caller_uid: u32,
    },
    /// Close a session.
    CloseSearch {
        /// Session handle
        session: SessionId,
    },
    /// List records.
    GetRecordList {
        /// Session handle
        session: SessionId,
        /// Filters
        query: RecordQuery,
        /// Paging
        page: PageRequest,
    },
    /// Search by attribute value.
    SearchByAttributeValue {
        /// Session handle
        session: SessionId,
        /// Filters
        query: AttributeQuery,
        /// Paging
        page: PageRequest,
    },
    /// Drop a continuation.
    ReleaseContinuation {
        /// Session handle
        session: SessionId,
        /// Continuation to drop
        continuation: ContinuationId,
    },
    /// Describe a session's search path.
    GetNodeInfo {
        /// Session handle
        session: SessionId,
    },
    /// Switch a role's policy.
    SetPolicy {
        /// Role
        role: SearchRole,
        /// New policy
        policy: SearchPolicy,
    },
    /// Replace a role's custom nodes.
    SetCustomNodes {
        /// Role
        role: SearchRole,
        /// Node names
        nodes: Vec<String>,
    },
    /// Replace a role's augmentation settings.
    SetAugmentation {
        /// Role
        role: SearchRole,
        /// Settings
        augmentation: AugmentConfig,
    },
    /// List a role's unreachable nodes.
    GetUnreachableNodes {
        /// Role
        role: SearchRole,
    },
    /// The network configuration changed.
    NetworkTransition,
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    /// A session was opened.
    Opened {
        /// Session handle
        session: SessionId,
    },
    /// Records of one call.
    Page(SearchPage),
    /// Node info of a session.
    NodeInfo(NodeInfo),
    /// Result of a policy or node-list change.
    PolicyUpdated {
        /// Whether the search path changed
        changed: bool,
    },
    /// Unreachable nodes of a role.
    UnreachableNodes {
        /// Node names
        nodes: Vec<String>,
    },
    /// The request succeeded without a payload.
    Done,
}

/// Lifecycle and request entry points a directory-services host calls.
#[async_trait]
pub trait DirectoryPlugin: Send + Sync {
    /// Checks the plugin's configuration before it is initialized.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the plugin cannot run.
    fn validate(&self) -> Result<()>;

    /// Loads state and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot start.
    async fn initialize(&self) -> Result<()>;

    /// Handles one client call.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    async fn process_request(&self, request: Request) -> Result<Response>;

    /// Starts or stops serving requests.
    fn set_state(&self, state: PluginState);

    /// Runs periodic housekeeping.
    async fn periodic_task(&self);

    /// Releases every resource.
    async fn shutdown(&self);
}

#[async_trait]
impl DirectoryPlugin for Broker {
    fn validate(&self) -> Result<()> {
        Broker::validate(self)
    }

    async fn initialize(&self) -> Result<()> {
        Broker::initialize(self).await
    }

    async fn process_request(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::OpenSearch { target, caller_uid } => Response::Opened {
                session: self.open_search(&target, caller_uid).await?,
            },
            Request::CloseSearch { session } => {
                self.close_search(session).await?;
                Response::Done
            }
            Request::GetRecordList {
                session,
                query,
                page,
            } => Response::Page(self.get_record_list(session, query, page).await?),
            Request::SearchByAttributeValue {
                session,
                query,
                page,
            } => Response::Page(self.search_by_attribute_value(session, query, page).await?),
            Request::ReleaseContinuation {
                session,
                continuation,
            } => {
                self.release_continuation(session, continuation).await?;
                Response::Done
            }
            Request::GetNodeInfo { session } => Response::NodeInfo(self.get_node_info(session).await?),
            Request::SetPolicy { role, policy } => Response::PolicyUpdated {
                changed: self.set_policy(role, policy).await?,
            },
            Request::SetCustomNodes { role, nodes } => Response::PolicyUpdated {
                changed: self.set_custom_nodes(role, nodes).await?,
            },
            Request::SetAugmentation { role, augmentation } => {
                self.set_augmentation(role, augmentation).await?;
                Response::Done
            }
            Request::GetUnreachableNodes { role } => Response::UnreachableNodes {
                nodes: self.get_unreachable_nodes(role).await?,
            },
            Request::NetworkTransition => {
                self.network_transition().await;
                Response::Done
            }
        };
        Ok(response)
    }

    fn set_state(&self, state: PluginState) {
        Broker::set_state(self, state);
    }

    async fn periodic_task(&self) {
        Broker::periodic_task(self).await;
    }

    async fn shutdown(&self) {
        Broker::shutdown(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryBlobStore;
    use crate::policy_store::FilePolicyStore;
    use dirsearch_core::config::BrokerConfig;
    use dirsearch_core::memory::MemoryDirectory;
    use dirsearch_core::types::{record_types, Record, DEFAULT_FLAT_FILE_NODE, DEFAULT_LOCAL_NODE};
    use dirsearch_core::Error;
    use std::sync::Arc;

    fn plugin() -> Arc<dyn DirectoryPlugin> {
        let directory = MemoryDirectory::new();
        directory
            .add_node(
                DEFAULT_LOCAL_NODE,
                vec![Record::new(record_types::USERS, "root")],
            )
            .unwrap();
        directory.add_node(DEFAULT_FLAT_FILE_NODE, Vec::new()).unwrap();
        let broker = Broker::builder(BrokerConfig::default())
            .with_directory(Arc::new(directory))
            .with_policy_store(Arc::new(FilePolicyStore::new(Arc::new(MemoryBlobStore::new()))))
            .with_marker_store(Arc::new(MemoryBlobStore::new()))
            .build()
            .unwrap();
        Arc::new(broker)
    }

    #[test]
    fn request_wire_format() {
        let request: Request = serde_json::from_str(
            r#"{"request": "set_policy", "role": "contacts", "policy": "local"}"#,
        )
        .unwrap();
        assert!(matches!(
            request,
            Request::SetPolicy {
                role: SearchRole::Contacts,
                policy: SearchPolicy::Local
            }
        ));

        let json = serde_json::to_value(Response::PolicyUpdated { changed: true }).unwrap();
        assert_eq!(json["response"], "policy_updated");
        assert_eq!(json["changed"], true);
    }

    #[tokio::test]
    async fn lifecycle() {
        let plugin = plugin();
        plugin.validate().unwrap();
        plugin.initialize().await.unwrap();

        let Response::Opened { session } = plugin
            .process_request(Request::OpenSearch {
                target: "/Search".to_string(),
                caller_uid: 0,
            })
            .await
            .unwrap()
        else {
            panic!("expected a session");
        };

        let response = plugin
            .process_request(Request::GetRecordList {
                session,
                query: RecordQuery::new(),
                page: PageRequest::new(4096),
            })
            .await
            .unwrap();
        let Response::Page(page) = response else {
            panic!("expected a page");
        };
        assert_eq!(page.records.len(), 1);
        assert!(page.is_complete());

        plugin.set_state(PluginState::Inactive);
        let result = plugin
            .process_request(Request::GetNodeInfo { session })
            .await;
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));

        plugin.set_state(PluginState::Active);
        let Response::NodeInfo(info) = plugin
            .process_request(Request::GetNodeInfo { session })
            .await
            .unwrap()
        else {
            panic!("expected node info");
        };
        assert_eq!(info.search_path, vec![DEFAULT_LOCAL_NODE, DEFAULT_FLAT_FILE_NODE]);
        assert_eq!(info.policy, SearchPolicy::Automatic);

        plugin.periodic_task().await;
        plugin.shutdown().await;
        let result = plugin
            .process_request(Request::OpenSearch {
                target: "/Search".to_string(),
                caller_uid: 0,
            })
            .await;
        assert!(matches!(result, Err(Error::ServiceUnavailable(_))));
    }
}
