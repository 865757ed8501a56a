//! LDAP backend nodes for the directory-search broker.
//!
//! This crate implements the backend node protocol from `dirsearch-core` over LDAPv3 servers.
//! Each configured server becomes a node named `/LDAPv3/<host>`; record types are translated
//! into LDAP filters through per-node [`RecordTypeMapping`]s.

#![deny(missing_docs)]

mod client;
mod config;
mod directory;
mod mapping;

pub use client::{LdapConnector, LdapEntry, LdapSession, Ldap3Connector, SearchScope};
pub use config::{
    LdapCredentials, LdapNodeConfig, DEFAULT_CONNECTION_TIMEOUT_SECS,
    DEFAULT_OPERATION_TIMEOUT_SECS, DEFAULT_SIZE_LIMIT,
};
pub use directory::LdapDirectory;
pub use mapping::{escape_filter_value, select_mappings, FilterError, RecordTypeMapping};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = dirsearch_core::Result<T>;
