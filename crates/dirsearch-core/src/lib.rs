//! # dirsearch-core
//!
//! Core types and utilities for the federated directory-search broker.
//!
//! This crate provides the error taxonomy, configuration, record and query model, and the
//! backend node protocol that every directory backend implements.
//!
//! ## Modules
//!
//! - [`error`] - Error type and its classification into [`ErrorKind`]
//! - [`ids`] - Strongly-typed identifiers for sessions and continuations
//! - [`types`] - Search policies, roles, records and well-known names
//! - [`query`] - Record-list and attribute-value query descriptions
//! - [`config`] - Broker configuration
//! - [`backoff`] - Exponential backoff used by the reachability prober
//! - [`node`] - Backend node protocol traits
//! - [`memory`] - In-process directory backend

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod node;
pub mod query;
pub mod types;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
