//! # strata-metastore
//!
//! The metadata store manager of the Strata catalog: the subsystem that
//! mediates all reads and writes of the catalog's persistent metadata —
//! catalogs, namespaces, tables and views, principals, roles, grants,
//! tasks, storage integrations and principal secrets — on top of a
//! pluggable persistence backend.
//!
//! ## Architecture
//!
//! - [`entity`], [`grant`], [`task`]: the value types of the store.
//! - [`persistence`]: the slice-oriented backend contract with two
//!   refinements — multi-statement transactions and one-shot
//!   compare-and-swap — plus the in-memory reference backend.
//! - [`resolver`]: catalog-path resolution with ancestor revalidation.
//! - [`manager`]: the public contract and its two interchangeable
//!   strategies, one per backend refinement.
//! - [`secrets`], [`storage`]: the principal-credential slice types and
//!   the external collaborators (user-secrets manager, storage
//!   integration / credential vendor).
//! - [`factory`]: per-realm manager construction with bootstrap-on-first-
//!   access.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_core::{CallContext, RealmId};
//! use strata_metastore::manager::atomic::AtomicMetastore;
//! use strata_metastore::manager::MetastoreManager;
//! use strata_metastore::persistence::memory::InMemoryStore;
//!
//! # async fn example() -> Result<(), strata_metastore::manager::MetastoreError> {
//! let manager = AtomicMetastore::new(Arc::new(InMemoryStore::new()));
//! let ctx = CallContext::new(RealmId::new_unchecked("acme-prod"));
//! manager.bootstrap_service(&ctx).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod entity;
pub mod factory;
pub mod grant;
pub mod manager;
pub mod metrics;
pub mod persistence;
pub mod resolver;
pub mod secrets;
pub mod storage;
pub mod task;

pub use entity::{Entity, EntityCore, EntityId, EntitySubType, EntityType};
pub use grant::{GrantRecord, Privilege};
pub use manager::atomic::AtomicMetastore;
pub use manager::transactional::TransactionalMetastore;
pub use manager::{MetastoreError, MetastoreManager, OpResult};
pub use persistence::memory::InMemoryStore;
pub use persistence::{AtomicPersistence, BasePersistence, TransactionalPersistence};
pub use secrets::{InMemoryUserSecretsManager, PrincipalSecrets, UserSecretsManager};
pub use storage::{StorageConfigInfo, StorageIntegration};
