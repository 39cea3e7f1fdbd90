//! The metastore manager: the public contract of the metadata store.
//!
//! Every read and write of persistent metadata goes through
//! [`MetastoreManager`]. Two interchangeable strategies implement the
//! contract against the two persistence refinements:
//!
//! - [`TransactionalMetastore`](transactional::TransactionalMetastore)
//!   wraps each public operation in one backend-managed transaction.
//! - [`AtomicMetastore`](atomic::AtomicMetastore) decomposes each
//!   operation into one-shot compare-and-swap calls with idempotent-retry
//!   semantics.
//!
//! Operation outcomes are sum types: `OpResult<T>` is `Ok` exactly on
//! success, and [`MetastoreError`] enumerates every expected failure
//! predicate. Infrastructure failures surface as
//! [`MetastoreError::Unexpected`]; programmer errors abort through the
//! context's diagnostics and are never represented here.

pub mod atomic;
pub(crate) mod prepare;
pub mod transactional;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use strata_core::CallContext;

use crate::entity::{
    ChangeTrackingVersions, Entity, EntityCore, EntityId, EntityNameLookupRecord, EntitySubType,
    EntityType,
};
use crate::grant::{GrantRecord, Privilege};
use crate::secrets::PrincipalSecrets;
use crate::storage::{ScopedCredentials, StorageAction};

/// Result type of every manager operation.
pub type OpResult<T> = std::result::Result<T, MetastoreError>;

/// Expected failure predicates of manager operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetastoreError {
    /// The addressed entity does not exist.
    #[error("entity not found")]
    EntityNotFound,

    /// An active entity with the same name but a different id exists.
    #[error("entity already exists with sub-type {sub_type:?}")]
    EntityAlreadyExists {
        /// Sub-type of the existing entity.
        sub_type: EntitySubType,
    },

    /// A grant endpoint could not be re-resolved.
    #[error("entity cannot be resolved")]
    EntityCannotBeResolved,

    /// An ancestor of the catalog path is missing or changed.
    #[error("catalog path cannot be resolved: {0}")]
    CatalogPathCannotBeResolved(String),

    /// The entity is one of the undroppable bootstrap entities.
    #[error("entity cannot be renamed")]
    EntityCannotBeRenamed,

    /// The entity is one of the undroppable bootstrap entities.
    #[error("entity cannot be dropped")]
    EntityUndroppable,

    /// The namespace (or catalog) still has children.
    #[error("namespace is not empty")]
    NamespaceNotEmpty,

    /// The catalog still has catalog roles besides its admin role.
    #[error("catalog is not empty")]
    CatalogNotEmpty,

    /// The grant record to revoke does not exist; a no-op for callers.
    #[error("grant not found")]
    GrantNotFound,

    /// Optimistic concurrency failed: the target moved under the caller.
    #[error("target entity concurrently modified: {0}")]
    TargetEntityConcurrentlyModified(String),

    /// The storage integration failed to vend sub-scoped credentials.
    #[error("sub-scoped credential error: {0}")]
    SubscopeCredsError(String),

    /// An infrastructure failure was signalled by a collaborator.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<strata_core::Error> for MetastoreError {
    fn from(error: strata_core::Error) -> Self {
        Self::Unexpected(error.to_string())
    }
}

/// Result of a successful catalog creation (or an idempotent retry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCatalog {
    /// The catalog entity.
    pub catalog: Entity,
    /// The catalog's admin role.
    pub admin_role: Entity,
}

/// Result of a successful principal creation (or an idempotent retry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPrincipal {
    /// The principal entity, with its `client_id` internal property set.
    pub principal: Entity,
    /// The principal's secrets; plaintext present only on first creation.
    pub secrets: PrincipalSecrets,
}

/// Result of a successful drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DropOutcome {
    /// Id of the scheduled cleanup task, when `cleanup` was requested.
    pub cleanup_task_id: Option<i64>,
}

/// Grant set of one entity, from either endpoint's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedGrants {
    /// The subject's grant-set version.
    pub grants_version: u32,
    /// The grant records.
    pub grants: Vec<GrantRecord>,
    /// The counterparty entity of each distinct grant endpoint.
    pub entities: Vec<Entity>,
}

/// An entity bundled with its grant set and versions, sufficient for
/// authorisation decisions. Refresh calls leave unchanged parts `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntityState {
    /// The entity record; `None` when unchanged since the caller's
    /// version.
    pub entity: Option<Entity>,
    /// The current grant-set version.
    pub grant_records_version: u32,
    /// The grant records; `None` when unchanged since the caller's
    /// version. For grantee entities this is the union of both endpoints'
    /// records.
    pub grant_records: Option<Vec<GrantRecord>>,
}

/// An entity paired with the catalog path addressing it, for batch
/// updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityWithPath {
    /// Path to the entity's parent; empty for top-level entities.
    pub catalog_path: Vec<EntityCore>,
    /// The entity carrying the caller's intended changes.
    pub entity: Entity,
}

/// The public contract of the metadata store manager.
///
/// Every method is thread-safe and re-entrancy-safe; mutations performed
/// by one call become visible to concurrent readers together (the atomic
/// strategy documents its weaker mid-operation guarantee).
#[async_trait]
pub trait MetastoreManager: Send + Sync {
    /// Allocates a new entity id for the caller to build entities with.
    async fn generate_new_entity_id(&self, ctx: &CallContext) -> OpResult<i64>;

    /// Idempotently creates the realm's bootstrap closure: the root
    /// container, the root principal, the service-admin role, and their
    /// grants. Re-running after success or partial failure completes the
    /// remainder and succeeds.
    async fn bootstrap_service(&self, ctx: &CallContext) -> OpResult<()>;

    /// Deletes all metadata in the realm. Tests and teardown only.
    async fn purge(&self, ctx: &CallContext) -> OpResult<()>;

    /// Creates a catalog with its admin role and grant wiring. A retry
    /// with the same id returns the previously created catalog; a
    /// different catalog under the same name fails.
    async fn create_catalog(
        &self,
        ctx: &CallContext,
        catalog: Entity,
        principal_roles: &[EntityCore],
    ) -> OpResult<CreatedCatalog>;

    /// Creates a principal, generating its client id and secrets.
    async fn create_principal(
        &self,
        ctx: &CallContext,
        principal: Entity,
    ) -> OpResult<CreatedPrincipal>;

    /// Loads a principal's stored secrets by client id.
    async fn load_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
    ) -> OpResult<PrincipalSecrets>;

    /// Rotates a principal's secrets. `reset` flags the principal as
    /// rotation-required; the first subsequent rotation without `reset`
    /// clears the flag.
    async fn rotate_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> OpResult<PrincipalSecrets>;

    /// Creates an entity, or returns the existing one on a same-id retry.
    async fn create_entity_if_not_exists(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity: Entity,
    ) -> OpResult<Entity>;

    /// Batch form of
    /// [`create_entity_if_not_exists`](Self::create_entity_if_not_exists);
    /// all-or-nothing.
    async fn create_entities_if_not_exist(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entities: Vec<Entity>,
    ) -> OpResult<Vec<Entity>>;

    /// Compare-and-swap update of an entity's properties against both
    /// change-tracking versions.
    async fn update_entity_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity: &Entity,
    ) -> OpResult<Entity>;

    /// Batch compare-and-swap update; the backend discards all effects on
    /// any conflict.
    async fn update_entities_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        entities: &[EntityWithPath],
    ) -> OpResult<Vec<Entity>>;

    /// Renames an entity, optionally re-parenting it under
    /// `new_catalog_path`.
    async fn rename_entity(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_to_rename: &EntityCore,
        new_catalog_path: Option<&[EntityCore]>,
        renamed_entity: Entity,
    ) -> OpResult<Entity>;

    /// Drops an entity, enforcing the container and undroppable
    /// invariants, removing its grants (bumping every counterparty's
    /// grant version) and, for principals, its secrets. With `cleanup`, a
    /// cleanup TASK carrying the serialized entity is scheduled in the
    /// same unit.
    async fn drop_entity_if_exists(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_to_drop: &EntityCore,
        cleanup_properties: Option<BTreeMap<String, String>>,
        cleanup: bool,
    ) -> OpResult<DropOutcome>;

    /// Grants usage on a role to a grantee: `CATALOG_ROLE_USAGE` when the
    /// grantee is a principal role, else `PRINCIPAL_ROLE_USAGE`.
    async fn grant_usage_on_role_to_grantee(
        &self,
        ctx: &CallContext,
        catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord>;

    /// Revokes role usage from a grantee; revoking an absent grant yields
    /// [`MetastoreError::GrantNotFound`].
    async fn revoke_usage_on_role_from_grantee(
        &self,
        ctx: &CallContext,
        catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord>;

    /// Grants a privilege on a securable to a role.
    async fn grant_privilege_on_securable_to_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord>;

    /// Revokes a privilege on a securable from a role.
    async fn revoke_privilege_on_securable_from_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord>;

    /// Loads all grants where the entity is the securable.
    async fn load_grants_on_securable(
        &self,
        ctx: &CallContext,
        securable_catalog_id: i64,
        securable_id: i64,
    ) -> OpResult<LoadedGrants>;

    /// Loads all grants where the entity is the grantee.
    async fn load_grants_to_grantee(
        &self,
        ctx: &CallContext,
        grantee_catalog_id: i64,
        grantee_id: i64,
    ) -> OpResult<LoadedGrants>;

    /// Reads an entity by name under a catalog path, filtered by
    /// sub-type ([`EntitySubType::Any`] matches all).
    async fn read_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
        name: &str,
    ) -> OpResult<Entity>;

    /// Lists active entities of a type under a catalog path, filtered by
    /// sub-type.
    async fn list_entities(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
    ) -> OpResult<Vec<EntityNameLookupRecord>>;

    /// Loads an entity by id.
    async fn load_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<Entity>;

    /// Reads the change-tracking versions of a batch of entities.
    async fn load_entities_change_tracking(
        &self,
        ctx: &CallContext,
        ids: &[EntityId],
    ) -> OpResult<Vec<Option<ChangeTrackingVersions>>>;

    /// Loads an entity with its full grant set, by id.
    async fn load_resolved_entity_by_id(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<ResolvedEntityState>;

    /// Loads an entity with its full grant set, by name. A missing root
    /// container is backfilled before the lookup is retried.
    async fn load_resolved_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> OpResult<ResolvedEntityState>;

    /// Returns only the parts of a resolved entity that changed since the
    /// caller's known versions.
    async fn refresh_resolved_entity(
        &self,
        ctx: &CallContext,
        entity_version: u32,
        grant_records_version: u32,
        entity_type: EntityType,
        catalog_id: i64,
        id: i64,
    ) -> OpResult<ResolvedEntityState>;

    /// Leases up to `limit` available tasks for `executor_id`, bumping
    /// each task's attempt bookkeeping under compare-and-swap. Tasks whose
    /// lease CAS fails are skipped; if every candidate failed, the call
    /// signals [`MetastoreError::TargetEntityConcurrentlyModified`] so the
    /// caller retries.
    async fn load_tasks(
        &self,
        ctx: &CallContext,
        executor_id: &str,
        limit: usize,
    ) -> OpResult<Vec<Entity>>;

    /// Vends storage credentials for an entity, sub-scoped to the given
    /// locations.
    async fn get_subscoped_creds_for_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        entity_type: EntityType,
        allow_list_operation: bool,
        read_locations: &BTreeSet<String>,
        write_locations: &BTreeSet<String>,
    ) -> OpResult<ScopedCredentials>;

    /// Validates the requested actions against each location, returning a
    /// serialized validation result per location.
    async fn validate_access_to_locations(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        entity_type: EntityType,
        actions: &BTreeSet<StorageAction>,
        locations: &BTreeSet<String>,
    ) -> OpResult<BTreeMap<String, String>>;
}
