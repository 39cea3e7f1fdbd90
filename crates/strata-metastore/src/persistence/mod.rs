//! The pluggable persistence contract of the metadata store.
//!
//! The store is organized into logical *slices*: entities, active names,
//! change tracking, grant records, principal secrets and storage
//! integrations. [`TransactionSlices`] is the synchronous view of all
//! slices exposed inside a backend transaction; [`BasePersistence`] is the
//! same operation set as individually-issued one-shot calls.
//!
//! Two refinements exist:
//!
//! - [`TransactionalPersistence`] adds `run_in_transaction` /
//!   `run_in_read_transaction` with serializable (or
//!   snapshot-with-version-check) semantics and rollback on error.
//! - [`AtomicPersistence`] promises that every [`BasePersistence`] call is
//!   individually atomic with compare-and-swap semantics: a create over an
//!   existing id or active name yields [`WriteOutcome::AlreadyExists`], and
//!   an update whose `original` witness no longer matches the stored
//!   `(entity_version, grant_records_version)` yields
//!   [`WriteOutcome::Conflict`].
//!
//! Write outcomes are ordinary values, never errors: errors are reserved
//! for infrastructure failures of the backing store.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;

use strata_core::{CallContext, Error, Result};

use crate::entity::{
    ChangeTrackingVersions, Entity, EntityId, EntityNameLookupRecord, EntityType,
};
use crate::grant::{GrantRecord, Privilege};
use crate::secrets::PrincipalSecrets;
use crate::storage::{StorageConfigInfo, StorageIntegration};

/// Outcome of a conditional entity write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The write was applied.
    Written,
    /// A create found an existing record with the same id or the same
    /// active name; carries the stored record.
    AlreadyExists(Box<Entity>),
    /// An update's `original` witness no longer matches the stored
    /// versions; carries a description of the mismatch.
    Conflict(String),
}

impl WriteOutcome {
    /// True when the write was applied.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Entity filter used by listings.
pub type EntityFilter<'a> = &'a (dyn Fn(&Entity) -> bool + Send + Sync);

/// The synchronous all-slices view inside a backend transaction.
///
/// Reads observe every write already performed in the same transaction.
/// Conditional writes take the caller's `original` witness of the
/// pre-state and report [`WriteOutcome::Conflict`] when the stored record
/// moved, so the strategy can roll the transaction back.
pub trait TransactionSlices {
    // --- identity ---

    /// Allocates a new 64-bit id, unique within the realm. Allocation is
    /// never rolled back, so ids stay unique across aborted transactions.
    fn generate_new_id(&mut self) -> i64;

    // --- entities slice ---

    /// Looks up an entity by id, checking the type code.
    fn lookup_entity(&self, catalog_id: i64, id: i64, entity_type: EntityType) -> Option<Entity>;

    /// Looks up a batch of entities by id; position-aligned with `ids`.
    fn lookup_entities(&self, ids: &[EntityId]) -> Vec<Option<Entity>>;

    /// Conditionally writes one entity. `name_or_parent_changed` tells the
    /// backend to move the active-name index entry from the original key
    /// to the new one. `original` is `None` for creates.
    fn write_entity(
        &mut self,
        entity: &Entity,
        name_or_parent_changed: bool,
        original: Option<&Entity>,
    ) -> WriteOutcome;

    /// Conditionally writes a batch of entities; all-or-nothing. When
    /// `originals` is present it must be position-aligned with `entities`.
    fn write_entities(&mut self, entities: &[Entity], originals: Option<&[Entity]>)
        -> WriteOutcome;

    /// Removes an entity from every slice it appears in.
    fn delete_entity(&mut self, entity: &Entity);

    // --- active-name slice ---

    /// Looks up an active entity by its name key.
    fn lookup_entity_by_name(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Option<Entity>;

    /// Like [`lookup_entity_by_name`](Self::lookup_entity_by_name) but
    /// returns only the slim name record.
    fn lookup_entity_id_and_sub_type_by_name(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Option<EntityNameLookupRecord>;

    /// Lists active entities under a parent, optionally bounded and
    /// filtered. Results are name-ordered.
    fn list_entities(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        limit: Option<usize>,
        filter: EntityFilter<'_>,
    ) -> Vec<Entity>;

    /// True when the parent has at least one active child, optionally of
    /// one specific type.
    fn has_children(
        &self,
        of_type: Option<EntityType>,
        catalog_id: i64,
        parent_id: i64,
    ) -> bool;

    // --- change-tracking slice ---

    /// Reads the version pair of each entity; position-aligned with `ids`,
    /// `None` for purged entities.
    fn lookup_entity_versions(&self, ids: &[EntityId]) -> Vec<Option<ChangeTrackingVersions>>;

    /// Reads an entity's grant-set version; `0` when the entity does not
    /// exist.
    fn lookup_entity_grant_records_version(&self, catalog_id: i64, id: i64) -> u32;

    // --- grant-records slice ---

    /// Inserts a grant record. Idempotent for an identical record.
    fn write_to_grant_records(&mut self, record: &GrantRecord);

    /// Deletes a grant record; deleting an absent record is a no-op.
    fn delete_from_grant_records(&mut self, record: &GrantRecord);

    /// Deletes every grant record to and from an entity. The caller
    /// supplies the records it already loaded from both sides.
    fn delete_all_entity_grant_records(
        &mut self,
        entity: &Entity,
        on_grantee: &[GrantRecord],
        on_securable: &[GrantRecord],
    );

    /// Loads all grants where the entity is the grantee.
    fn load_all_grant_records_on_grantee(&self, catalog_id: i64, id: i64) -> Vec<GrantRecord>;

    /// Loads all grants where the entity is the securable.
    fn load_all_grant_records_on_securable(&self, catalog_id: i64, id: i64) -> Vec<GrantRecord>;

    /// Looks up one specific grant record.
    fn lookup_grant_record(
        &self,
        securable_catalog_id: i64,
        securable_id: i64,
        grantee_catalog_id: i64,
        grantee_id: i64,
        privilege: Privilege,
    ) -> Option<GrantRecord>;

    // --- principal-secrets slice ---

    /// Loads a principal's stored secrets (hashes only) by client id.
    fn load_principal_secrets(&self, client_id: &str) -> Option<PrincipalSecrets>;

    /// Generates and stores fresh secrets for a principal; the returned
    /// value carries the plaintexts, the stored record does not.
    fn generate_new_principal_secrets(&mut self, principal_id: i64) -> PrincipalSecrets;

    /// Rotates a principal's secrets; `None` when the client id is
    /// unknown. The returned value carries the new main plaintext.
    fn rotate_principal_secrets(
        &mut self,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> Option<PrincipalSecrets>;

    /// Deletes a principal's secrets; absent secrets are a no-op.
    fn delete_principal_secrets(&mut self, client_id: &str, principal_id: i64);

    // --- storage-integration slice ---

    /// Allocates a storage integration for a catalog being created.
    fn create_storage_integration(
        &mut self,
        catalog_id: i64,
        entity_id: i64,
        config: &StorageConfigInfo,
    ) -> Arc<dyn StorageIntegration>;

    /// Persists the association between an entity and its integration, if
    /// one was allocated.
    fn persist_storage_integration_if_needed(
        &mut self,
        entity: &Entity,
        integration: Option<&Arc<dyn StorageIntegration>>,
    );

    /// Loads the storage integration persisted for an entity.
    fn load_storage_integration(&self, entity: &Entity) -> Option<Arc<dyn StorageIntegration>>;

    // --- bulk ---

    /// Deletes all metadata in the realm.
    fn delete_all(&mut self);
}

/// The one-shot persistence contract: every [`TransactionSlices`]
/// operation issued as an individual call.
#[async_trait]
pub trait BasePersistence: Send + Sync + 'static {
    /// Allocates a new 64-bit id, unique within the realm.
    async fn generate_new_id(&self, ctx: &CallContext) -> Result<i64>;

    /// Looks up an entity by id, checking the type code.
    async fn lookup_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> Result<Option<Entity>>;

    /// Looks up a batch of entities by id; position-aligned with `ids`.
    async fn lookup_entities(
        &self,
        ctx: &CallContext,
        ids: &[EntityId],
    ) -> Result<Vec<Option<Entity>>>;

    /// Conditionally writes one entity; see
    /// [`TransactionSlices::write_entity`].
    async fn write_entity(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        name_or_parent_changed: bool,
        original: Option<&Entity>,
    ) -> Result<WriteOutcome>;

    /// Conditionally writes a batch of entities; all-or-nothing.
    async fn write_entities(
        &self,
        ctx: &CallContext,
        entities: &[Entity],
        originals: Option<&[Entity]>,
    ) -> Result<WriteOutcome>;

    /// Removes an entity from every slice it appears in.
    async fn delete_entity(&self, ctx: &CallContext, entity: &Entity) -> Result<()>;

    /// Looks up an active entity by its name key.
    async fn lookup_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>>;

    /// Looks up the slim name record for an active entity.
    async fn lookup_entity_id_and_sub_type_by_name(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<EntityNameLookupRecord>>;

    /// Lists active entities under a parent, optionally bounded and
    /// filtered.
    async fn list_entities(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        limit: Option<usize>,
        filter: EntityFilter<'_>,
    ) -> Result<Vec<Entity>>;

    /// True when the parent has at least one active child.
    async fn has_children(
        &self,
        ctx: &CallContext,
        of_type: Option<EntityType>,
        catalog_id: i64,
        parent_id: i64,
    ) -> Result<bool>;

    /// Reads the version pair of each entity.
    async fn lookup_entity_versions(
        &self,
        ctx: &CallContext,
        ids: &[EntityId],
    ) -> Result<Vec<Option<ChangeTrackingVersions>>>;

    /// Reads an entity's grant-set version; `0` when absent.
    async fn lookup_entity_grant_records_version(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<u32>;

    /// Inserts a grant record.
    async fn write_to_grant_records(&self, ctx: &CallContext, record: &GrantRecord) -> Result<()>;

    /// Deletes a grant record.
    async fn delete_from_grant_records(
        &self,
        ctx: &CallContext,
        record: &GrantRecord,
    ) -> Result<()>;

    /// Deletes every grant record to and from an entity.
    async fn delete_all_entity_grant_records(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        on_grantee: &[GrantRecord],
        on_securable: &[GrantRecord],
    ) -> Result<()>;

    /// Loads all grants where the entity is the grantee.
    async fn load_all_grant_records_on_grantee(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<Vec<GrantRecord>>;

    /// Loads all grants where the entity is the securable.
    async fn load_all_grant_records_on_securable(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<Vec<GrantRecord>>;

    /// Looks up one specific grant record.
    async fn lookup_grant_record(
        &self,
        ctx: &CallContext,
        securable_catalog_id: i64,
        securable_id: i64,
        grantee_catalog_id: i64,
        grantee_id: i64,
        privilege: Privilege,
    ) -> Result<Option<GrantRecord>>;

    /// Loads a principal's stored secrets by client id.
    async fn load_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
    ) -> Result<Option<PrincipalSecrets>>;

    /// Generates and stores fresh secrets for a principal.
    async fn generate_new_principal_secrets(
        &self,
        ctx: &CallContext,
        principal_id: i64,
    ) -> Result<PrincipalSecrets>;

    /// Rotates a principal's secrets.
    async fn rotate_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> Result<Option<PrincipalSecrets>>;

    /// Deletes a principal's secrets.
    async fn delete_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
    ) -> Result<()>;

    /// Allocates a storage integration for a catalog being created.
    async fn create_storage_integration(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        config: &StorageConfigInfo,
    ) -> Result<Arc<dyn StorageIntegration>>;

    /// Persists the association between an entity and its integration.
    async fn persist_storage_integration_if_needed(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        integration: Option<&Arc<dyn StorageIntegration>>,
    ) -> Result<()>;

    /// Loads the storage integration persisted for an entity.
    async fn load_storage_integration(
        &self,
        ctx: &CallContext,
        entity: &Entity,
    ) -> Result<Option<Arc<dyn StorageIntegration>>>;

    /// Deletes all metadata in the realm.
    async fn delete_all(&self, ctx: &CallContext) -> Result<()>;
}

/// Marker refinement: every [`BasePersistence`] operation on this backend
/// is individually atomic with compare-and-swap semantics. Backends
/// without multi-statement transactions (single-row CAS stores) implement
/// this; the atomic manager strategy requires it.
pub trait AtomicPersistence: BasePersistence {}

/// Refinement for backends with multi-statement transactions.
///
/// Closures run on the synchronous [`TransactionSlices`] view; the backend
/// guarantees serializable (or snapshot-with-version-check) semantics,
/// commits on `Ok` and rolls every effect back on `Err`. Transactions are
/// blocking sections; the async boundary stays at the one-shot calls.
pub trait TransactionalPersistence: BasePersistence {
    /// Runs `f` in a read-write transaction, committing on `Ok`.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error after rolling back, or the
    /// backend's own failure converted through `E: From<Error>`.
    fn run_in_transaction<T, E, F>(&self, ctx: &CallContext, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut dyn TransactionSlices) -> std::result::Result<T, E>,
        E: From<Error>;

    /// Runs `f` in a read-only transaction.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or the backend's own failure
    /// converted through `E: From<Error>`.
    fn run_in_read_transaction<T, E, F>(
        &self,
        ctx: &CallContext,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn TransactionSlices) -> std::result::Result<T, E>,
        E: From<Error>;

    /// Runs a value-less action in a read-write transaction.
    ///
    /// # Errors
    ///
    /// Same contract as [`run_in_transaction`](Self::run_in_transaction).
    fn run_action_in_transaction<E, F>(&self, ctx: &CallContext, f: F) -> std::result::Result<(), E>
    where
        F: FnOnce(&mut dyn TransactionSlices) -> std::result::Result<(), E>,
        E: From<Error>,
    {
        self.run_in_transaction(ctx, f)
    }
}
