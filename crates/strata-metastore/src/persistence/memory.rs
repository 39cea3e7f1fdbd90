//! In-memory persistence backend for tests and development.
//!
//! Backs every slice with ordered maps keyed by the documented tuple keys
//! and implements both refinements: transactions stage their effects on a
//! clone of the store and swap it in on commit, one-shot operations run
//! under the same lock and are therefore individually atomic. Not suitable
//! for production.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use strata_core::{CallContext, Error, Result};

use crate::entity::{
    ActiveNameKey, ChangeTrackingVersions, Entity, EntityId, EntityNameLookupRecord, EntityType,
};
use crate::grant::{GrantRecord, Privilege};
use crate::secrets::PrincipalSecrets;
use crate::storage::{SimulatedStorageIntegration, StorageConfigInfo, StorageIntegration};

use super::{
    AtomicPersistence, BasePersistence, EntityFilter, TransactionSlices,
    TransactionalPersistence, WriteOutcome,
};

/// First id handed out by the sequence; low ids stay reserved for fixed
/// system entities like the root container.
const FIRST_GENERATED_ID: i64 = 1_000;

/// All slices of one realm's store.
///
/// Cloning shares the id sequence: ids allocated inside a transaction stay
/// consumed even when the transaction rolls back, which keeps generated
/// ids unique across retries.
#[derive(Debug, Clone, Default)]
struct StoreState {
    next_id: Arc<AtomicI64>,
    entities: BTreeMap<(i64, i64), Entity>,
    active_names: BTreeMap<ActiveNameKey, EntityId>,
    grants_on_securable: BTreeMap<EntityId, BTreeSet<GrantRecord>>,
    grants_on_grantee: BTreeMap<EntityId, BTreeSet<GrantRecord>>,
    principal_secrets: BTreeMap<String, PrincipalSecrets>,
    integrations: BTreeMap<i64, Arc<dyn StorageIntegration>>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicI64::new(FIRST_GENERATED_ID)),
            ..Self::default()
        }
    }

    fn entity_by_id(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&(id.catalog_id, id.id))
    }
}

impl TransactionSlices for StoreState {
    fn generate_new_id(&mut self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lookup_entity(&self, catalog_id: i64, id: i64, entity_type: EntityType) -> Option<Entity> {
        self.entities
            .get(&(catalog_id, id))
            .filter(|e| e.entity_type == entity_type)
            .cloned()
    }

    fn lookup_entities(&self, ids: &[EntityId]) -> Vec<Option<Entity>> {
        ids.iter().map(|id| self.entity_by_id(*id).cloned()).collect()
    }

    fn write_entity(
        &mut self,
        entity: &Entity,
        name_or_parent_changed: bool,
        original: Option<&Entity>,
    ) -> WriteOutcome {
        let key = (entity.catalog_id, entity.id);
        match original {
            None => {
                // Create: both the id and the active name must be free. A
                // same-id record means a low-level client retry.
                if let Some(existing) = self.entities.get(&key) {
                    return WriteOutcome::AlreadyExists(Box::new(existing.clone()));
                }
                if let Some(existing_id) = self.active_names.get(&entity.active_name_key()) {
                    if let Some(existing) = self.entity_by_id(*existing_id) {
                        return WriteOutcome::AlreadyExists(Box::new(existing.clone()));
                    }
                }
            }
            Some(original) => {
                let Some(stored) = self.entities.get(&key) else {
                    return WriteOutcome::Conflict(format!(
                        "entity '{}' (id {}) no longer exists",
                        entity.name, entity.id
                    ));
                };
                if stored.entity_version != original.entity_version
                    || stored.grant_records_version != original.grant_records_version
                {
                    return WriteOutcome::Conflict(format!(
                        "entity '{}' (id {}) concurrently modified; expected versions {}/{} found {}/{}",
                        entity.name,
                        entity.id,
                        original.entity_version,
                        original.grant_records_version,
                        stored.entity_version,
                        stored.grant_records_version
                    ));
                }
                if name_or_parent_changed {
                    // Rename/re-parent destination must not collide with a
                    // different entity.
                    if let Some(existing_id) = self.active_names.get(&entity.active_name_key()) {
                        if existing_id.id != entity.id {
                            if let Some(existing) = self.entity_by_id(*existing_id) {
                                return WriteOutcome::AlreadyExists(Box::new(existing.clone()));
                            }
                        }
                    }
                }
            }
        }

        if name_or_parent_changed {
            if let Some(original) = original {
                self.active_names.remove(&original.active_name_key());
            }
        }
        self.active_names
            .insert(entity.active_name_key(), entity.entity_id());
        self.entities.insert(key, entity.clone());
        WriteOutcome::Written
    }

    fn write_entities(
        &mut self,
        entities: &[Entity],
        originals: Option<&[Entity]>,
    ) -> WriteOutcome {
        // Stage on a clone so a mid-batch failure leaves no partial effects.
        let mut staged = self.clone();
        for (index, entity) in entities.iter().enumerate() {
            let original = originals.map(|o| &o[index]);
            let outcome = staged.write_entity(entity, original.is_none(), original);
            if !outcome.is_written() {
                return outcome;
            }
        }
        *self = staged;
        WriteOutcome::Written
    }

    fn delete_entity(&mut self, entity: &Entity) {
        if let Some(stored) = self.entities.remove(&(entity.catalog_id, entity.id)) {
            self.active_names.remove(&stored.active_name_key());
        }
    }

    fn lookup_entity_by_name(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Option<Entity> {
        let key = ActiveNameKey::new(catalog_id, parent_id, entity_type, name);
        self.active_names
            .get(&key)
            .and_then(|id| self.entity_by_id(*id))
            .cloned()
    }

    fn lookup_entity_id_and_sub_type_by_name(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Option<EntityNameLookupRecord> {
        self.lookup_entity_by_name(catalog_id, parent_id, entity_type, name)
            .map(|e| EntityNameLookupRecord::from(&e))
    }

    fn list_entities(
        &self,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        limit: Option<usize>,
        filter: EntityFilter<'_>,
    ) -> Vec<Entity> {
        let mut matches: Vec<Entity> = self
            .entities
            .values()
            .filter(|e| {
                e.catalog_id == catalog_id
                    && e.parent_id == parent_id
                    && e.id != parent_id
                    && e.entity_type == entity_type
                    && filter(e)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        matches
    }

    fn has_children(
        &self,
        of_type: Option<EntityType>,
        catalog_id: i64,
        parent_id: i64,
    ) -> bool {
        self.entities.values().any(|e| {
            e.catalog_id == catalog_id
                && e.parent_id == parent_id
                && e.id != parent_id
                && of_type.map_or(true, |t| e.entity_type == t)
        })
    }

    fn lookup_entity_versions(&self, ids: &[EntityId]) -> Vec<Option<ChangeTrackingVersions>> {
        ids.iter()
            .map(|id| self.entity_by_id(*id).map(Entity::versions))
            .collect()
    }

    fn lookup_entity_grant_records_version(&self, catalog_id: i64, id: i64) -> u32 {
        self.entities
            .get(&(catalog_id, id))
            .map_or(0, |e| e.grant_records_version)
    }

    fn write_to_grant_records(&mut self, record: &GrantRecord) {
        self.grants_on_securable
            .entry(record.securable_entity_id())
            .or_default()
            .insert(record.clone());
        self.grants_on_grantee
            .entry(record.grantee_entity_id())
            .or_default()
            .insert(record.clone());
    }

    fn delete_from_grant_records(&mut self, record: &GrantRecord) {
        if let Some(set) = self.grants_on_securable.get_mut(&record.securable_entity_id()) {
            set.remove(record);
        }
        if let Some(set) = self.grants_on_grantee.get_mut(&record.grantee_entity_id()) {
            set.remove(record);
        }
    }

    fn delete_all_entity_grant_records(
        &mut self,
        entity: &Entity,
        on_grantee: &[GrantRecord],
        on_securable: &[GrantRecord],
    ) {
        let entity_id = entity.entity_id();
        self.grants_on_grantee.remove(&entity_id);
        self.grants_on_securable.remove(&entity_id);
        // Scrub the counterparty indexes as well.
        for record in on_grantee {
            if let Some(set) = self.grants_on_securable.get_mut(&record.securable_entity_id()) {
                set.remove(record);
            }
        }
        for record in on_securable {
            if let Some(set) = self.grants_on_grantee.get_mut(&record.grantee_entity_id()) {
                set.remove(record);
            }
        }
    }

    fn load_all_grant_records_on_grantee(&self, catalog_id: i64, id: i64) -> Vec<GrantRecord> {
        self.grants_on_grantee
            .get(&EntityId::new(catalog_id, id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn load_all_grant_records_on_securable(&self, catalog_id: i64, id: i64) -> Vec<GrantRecord> {
        self.grants_on_securable
            .get(&EntityId::new(catalog_id, id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lookup_grant_record(
        &self,
        securable_catalog_id: i64,
        securable_id: i64,
        grantee_catalog_id: i64,
        grantee_id: i64,
        privilege: Privilege,
    ) -> Option<GrantRecord> {
        self.grants_on_securable
            .get(&EntityId::new(securable_catalog_id, securable_id))?
            .iter()
            .find(|r| {
                r.grantee_catalog_id == grantee_catalog_id
                    && r.grantee_id == grantee_id
                    && r.privilege == privilege
            })
            .cloned()
    }

    fn load_principal_secrets(&self, client_id: &str) -> Option<PrincipalSecrets> {
        self.principal_secrets.get(client_id).cloned()
    }

    fn generate_new_principal_secrets(&mut self, principal_id: i64) -> PrincipalSecrets {
        let mut secrets = PrincipalSecrets::generate(principal_id);
        while self.principal_secrets.contains_key(&secrets.client_id) {
            secrets = PrincipalSecrets::generate(principal_id);
        }
        self.principal_secrets
            .insert(secrets.client_id.clone(), secrets.redacted());
        secrets
    }

    fn rotate_principal_secrets(
        &mut self,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> Option<PrincipalSecrets> {
        let stored = self.principal_secrets.get(client_id)?;
        if stored.principal_id != principal_id {
            return None;
        }
        let mut rotated = stored.clone();
        rotated.rotate(reset, old_main_secret_hash);
        self.principal_secrets
            .insert(client_id.to_string(), rotated.redacted());
        Some(rotated)
    }

    fn delete_principal_secrets(&mut self, client_id: &str, principal_id: i64) {
        if self
            .principal_secrets
            .get(client_id)
            .is_some_and(|s| s.principal_id == principal_id)
        {
            self.principal_secrets.remove(client_id);
        }
    }

    fn create_storage_integration(
        &mut self,
        catalog_id: i64,
        entity_id: i64,
        _config: &StorageConfigInfo,
    ) -> Arc<dyn StorageIntegration> {
        Arc::new(SimulatedStorageIntegration::new(format!(
            "sim:{catalog_id}:{entity_id}"
        )))
    }

    fn persist_storage_integration_if_needed(
        &mut self,
        entity: &Entity,
        integration: Option<&Arc<dyn StorageIntegration>>,
    ) {
        if let Some(integration) = integration {
            self.integrations.insert(entity.id, Arc::clone(integration));
        }
    }

    fn load_storage_integration(&self, entity: &Entity) -> Option<Arc<dyn StorageIntegration>> {
        self.integrations.get(&entity.id).cloned()
    }

    fn delete_all(&mut self) {
        self.entities.clear();
        self.active_names.clear();
        self.grants_on_securable.clear();
        self.grants_on_grantee.clear();
        self.principal_secrets.clear();
        self.integrations.clear();
    }
}

/// In-memory store implementing both persistence refinements.
///
/// Thread-safe via `RwLock`; transactions take the write lock for their
/// whole duration, which gives serializable semantics.
#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }

    fn read_state<T>(&self, f: impl FnOnce(&StoreState) -> T) -> Result<T> {
        let guard = self
            .state
            .read()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        Ok(f(&guard))
    }

    fn write_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> Result<T> {
        let mut guard = self
            .state
            .write()
            .map_err(|_| Error::internal("store lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl BasePersistence for InMemoryStore {
    async fn generate_new_id(&self, _ctx: &CallContext) -> Result<i64> {
        self.write_state(|s| s.generate_new_id())
    }

    async fn lookup_entity(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> Result<Option<Entity>> {
        self.read_state(|s| s.lookup_entity(catalog_id, id, entity_type))
    }

    async fn lookup_entities(
        &self,
        _ctx: &CallContext,
        ids: &[EntityId],
    ) -> Result<Vec<Option<Entity>>> {
        self.read_state(|s| s.lookup_entities(ids))
    }

    async fn write_entity(
        &self,
        _ctx: &CallContext,
        entity: &Entity,
        name_or_parent_changed: bool,
        original: Option<&Entity>,
    ) -> Result<WriteOutcome> {
        self.write_state(|s| s.write_entity(entity, name_or_parent_changed, original))
    }

    async fn write_entities(
        &self,
        _ctx: &CallContext,
        entities: &[Entity],
        originals: Option<&[Entity]>,
    ) -> Result<WriteOutcome> {
        self.write_state(|s| s.write_entities(entities, originals))
    }

    async fn delete_entity(&self, _ctx: &CallContext, entity: &Entity) -> Result<()> {
        self.write_state(|s| s.delete_entity(entity))
    }

    async fn lookup_entity_by_name(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>> {
        self.read_state(|s| s.lookup_entity_by_name(catalog_id, parent_id, entity_type, name))
    }

    async fn lookup_entity_id_and_sub_type_by_name(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<EntityNameLookupRecord>> {
        self.read_state(|s| {
            s.lookup_entity_id_and_sub_type_by_name(catalog_id, parent_id, entity_type, name)
        })
    }

    async fn list_entities(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        limit: Option<usize>,
        filter: EntityFilter<'_>,
    ) -> Result<Vec<Entity>> {
        self.read_state(|s| s.list_entities(catalog_id, parent_id, entity_type, limit, filter))
    }

    async fn has_children(
        &self,
        _ctx: &CallContext,
        of_type: Option<EntityType>,
        catalog_id: i64,
        parent_id: i64,
    ) -> Result<bool> {
        self.read_state(|s| s.has_children(of_type, catalog_id, parent_id))
    }

    async fn lookup_entity_versions(
        &self,
        _ctx: &CallContext,
        ids: &[EntityId],
    ) -> Result<Vec<Option<ChangeTrackingVersions>>> {
        self.read_state(|s| s.lookup_entity_versions(ids))
    }

    async fn lookup_entity_grant_records_version(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<u32> {
        self.read_state(|s| s.lookup_entity_grant_records_version(catalog_id, id))
    }

    async fn write_to_grant_records(
        &self,
        _ctx: &CallContext,
        record: &GrantRecord,
    ) -> Result<()> {
        self.write_state(|s| s.write_to_grant_records(record))
    }

    async fn delete_from_grant_records(
        &self,
        _ctx: &CallContext,
        record: &GrantRecord,
    ) -> Result<()> {
        self.write_state(|s| s.delete_from_grant_records(record))
    }

    async fn delete_all_entity_grant_records(
        &self,
        _ctx: &CallContext,
        entity: &Entity,
        on_grantee: &[GrantRecord],
        on_securable: &[GrantRecord],
    ) -> Result<()> {
        self.write_state(|s| s.delete_all_entity_grant_records(entity, on_grantee, on_securable))
    }

    async fn load_all_grant_records_on_grantee(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<Vec<GrantRecord>> {
        self.read_state(|s| s.load_all_grant_records_on_grantee(catalog_id, id))
    }

    async fn load_all_grant_records_on_securable(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        id: i64,
    ) -> Result<Vec<GrantRecord>> {
        self.read_state(|s| s.load_all_grant_records_on_securable(catalog_id, id))
    }

    async fn lookup_grant_record(
        &self,
        _ctx: &CallContext,
        securable_catalog_id: i64,
        securable_id: i64,
        grantee_catalog_id: i64,
        grantee_id: i64,
        privilege: Privilege,
    ) -> Result<Option<GrantRecord>> {
        self.read_state(|s| {
            s.lookup_grant_record(
                securable_catalog_id,
                securable_id,
                grantee_catalog_id,
                grantee_id,
                privilege,
            )
        })
    }

    async fn load_principal_secrets(
        &self,
        _ctx: &CallContext,
        client_id: &str,
    ) -> Result<Option<PrincipalSecrets>> {
        self.read_state(|s| s.load_principal_secrets(client_id))
    }

    async fn generate_new_principal_secrets(
        &self,
        _ctx: &CallContext,
        principal_id: i64,
    ) -> Result<PrincipalSecrets> {
        self.write_state(|s| s.generate_new_principal_secrets(principal_id))
    }

    async fn rotate_principal_secrets(
        &self,
        _ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> Result<Option<PrincipalSecrets>> {
        self.write_state(|s| {
            s.rotate_principal_secrets(client_id, principal_id, reset, old_main_secret_hash)
        })
    }

    async fn delete_principal_secrets(
        &self,
        _ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
    ) -> Result<()> {
        self.write_state(|s| s.delete_principal_secrets(client_id, principal_id))
    }

    async fn create_storage_integration(
        &self,
        _ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        config: &StorageConfigInfo,
    ) -> Result<Arc<dyn StorageIntegration>> {
        self.write_state(|s| s.create_storage_integration(catalog_id, entity_id, config))
    }

    async fn persist_storage_integration_if_needed(
        &self,
        _ctx: &CallContext,
        entity: &Entity,
        integration: Option<&Arc<dyn StorageIntegration>>,
    ) -> Result<()> {
        self.write_state(|s| s.persist_storage_integration_if_needed(entity, integration))
    }

    async fn load_storage_integration(
        &self,
        _ctx: &CallContext,
        entity: &Entity,
    ) -> Result<Option<Arc<dyn StorageIntegration>>> {
        self.read_state(|s| s.load_storage_integration(entity))
    }

    async fn delete_all(&self, _ctx: &CallContext) -> Result<()> {
        self.write_state(|s| s.delete_all())
    }
}

impl AtomicPersistence for InMemoryStore {}

impl TransactionalPersistence for InMemoryStore {
    fn run_in_transaction<T, E, F>(&self, _ctx: &CallContext, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut dyn TransactionSlices) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut guard = self
            .state
            .write()
            .map_err(|_| E::from(Error::internal("store lock poisoned")))?;
        let mut staged = guard.clone();
        match f(&mut staged) {
            Ok(value) => {
                *guard = staged;
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    fn run_in_read_transaction<T, E, F>(
        &self,
        _ctx: &CallContext,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&dyn TransactionSlices) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let guard = self
            .state
            .read()
            .map_err(|_| E::from(Error::internal("store lock poisoned")))?;
        f(&*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntitySubType, NULL_ID, ROOT_ENTITY_ID};
    use strata_core::RealmId;

    fn ctx() -> CallContext {
        CallContext::new(RealmId::new_unchecked("test-realm"))
    }

    fn namespace(id: i64, name: &str) -> Entity {
        let mut entity = Entity::new(7, id, EntityType::Namespace, EntitySubType::Null, 7, name);
        entity.create_timestamp = 1;
        entity.last_update_timestamp = 1;
        entity
    }

    #[tokio::test]
    async fn create_then_same_id_reports_already_exists() {
        let store = InMemoryStore::new();
        let entity = namespace(10, "raw");

        let outcome = store.write_entity(&ctx(), &entity, true, None).await.unwrap();
        assert!(outcome.is_written());

        let outcome = store.write_entity(&ctx(), &entity, true, None).await.unwrap();
        let WriteOutcome::AlreadyExists(existing) = outcome else {
            panic!("expected AlreadyExists");
        };
        assert_eq!(existing.id, 10);
    }

    #[tokio::test]
    async fn name_collision_with_different_id_reports_existing_record() {
        let store = InMemoryStore::new();
        store
            .write_entity(&ctx(), &namespace(10, "raw"), true, None)
            .await
            .unwrap();

        let outcome = store
            .write_entity(&ctx(), &namespace(11, "raw"), true, None)
            .await
            .unwrap();
        let WriteOutcome::AlreadyExists(existing) = outcome else {
            panic!("expected AlreadyExists");
        };
        assert_eq!(existing.id, 10);
    }

    #[tokio::test]
    async fn stale_witness_reports_conflict() {
        let store = InMemoryStore::new();
        let entity = namespace(10, "raw");
        store.write_entity(&ctx(), &entity, true, None).await.unwrap();

        let mut updated = entity.clone();
        updated.entity_version += 1;
        store
            .write_entity(&ctx(), &updated, false, Some(&entity))
            .await
            .unwrap();

        // Second writer still holds the original witness.
        let mut racing = entity.clone();
        racing.entity_version += 1;
        let outcome = store
            .write_entity(&ctx(), &racing, false, Some(&entity))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(_)));
    }

    #[tokio::test]
    async fn rename_moves_the_active_name_entry() {
        let store = InMemoryStore::new();
        let entity = namespace(10, "raw");
        store.write_entity(&ctx(), &entity, true, None).await.unwrap();

        let mut renamed = entity.clone();
        renamed.name = "bronze".to_string();
        renamed.entity_version += 1;
        let outcome = store
            .write_entity(&ctx(), &renamed, true, Some(&entity))
            .await
            .unwrap();
        assert!(outcome.is_written());

        let by_old_name = store
            .lookup_entity_by_name(&ctx(), 7, 7, EntityType::Namespace, "raw")
            .await
            .unwrap();
        assert!(by_old_name.is_none());

        let by_new_name = store
            .lookup_entity_by_name(&ctx(), 7, 7, EntityType::Namespace, "bronze")
            .await
            .unwrap();
        assert_eq!(by_new_name.unwrap().id, 10);
    }

    #[tokio::test]
    async fn batch_write_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store
            .write_entity(&ctx(), &namespace(10, "raw"), true, None)
            .await
            .unwrap();

        // Second element collides by name, so the first must not land.
        let outcome = store
            .write_entities(&ctx(), &[namespace(11, "silver"), namespace(12, "raw")], None)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::AlreadyExists(_)));

        let silver = store
            .lookup_entity(&ctx(), 7, 11, EntityType::Namespace)
            .await
            .unwrap();
        assert!(silver.is_none());
    }

    #[test]
    fn rolled_back_transaction_leaves_no_effects_but_consumes_ids() {
        let store = InMemoryStore::new();
        let context = ctx();

        let before: i64 = store
            .run_in_transaction::<_, Error, _>(&context, |tx| Ok(tx.generate_new_id()))
            .unwrap();

        let result: std::result::Result<(), Error> =
            store.run_in_transaction(&context, |tx| {
                let _ = tx.generate_new_id();
                tx.write_entity(&namespace(10, "raw"), true, None);
                Err(Error::internal("abort"))
            });
        assert!(result.is_err());

        let after: i64 = store
            .run_in_transaction::<_, Error, _>(&context, |tx| Ok(tx.generate_new_id()))
            .unwrap();
        assert_eq!(after, before + 2, "rollback must not recycle ids");

        let visible = store
            .run_in_read_transaction::<_, Error, _>(&context, |tx| {
                Ok(tx.lookup_entity(7, 10, EntityType::Namespace))
            })
            .unwrap();
        assert!(visible.is_none(), "rollback must discard entity writes");
    }

    #[tokio::test]
    async fn grants_are_indexed_from_both_endpoints() {
        let store = InMemoryStore::new();
        let catalog = Entity::new(NULL_ID, 7, EntityType::Catalog, EntitySubType::Null, ROOT_ENTITY_ID, "prod");
        let role = Entity::new(7, 8, EntityType::CatalogRole, EntitySubType::Null, 7, "catalog_admin");
        let record = GrantRecord::new(
            &crate::entity::EntityCore::from(&catalog),
            &crate::entity::EntityCore::from(&role),
            Privilege::CatalogManageAccess,
        );

        store.write_to_grant_records(&ctx(), &record).await.unwrap();
        assert_eq!(
            store
                .load_all_grant_records_on_securable(&ctx(), NULL_ID, 7)
                .await
                .unwrap(),
            vec![record.clone()]
        );
        assert_eq!(
            store
                .load_all_grant_records_on_grantee(&ctx(), 7, 8)
                .await
                .unwrap(),
            vec![record.clone()]
        );

        store.delete_from_grant_records(&ctx(), &record).await.unwrap();
        assert!(store
            .load_all_grant_records_on_securable(&ctx(), NULL_ID, 7)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .load_all_grant_records_on_grantee(&ctx(), 7, 8)
            .await
            .unwrap()
            .is_empty());
    }
}
