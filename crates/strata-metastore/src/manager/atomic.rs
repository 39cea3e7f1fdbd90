//! The atomic (one-shot compare-and-swap) manager strategy.
//!
//! Every public operation decomposes into individually-atomic backend
//! calls. Creates are idempotent under client retries by id-matching:
//! when a write reports an existing record with the same id, the operation
//! finishes with the entity it was trying to write. Updates carry the
//! original entity as a CAS witness and surface a version mismatch as
//! `TARGET_ENTITY_CONCURRENTLY_MODIFIED`.
//!
//! ## Consistency
//!
//! Multi-entity operations (catalog creation, drop with task scheduling,
//! grant changes touching both version counters) are piecewise: each step
//! is atomic and idempotent under retry, but a reader may observe the
//! store between steps. Catalog paths are reduced to
//! `(catalog_id, parent_id)` without revalidating ancestors, so a read
//! can succeed against an ancestor that was concurrently dropped. The
//! transactional strategy closes both windows.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tracing::warn;

use strata_core::{CallContext, RealmId};

use crate::entity::{
    self, ChangeTrackingVersions, Entity, EntityCore, EntityId, EntityNameLookupRecord,
    EntitySubType, EntityType, CATALOG_ADMIN_ROLE_NAME, CLIENT_ID_PROPERTY,
    CREDENTIAL_ROTATION_REQUIRED_PROPERTY, NULL_ID, ROOT_CONTAINER_NAME, ROOT_ENTITY_ID,
    ROOT_PRINCIPAL_NAME, SERVICE_ADMIN_ROLE_NAME, STORAGE_CONFIGURATION_INFO_PROPERTY,
    STORAGE_INTEGRATION_IDENTIFIER_PROPERTY,
};
use crate::grant::{GrantRecord, Privilege};
use crate::metrics;
use crate::persistence::{AtomicPersistence, BasePersistence, WriteOutcome};
use crate::resolver::ResolvedPath;
use crate::secrets::PrincipalSecrets;
use crate::storage::{ScopedCredentials, StorageAction, StorageConfigInfo};
use crate::task::{self, DEFAULT_TASK_TIMEOUT_MILLIS, TASK_TIMEOUT_MILLIS_CONFIG};

use super::prepare;
use super::{
    CreatedCatalog, CreatedPrincipal, DropOutcome, EntityWithPath, LoadedGrants, MetastoreError,
    MetastoreManager, OpResult, ResolvedEntityState,
};

/// Manager strategy over an [`AtomicPersistence`] backend.
pub struct AtomicMetastore<P> {
    persistence: Arc<P>,
    bootstrapped: Mutex<HashSet<RealmId>>,
    backfilled: Mutex<HashSet<RealmId>>,
}

impl<P: AtomicPersistence> AtomicMetastore<P> {
    /// Creates a manager over the given backend.
    #[must_use]
    pub fn new(persistence: Arc<P>) -> Self {
        Self {
            persistence,
            bootstrapped: Mutex::new(HashSet::new()),
            backfilled: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying persistence backend.
    #[must_use]
    pub fn persistence(&self) -> &Arc<P> {
        &self.persistence
    }

    fn marker_contains(markers: &Mutex<HashSet<RealmId>>, realm: &RealmId) -> bool {
        markers
            .lock()
            .map(|set| set.contains(realm))
            .unwrap_or(false)
    }

    fn marker_insert(markers: &Mutex<HashSet<RealmId>>, realm: &RealmId) {
        if let Ok(mut set) = markers.lock() {
            set.insert(realm.clone());
        }
    }

    fn marker_clear(markers: &Mutex<HashSet<RealmId>>, realm: &RealmId) {
        if let Ok(mut set) = markers.lock() {
            set.remove(realm);
        }
    }

    /// Persists a brand-new entity. Since ids are uniquely reserved when
    /// generated, a same-id collision is a low-level client retry and the
    /// operation finishes with the entity it was trying to write, not the
    /// stored one (an update may have slipped in between the attempts).
    async fn persist_new_entity(&self, ctx: &CallContext, entity: &mut Entity) -> OpResult<()> {
        prepare::prepare_new_entity(ctx.diagnostics(), entity, ctx.clock().millis());
        match self.persistence.write_entity(ctx, entity, true, None).await? {
            WriteOutcome::Written => {
                metrics::record_entity_write();
                Ok(())
            }
            WriteOutcome::AlreadyExists(existing) if existing.id == entity.id => Ok(()),
            WriteOutcome::AlreadyExists(existing) => Err(MetastoreError::EntityAlreadyExists {
                sub_type: existing.sub_type,
            }),
            WriteOutcome::Conflict(detail) => {
                metrics::record_write_conflict();
                Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    /// Persists a changed entity under CAS on the original witness.
    async fn persist_entity_after_change(
        &self,
        ctx: &CallContext,
        mut entity: Entity,
        name_or_parent_changed: bool,
        original: &Entity,
    ) -> OpResult<Entity> {
        prepare::prepare_changed_entity(
            ctx.diagnostics(),
            &mut entity,
            original,
            ctx.clock().millis(),
        );
        match self
            .persistence
            .write_entity(ctx, &entity, name_or_parent_changed, Some(original))
            .await?
        {
            WriteOutcome::Written => {
                metrics::record_entity_write();
                Ok(entity)
            }
            WriteOutcome::AlreadyExists(existing) => Err(MetastoreError::EntityAlreadyExists {
                sub_type: existing.sub_type,
            }),
            WriteOutcome::Conflict(detail) => {
                metrics::record_write_conflict();
                Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    /// Bumps one endpoint's grant-set version under CAS.
    async fn bump_grant_records_version(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
        missing_signal: &str,
    ) -> OpResult<()> {
        let stored = ctx.diagnostics().check_not_none(
            self.persistence
                .lookup_entity(ctx, catalog_id, id, entity_type)
                .await?,
            missing_signal,
        );
        let mut bumped = stored.clone();
        bumped.grant_records_version += 1;
        match self
            .persistence
            .write_entity(ctx, &bumped, false, Some(&stored))
            .await?
        {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::AlreadyExists(_) => Err(MetastoreError::Unexpected(
                "grant version bump collided on active name".to_string(),
            )),
            WriteOutcome::Conflict(detail) => {
                metrics::record_write_conflict();
                Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    /// Creates one grant record and bumps both endpoints. The three steps
    /// are individually atomic; a failure in between leaves a retriable
    /// prefix (the record insert is idempotent).
    async fn persist_new_grant_record(
        &self,
        ctx: &CallContext,
        securable: &EntityCore,
        grantee: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord> {
        ctx.diagnostics()
            .check(grantee.entity_type.is_grantee(), "entity_must_be_grantee");

        let record = GrantRecord::new(securable, grantee, privilege);
        self.persistence.write_to_grant_records(ctx, &record).await?;

        self.bump_grant_records_version(
            ctx,
            grantee.catalog_id,
            grantee.id,
            grantee.entity_type,
            "grantee_not_found",
        )
        .await?;
        self.bump_grant_records_version(
            ctx,
            securable.catalog_id,
            securable.id,
            securable.entity_type,
            "securable_not_found",
        )
        .await?;
        Ok(record)
    }

    /// Deletes one grant record and bumps both endpoints.
    async fn revoke_grant_record(
        &self,
        ctx: &CallContext,
        securable: &EntityCore,
        grantee: &EntityCore,
        record: &GrantRecord,
    ) -> OpResult<()> {
        let diagnostics = ctx.diagnostics();
        diagnostics.check(
            securable.catalog_id == record.securable_catalog_id
                && securable.id == record.securable_id,
            "securable_mismatch",
        );
        diagnostics.check(
            grantee.catalog_id == record.grantee_catalog_id && grantee.id == record.grantee_id,
            "grantee_mismatch",
        );
        diagnostics.check(grantee.entity_type.is_grantee(), "not_a_grantee");

        self.persistence.delete_from_grant_records(ctx, record).await?;

        self.bump_grant_records_version(
            ctx,
            grantee.catalog_id,
            grantee.id,
            grantee.entity_type,
            "missing_grantee",
        )
        .await?;
        self.bump_grant_records_version(
            ctx,
            securable.catalog_id,
            securable.id,
            securable.entity_type,
            "missing_securable",
        )
        .await?;
        Ok(())
    }

    /// Creates the grant only when absent; bootstrap/backfill helper.
    async fn ensure_grant(
        &self,
        ctx: &CallContext,
        securable: &EntityCore,
        grantee: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<()> {
        let existing = self
            .persistence
            .lookup_grant_record(
                ctx,
                securable.catalog_id,
                securable.id,
                grantee.catalog_id,
                grantee.id,
                privilege,
            )
            .await?;
        if existing.is_none() {
            self.persist_new_grant_record(ctx, securable, grantee, privilege)
                .await?;
        }
        Ok(())
    }

    /// Fully removes an entity: grants both ways, counterparty version
    /// bumps, the record itself, and a principal's secrets.
    async fn drop_entity_internal(&self, ctx: &CallContext, entity: &Entity) -> OpResult<()> {
        let diagnostics = ctx.diagnostics();
        diagnostics.check(!entity.name.is_empty(), "unexpected_null_name");
        diagnostics.check(entity.drop_timestamp == 0, "already_dropped");

        let on_grantee = if entity.is_grantee() {
            self.persistence
                .load_all_grant_records_on_grantee(ctx, entity.catalog_id, entity.id)
                .await?
        } else {
            Vec::new()
        };
        let on_securable = self
            .persistence
            .load_all_grant_records_on_securable(ctx, entity.catalog_id, entity.id)
            .await?;
        self.persistence
            .delete_all_entity_grant_records(ctx, entity, &on_grantee, &on_securable)
            .await?;

        let counterparties = prepare::distinct_counterparties(&on_grantee, &on_securable);
        for counterparty in self
            .persistence
            .lookup_entities(ctx, &counterparties)
            .await?
            .into_iter()
            .flatten()
        {
            if ctx.is_cancelled() {
                break;
            }
            let mut bumped = counterparty.clone();
            bumped.grant_records_version += 1;
            match self
                .persistence
                .write_entity(ctx, &bumped, false, Some(&counterparty))
                .await?
            {
                WriteOutcome::Written => {}
                WriteOutcome::AlreadyExists(_) => {
                    return Err(MetastoreError::Unexpected(
                        "grant version bump collided on active name".to_string(),
                    ))
                }
                WriteOutcome::Conflict(detail) => {
                    metrics::record_write_conflict();
                    return Err(MetastoreError::TargetEntityConcurrentlyModified(detail));
                }
            }
        }

        self.persistence.delete_entity(ctx, entity).await?;

        if entity.entity_type == EntityType::Principal {
            let client_id = prepare::client_id_of(ctx.diagnostics(), entity);
            self.persistence
                .delete_principal_secrets(ctx, &client_id, entity.id)
                .await?;
        }
        Ok(())
    }

    /// Loads one endpoint's grant set with counterparty entities.
    async fn load_grants(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        from_securable: bool,
    ) -> OpResult<LoadedGrants> {
        let grants_version = self
            .persistence
            .lookup_entity_grant_records_version(ctx, catalog_id, id)
            .await?;
        if grants_version == 0 {
            return Err(MetastoreError::EntityNotFound);
        }

        let grants = if from_securable {
            self.persistence
                .load_all_grant_records_on_securable(ctx, catalog_id, id)
                .await?
        } else {
            self.persistence
                .load_all_grant_records_on_grantee(ctx, catalog_id, id)
                .await?
        };

        let mut counterparty_ids = BTreeSet::new();
        for record in &grants {
            counterparty_ids.insert(if from_securable {
                record.grantee_entity_id()
            } else {
                record.securable_entity_id()
            });
        }
        let ids: Vec<EntityId> = counterparty_ids.into_iter().collect();
        let entities = self
            .persistence
            .lookup_entities(ctx, &ids)
            .await?
            .into_iter()
            .flatten()
            .collect();

        Ok(LoadedGrants {
            grants_version,
            grants,
            entities,
        })
    }

    /// The full grant set for a resolved entity.
    async fn resolved_grant_records(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<Vec<GrantRecord>> {
        let mut records = if entity_type.is_grantee() {
            self.persistence
                .load_all_grant_records_on_grantee(ctx, catalog_id, id)
                .await?
        } else {
            Vec::new()
        };
        records.extend(
            self.persistence
                .load_all_grant_records_on_securable(ctx, catalog_id, id)
                .await?,
        );
        Ok(records)
    }

    async fn load_resolved_by_name_once(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> OpResult<ResolvedEntityState> {
        let entity = self
            .persistence
            .lookup_entity_by_name(ctx, catalog_id, parent_id, entity_type, name)
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;
        let grant_records = self
            .resolved_grant_records(ctx, entity.catalog_id, entity.id, entity.entity_type)
            .await?;
        Ok(ResolvedEntityState {
            grant_records_version: entity.grant_records_version,
            grant_records: Some(grant_records),
            entity: Some(entity),
        })
    }

    /// Loads an entity and its storage integration for credential ops.
    async fn load_entity_with_integration(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        entity_type: EntityType,
    ) -> OpResult<(Entity, Arc<dyn crate::storage::StorageIntegration>, StorageConfigInfo)> {
        let entity = self
            .persistence
            .lookup_entity(ctx, catalog_id, entity_id, entity_type)
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;
        let integration = ctx.diagnostics().check_not_none(
            self.persistence.load_storage_integration(ctx, &entity).await?,
            "storage_integration_not_exists",
        );
        let config = ctx.diagnostics().check_not_none(
            StorageConfigInfo::from_entity(&entity)?,
            "missing_storage_configuration",
        );
        Ok((entity, integration, config))
    }
}

#[async_trait]
impl<P: AtomicPersistence> MetastoreManager for AtomicMetastore<P> {
    async fn generate_new_entity_id(&self, ctx: &CallContext) -> OpResult<i64> {
        Ok(self.persistence.generate_new_id(ctx).await?)
    }

    async fn bootstrap_service(&self, ctx: &CallContext) -> OpResult<()> {
        if Self::marker_contains(&self.bootstrapped, ctx.realm()) {
            return Ok(());
        }

        // Every step checks for an existing record first, so a retry after
        // a partial bootstrap completes the remainder without duplicates.
        let root = match self
            .persistence
            .lookup_entity(ctx, NULL_ID, ROOT_ENTITY_ID, EntityType::Root)
            .await?
        {
            Some(existing) => existing,
            None => {
                let mut root = entity::root_container();
                self.persist_new_entity(ctx, &mut root).await?;
                root
            }
        };

        let root_principal = match self
            .persistence
            .lookup_entity_by_name(
                ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Principal,
                ROOT_PRINCIPAL_NAME,
            )
            .await?
        {
            Some(existing) => existing,
            None => {
                let id = self.persistence.generate_new_id(ctx).await?;
                let principal = Entity::new(
                    NULL_ID,
                    id,
                    EntityType::Principal,
                    EntitySubType::Null,
                    ROOT_ENTITY_ID,
                    ROOT_PRINCIPAL_NAME,
                );
                self.create_principal(ctx, principal).await?.principal
            }
        };

        let service_admin = match self
            .persistence
            .lookup_entity_by_name(
                ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::PrincipalRole,
                SERVICE_ADMIN_ROLE_NAME,
            )
            .await?
        {
            Some(existing) => existing,
            None => {
                let id = self.persistence.generate_new_id(ctx).await?;
                let mut role = Entity::new(
                    NULL_ID,
                    id,
                    EntityType::PrincipalRole,
                    EntitySubType::Null,
                    ROOT_ENTITY_ID,
                    SERVICE_ADMIN_ROLE_NAME,
                );
                self.persist_new_entity(ctx, &mut role).await?;
                role
            }
        };

        self.ensure_grant(
            ctx,
            &EntityCore::from(&service_admin),
            &EntityCore::from(&root_principal),
            Privilege::PrincipalRoleUsage,
        )
        .await?;
        self.ensure_grant(
            ctx,
            &EntityCore::from(&root),
            &EntityCore::from(&service_admin),
            Privilege::ServiceManageAccess,
        )
        .await?;

        Self::marker_insert(&self.bootstrapped, ctx.realm());
        Ok(())
    }

    async fn purge(&self, ctx: &CallContext) -> OpResult<()> {
        warn!(realm = %ctx.realm(), "deleting all metadata in the metastore");
        self.persistence.delete_all(ctx).await?;
        Self::marker_clear(&self.bootstrapped, ctx.realm());
        Self::marker_clear(&self.backfilled, ctx.realm());
        warn!(realm = %ctx.realm(), "finished deleting all metadata in the metastore");
        Ok(())
    }

    async fn create_catalog(
        &self,
        ctx: &CallContext,
        catalog: Entity,
        principal_roles: &[EntityCore],
    ) -> OpResult<CreatedCatalog> {
        let diagnostics = ctx.diagnostics();
        diagnostics.check(catalog.entity_type == EntityType::Catalog, "not_a_catalog");
        let mut catalog = catalog;

        let storage_config = catalog
            .internal_property(STORAGE_CONFIGURATION_INFO_PROPERTY)
            .map(StorageConfigInfo::deserialize)
            .transpose()?;
        let integration = match storage_config {
            Some(config)
                if catalog
                    .internal_property(STORAGE_INTEGRATION_IDENTIFIER_PROPERTY)
                    .is_none() =>
            {
                Some(
                    self.persistence
                        .create_storage_integration(ctx, catalog.catalog_id, catalog.id, &config)
                        .await?,
                )
            }
            _ => None,
        };

        // Same-id retry: the previous attempt already created the pair.
        if let Some(existing) = self
            .persistence
            .lookup_entity(ctx, catalog.catalog_id, catalog.id, EntityType::Catalog)
            .await?
        {
            let admin_role = diagnostics.check_not_none(
                self.persistence
                    .lookup_entity_by_name(
                        ctx,
                        existing.id,
                        existing.id,
                        EntityType::CatalogRole,
                        CATALOG_ADMIN_ROLE_NAME,
                    )
                    .await?,
                "catalog_admin_role_not_found",
            );
            return Ok(CreatedCatalog {
                catalog: existing,
                admin_role,
            });
        }

        if let Some(record) = self
            .persistence
            .lookup_entity_id_and_sub_type_by_name(
                ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Catalog,
                &catalog.name,
            )
            .await?
        {
            return Err(MetastoreError::EntityAlreadyExists {
                sub_type: record.sub_type,
            });
        }

        self.persistence
            .persist_storage_integration_if_needed(ctx, &catalog, integration.as_ref())
            .await?;
        self.persist_new_entity(ctx, &mut catalog).await?;

        let admin_role_id = self.persistence.generate_new_id(ctx).await?;
        let mut admin_role = Entity::new(
            catalog.id,
            admin_role_id,
            EntityType::CatalogRole,
            EntitySubType::Null,
            catalog.id,
            CATALOG_ADMIN_ROLE_NAME,
        );
        self.persist_new_entity(ctx, &mut admin_role).await?;

        let catalog_core = EntityCore::from(&catalog);
        let admin_core = EntityCore::from(&admin_role);
        self.persist_new_grant_record(
            ctx,
            &catalog_core,
            &admin_core,
            Privilege::CatalogManageAccess,
        )
        .await?;
        self.persist_new_grant_record(
            ctx,
            &catalog_core,
            &admin_core,
            Privilege::CatalogManageMetadata,
        )
        .await?;

        if principal_roles.is_empty() {
            let service_admin = diagnostics.check_not_none(
                self.persistence
                    .lookup_entity_by_name(
                        ctx,
                        NULL_ID,
                        ROOT_ENTITY_ID,
                        EntityType::PrincipalRole,
                        SERVICE_ADMIN_ROLE_NAME,
                    )
                    .await?,
                "missing_service_admin_role",
            );
            self.persist_new_grant_record(
                ctx,
                &admin_core,
                &EntityCore::from(&service_admin),
                Privilege::CatalogRoleUsage,
            )
            .await?;
        } else {
            for principal_role in principal_roles {
                diagnostics.check(
                    principal_role.entity_type == EntityType::PrincipalRole,
                    "not_a_principal_role",
                );
                self.persist_new_grant_record(
                    ctx,
                    &admin_core,
                    principal_role,
                    Privilege::CatalogRoleUsage,
                )
                .await?;
            }
        }

        let catalog = diagnostics.check_not_none(
            self.persistence
                .lookup_entity(ctx, catalog.catalog_id, catalog.id, EntityType::Catalog)
                .await?,
            "catalog_vanished",
        );
        let admin_role = diagnostics.check_not_none(
            self.persistence
                .lookup_entity(ctx, admin_role.catalog_id, admin_role.id, EntityType::CatalogRole)
                .await?,
            "catalog_admin_role_vanished",
        );
        Ok(CreatedCatalog {
            catalog,
            admin_role,
        })
    }

    async fn create_principal(
        &self,
        ctx: &CallContext,
        principal: Entity,
    ) -> OpResult<CreatedPrincipal> {
        let diagnostics = ctx.diagnostics();
        diagnostics.check(
            principal.entity_type == EntityType::Principal,
            "not_a_principal",
        );
        let mut principal = principal;

        if let Some(existing) = self
            .persistence
            .lookup_entity(ctx, principal.catalog_id, principal.id, EntityType::Principal)
            .await?
        {
            let client_id = prepare::client_id_of(diagnostics, &existing);
            let secrets = diagnostics.check_not_none(
                self.persistence.load_principal_secrets(ctx, &client_id).await?,
                "missing_principal_secrets",
            );
            return Ok(CreatedPrincipal {
                principal: existing,
                secrets,
            });
        }

        if let Some(record) = self
            .persistence
            .lookup_entity_id_and_sub_type_by_name(
                ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Principal,
                &principal.name,
            )
            .await?
        {
            return Err(MetastoreError::EntityAlreadyExists {
                sub_type: record.sub_type,
            });
        }

        let secrets = self
            .persistence
            .generate_new_principal_secrets(ctx, principal.id)
            .await?;
        principal
            .internal_properties
            .insert(CLIENT_ID_PROPERTY.to_string(), secrets.client_id.clone());

        self.persist_new_entity(ctx, &mut principal).await?;
        Ok(CreatedPrincipal { principal, secrets })
    }

    async fn load_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
    ) -> OpResult<PrincipalSecrets> {
        self.persistence
            .load_principal_secrets(ctx, client_id)
            .await?
            .ok_or(MetastoreError::EntityNotFound)
    }

    async fn rotate_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> OpResult<PrincipalSecrets> {
        let principal = self
            .persistence
            .lookup_entity(ctx, NULL_ID, principal_id, EntityType::Principal)
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;

        let marker_set = principal
            .internal_property(CREDENTIAL_ROTATION_REQUIRED_PROPERTY)
            .is_some();
        let do_reset = reset || marker_set;

        let secrets = self
            .persistence
            .rotate_principal_secrets(ctx, client_id, principal_id, do_reset, old_main_secret_hash)
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;

        // The marker write and the secrets rotation are two atomic steps;
        // a crash in between leaves the marker set and the next rotation
        // resets again, which is safe.
        if reset && !marker_set {
            let mut flagged = principal.clone();
            flagged.internal_properties.insert(
                CREDENTIAL_ROTATION_REQUIRED_PROPERTY.to_string(),
                "true".to_string(),
            );
            self.persist_entity_after_change(ctx, flagged, false, &principal)
                .await?;
        } else if !reset && marker_set {
            let mut cleared = principal.clone();
            cleared
                .internal_properties
                .remove(CREDENTIAL_ROTATION_REQUIRED_PROPERTY);
            self.persist_entity_after_change(ctx, cleared, false, &principal)
                .await?;
        }

        Ok(secrets)
    }

    async fn create_entity_if_not_exists(
        &self,
        ctx: &CallContext,
        _catalog_path: &[EntityCore],
        entity: Entity,
    ) -> OpResult<Entity> {
        let diagnostics = ctx.diagnostics();
        diagnostics.check(!entity.name.is_empty(), "unexpected_null_entity_name");
        let mut entity = entity;
        self.persist_new_entity(ctx, &mut entity).await?;
        Ok(entity)
    }

    async fn create_entities_if_not_exist(
        &self,
        ctx: &CallContext,
        _catalog_path: &[EntityCore],
        entities: Vec<Entity>,
    ) -> OpResult<Vec<Entity>> {
        let now = ctx.clock().millis();
        let mut prepared = entities;
        for entity in &mut prepared {
            prepare::prepare_new_entity(ctx.diagnostics(), entity, now);
        }

        match self.persistence.write_entities(ctx, &prepared, None).await? {
            WriteOutcome::Written => Ok(prepared),
            WriteOutcome::AlreadyExists(existing) => Err(MetastoreError::EntityAlreadyExists {
                sub_type: existing.sub_type,
            }),
            WriteOutcome::Conflict(detail) => {
                metrics::record_write_conflict();
                Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    async fn update_entity_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        _catalog_path: &[EntityCore],
        entity: &Entity,
    ) -> OpResult<Entity> {
        // The input doubles as the CAS witness: both change-tracking
        // counters must still match the stored record.
        let original = entity.clone();
        self.persist_entity_after_change(ctx, entity.clone(), false, &original)
            .await
    }

    async fn update_entities_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        entities: &[EntityWithPath],
    ) -> OpResult<Vec<Entity>> {
        let now = ctx.clock().millis();
        let mut originals = Vec::with_capacity(entities.len());
        let mut updated = Vec::with_capacity(entities.len());
        for entry in entities {
            let original = entry.entity.clone();
            let mut changed = entry.entity.clone();
            prepare::prepare_changed_entity(ctx.diagnostics(), &mut changed, &original, now);
            originals.push(original);
            updated.push(changed);
        }

        match self
            .persistence
            .write_entities(ctx, &updated, Some(&originals))
            .await?
        {
            WriteOutcome::Written => Ok(updated),
            WriteOutcome::AlreadyExists(existing) => Err(MetastoreError::EntityAlreadyExists {
                sub_type: existing.sub_type,
            }),
            WriteOutcome::Conflict(detail) => {
                metrics::record_write_conflict();
                Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    async fn rename_entity(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_to_rename: &EntityCore,
        new_catalog_path: Option<&[EntityCore]>,
        renamed_entity: Entity,
    ) -> OpResult<Entity> {
        ctx.diagnostics().check(
            new_catalog_path.is_none() || !catalog_path.is_empty(),
            "new_catalog_path_specified_without_catalog_path",
        );
        let destination = ResolvedPath::unchecked(new_catalog_path.unwrap_or(catalog_path));

        let stored = self
            .persistence
            .lookup_entity(
                ctx,
                entity_to_rename.catalog_id,
                entity_to_rename.id,
                entity_to_rename.entity_type,
            )
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;

        if stored.entity_version != renamed_entity.entity_version {
            return Err(MetastoreError::TargetEntityConcurrentlyModified(format!(
                "entity '{}' moved to version {}",
                stored.name, stored.entity_version
            )));
        }
        if stored.cannot_be_dropped_or_renamed() {
            return Err(MetastoreError::EntityCannotBeRenamed);
        }

        if let Some(record) = self
            .persistence
            .lookup_entity_id_and_sub_type_by_name(
                ctx,
                destination.catalog_id_or_null,
                destination.parent_id,
                stored.entity_type,
                &renamed_entity.name,
            )
            .await?
        {
            return Err(MetastoreError::EntityAlreadyExists {
                sub_type: record.sub_type,
            });
        }

        let mut changed = stored.clone();
        changed.name = renamed_entity.name.clone();
        changed.properties = renamed_entity.properties.clone();
        changed.internal_properties = renamed_entity.internal_properties.clone();
        if new_catalog_path.is_some() {
            changed.parent_id = destination.parent_id;
        }
        self.persist_entity_after_change(ctx, changed, true, &stored)
            .await
    }

    async fn drop_entity_if_exists(
        &self,
        ctx: &CallContext,
        _catalog_path: &[EntityCore],
        entity_to_drop: &EntityCore,
        cleanup_properties: Option<BTreeMap<String, String>>,
        cleanup: bool,
    ) -> OpResult<DropOutcome> {
        let stored = self
            .persistence
            .lookup_entity(
                ctx,
                entity_to_drop.catalog_id,
                entity_to_drop.id,
                entity_to_drop.entity_type,
            )
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;

        if stored.cannot_be_dropped_or_renamed() {
            return Err(MetastoreError::EntityUndroppable);
        }

        match stored.entity_type {
            EntityType::Catalog => {
                if self
                    .persistence
                    .has_children(ctx, Some(EntityType::Namespace), stored.id, stored.id)
                    .await?
                {
                    return Err(MetastoreError::NamespaceNotEmpty);
                }
                let catalog_roles = self
                    .persistence
                    .list_entities(
                        ctx,
                        stored.id,
                        stored.id,
                        EntityType::CatalogRole,
                        Some(2),
                        &|_| true,
                    )
                    .await?;
                if catalog_roles.len() > 1 {
                    return Err(MetastoreError::CatalogNotEmpty);
                }
                if let Some(last_role) = catalog_roles.first() {
                    self.drop_entity_internal(ctx, last_role).await?;
                }
            }
            EntityType::Namespace => {
                if self
                    .persistence
                    .has_children(ctx, None, stored.catalog_id, stored.id)
                    .await?
                {
                    return Err(MetastoreError::NamespaceNotEmpty);
                }
            }
            _ => {}
        }

        self.drop_entity_internal(ctx, &stored).await?;

        // The drop and the task insert are two atomic steps; a retry after
        // a crash in between re-runs the drop as a not-found no-op, so the
        // caller must treat EntityNotFound after a failed cleanup-drop as
        // possibly-dropped.
        if cleanup {
            let task_id = self.persistence.generate_new_id(ctx).await?;
            let mut cleanup_task =
                prepare::build_cleanup_task(&stored, cleanup_properties.as_ref(), task_id)?;
            self.persist_new_entity(ctx, &mut cleanup_task).await?;
            return Ok(DropOutcome {
                cleanup_task_id: Some(cleanup_task.id),
            });
        }
        Ok(DropOutcome::default())
    }

    async fn grant_usage_on_role_to_grantee(
        &self,
        ctx: &CallContext,
        _catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord> {
        ctx.diagnostics()
            .check(grantee.entity_type.is_grantee(), "not_a_grantee");
        let privilege = prepare::usage_privilege_for(grantee.entity_type);
        self.persist_new_grant_record(ctx, role, grantee, privilege)
            .await
    }

    async fn revoke_usage_on_role_from_grantee(
        &self,
        ctx: &CallContext,
        _catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord> {
        let privilege = prepare::usage_privilege_for(grantee.entity_type);
        let record = self
            .persistence
            .lookup_grant_record(
                ctx,
                role.catalog_id,
                role.id,
                grantee.catalog_id,
                grantee.id,
                privilege,
            )
            .await?
            .ok_or(MetastoreError::GrantNotFound)?;
        self.revoke_grant_record(ctx, role, grantee, &record).await?;
        Ok(record)
    }

    async fn grant_privilege_on_securable_to_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        _catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord> {
        self.persist_new_grant_record(ctx, securable, grantee, privilege)
            .await
    }

    async fn revoke_privilege_on_securable_from_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        _catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord> {
        let record = self
            .persistence
            .lookup_grant_record(
                ctx,
                securable.catalog_id,
                securable.id,
                grantee.catalog_id,
                grantee.id,
                privilege,
            )
            .await?
            .ok_or(MetastoreError::GrantNotFound)?;
        self.revoke_grant_record(ctx, securable, grantee, &record)
            .await?;
        Ok(record)
    }

    async fn load_grants_on_securable(
        &self,
        ctx: &CallContext,
        securable_catalog_id: i64,
        securable_id: i64,
    ) -> OpResult<LoadedGrants> {
        self.load_grants(ctx, securable_catalog_id, securable_id, true)
            .await
    }

    async fn load_grants_to_grantee(
        &self,
        ctx: &CallContext,
        grantee_catalog_id: i64,
        grantee_id: i64,
    ) -> OpResult<LoadedGrants> {
        self.load_grants(ctx, grantee_catalog_id, grantee_id, false)
            .await
    }

    async fn read_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
        name: &str,
    ) -> OpResult<Entity> {
        let resolved = ResolvedPath::unchecked(catalog_path);
        self.persistence
            .lookup_entity_by_name(
                ctx,
                resolved.catalog_id_or_null,
                resolved.parent_id,
                entity_type,
                name,
            )
            .await?
            .filter(|entity| prepare::sub_type_matches(sub_type, entity))
            .ok_or(MetastoreError::EntityNotFound)
    }

    async fn list_entities(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
    ) -> OpResult<Vec<EntityNameLookupRecord>> {
        let resolved = ResolvedPath::unchecked(catalog_path);
        let entities = self
            .persistence
            .list_entities(
                ctx,
                resolved.catalog_id_or_null,
                resolved.parent_id,
                entity_type,
                None,
                &|entity| prepare::sub_type_matches(sub_type, entity),
            )
            .await?;
        Ok(entities.iter().map(EntityNameLookupRecord::from).collect())
    }

    async fn load_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<Entity> {
        self.persistence
            .lookup_entity(ctx, catalog_id, id, entity_type)
            .await?
            .ok_or(MetastoreError::EntityNotFound)
    }

    async fn load_entities_change_tracking(
        &self,
        ctx: &CallContext,
        ids: &[EntityId],
    ) -> OpResult<Vec<Option<ChangeTrackingVersions>>> {
        Ok(self.persistence.lookup_entity_versions(ctx, ids).await?)
    }

    async fn load_resolved_entity_by_id(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<ResolvedEntityState> {
        let entity = self
            .persistence
            .lookup_entity(ctx, catalog_id, id, entity_type)
            .await?
            .ok_or(MetastoreError::EntityNotFound)?;
        let grant_records = self
            .resolved_grant_records(ctx, catalog_id, id, entity_type)
            .await?;
        Ok(ResolvedEntityState {
            grant_records_version: entity.grant_records_version,
            grant_records: Some(grant_records),
            entity: Some(entity),
        })
    }

    async fn load_resolved_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        parent_id: i64,
        entity_type: EntityType,
        name: &str,
    ) -> OpResult<ResolvedEntityState> {
        let first_attempt = self
            .load_resolved_by_name_once(ctx, catalog_id, parent_id, entity_type, name)
            .await;

        let missing_root = matches!(first_attempt, Err(MetastoreError::EntityNotFound))
            && entity_type == EntityType::Root
            && name == ROOT_CONTAINER_NAME;
        if !missing_root || Self::marker_contains(&self.backfilled, ctx.realm()) {
            return first_attempt;
        }

        // Backfill the root container, then ensure the service-admin grant
        // regardless of which backfill step a previous crash reached.
        let root = match self
            .persistence
            .lookup_entity(ctx, NULL_ID, ROOT_ENTITY_ID, EntityType::Root)
            .await?
        {
            Some(existing) => existing,
            None => {
                let mut root = entity::root_container();
                self.persist_new_entity(ctx, &mut root).await?;
                root
            }
        };
        if let Some(service_admin) = self
            .persistence
            .lookup_entity_by_name(
                ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::PrincipalRole,
                SERVICE_ADMIN_ROLE_NAME,
            )
            .await?
        {
            self.ensure_grant(
                ctx,
                &EntityCore::from(&root),
                &EntityCore::from(&service_admin),
                Privilege::ServiceManageAccess,
            )
            .await?;
        }
        Self::marker_insert(&self.backfilled, ctx.realm());

        self.load_resolved_by_name_once(ctx, catalog_id, parent_id, entity_type, name)
            .await
    }

    async fn refresh_resolved_entity(
        &self,
        ctx: &CallContext,
        entity_version: u32,
        grant_records_version: u32,
        entity_type: EntityType,
        catalog_id: i64,
        id: i64,
    ) -> OpResult<ResolvedEntityState> {
        let versions = self
            .persistence
            .lookup_entity_versions(ctx, &[EntityId::new(catalog_id, id)])
            .await?
            .into_iter()
            .next()
            .flatten()
            .ok_or(MetastoreError::EntityNotFound)?;

        let entity = if versions.entity_version == entity_version {
            None
        } else {
            Some(
                self.persistence
                    .lookup_entity(ctx, catalog_id, id, entity_type)
                    .await?
                    .ok_or(MetastoreError::EntityNotFound)?,
            )
        };

        let grant_records = if versions.grant_records_version == grant_records_version {
            None
        } else {
            Some(
                self.resolved_grant_records(ctx, catalog_id, id, entity_type)
                    .await?,
            )
        };

        Ok(ResolvedEntityState {
            entity,
            grant_records_version: versions.grant_records_version,
            grant_records,
        })
    }

    async fn load_tasks(
        &self,
        ctx: &CallContext,
        executor_id: &str,
        limit: usize,
    ) -> OpResult<Vec<Entity>> {
        let timeout = ctx
            .config()
            .get_i64(TASK_TIMEOUT_MILLIS_CONFIG, DEFAULT_TASK_TIMEOUT_MILLIS);
        let now = ctx.clock().millis();

        let leasable = move |candidate: &Entity| {
            let state = task::parse_task_state(candidate);
            task::is_leasable(&state, now, timeout)
        };
        let available = self
            .persistence
            .list_entities(
                ctx,
                ROOT_ENTITY_ID,
                ROOT_ENTITY_ID,
                EntityType::Task,
                Some(limit),
                &leasable,
            )
            .await?;

        let mut leased = Vec::new();
        let mut failed_leases = 0usize;
        for stored in available {
            if ctx.is_cancelled() {
                break;
            }
            let mut updated = stored.clone();
            task::mark_attempt(&mut updated, executor_id, now);
            match self
                .persist_entity_after_change(ctx, updated, false, &stored)
                .await
            {
                Ok(task) => leased.push(task),
                Err(MetastoreError::TargetEntityConcurrentlyModified(_)) => {
                    // Another executor won the CAS; skip the task.
                    failed_leases += 1;
                }
                Err(other) => return Err(other),
            }
        }

        // The contract only allows an empty result once no leasable tasks
        // remain; losing every race must surface as a retriable conflict.
        if leased.is_empty() && failed_leases > 0 {
            warn!(
                executor_id,
                failed_leases, "failed to lease any task due to concurrent leases"
            );
            return Err(MetastoreError::TargetEntityConcurrentlyModified(format!(
                "failed to lease any of {failed_leases} tasks due to concurrent leases"
            )));
        }
        metrics::record_tasks_leased(leased.len());
        Ok(leased)
    }

    async fn get_subscoped_creds_for_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        entity_type: EntityType,
        allow_list_operation: bool,
        read_locations: &BTreeSet<String>,
        write_locations: &BTreeSet<String>,
    ) -> OpResult<ScopedCredentials> {
        ctx.diagnostics().check(
            !read_locations.is_empty() || !write_locations.is_empty(),
            "allowed_locations_to_subscope_is_required",
        );

        let (_, integration, config) = self
            .load_entity_with_integration(ctx, catalog_id, entity_id, entity_type)
            .await?;
        integration
            .subscoped_creds(
                ctx.diagnostics(),
                &config,
                allow_list_operation,
                read_locations,
                write_locations,
            )
            .map_err(|e| MetastoreError::SubscopeCredsError(e.to_string()))
    }

    async fn validate_access_to_locations(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        entity_id: i64,
        entity_type: EntityType,
        actions: &BTreeSet<StorageAction>,
        locations: &BTreeSet<String>,
    ) -> OpResult<BTreeMap<String, String>> {
        ctx.diagnostics().check(
            !actions.is_empty() && !locations.is_empty(),
            "locations_and_operations_privileges_are_required",
        );

        let (_, integration, config) = self
            .load_entity_with_integration(ctx, catalog_id, entity_id, entity_type)
            .await?;
        integration
            .validate_access_to_locations(&config, actions, locations)
            .into_iter()
            .map(|(location, result)| {
                serde_json::to_string(&result)
                    .map(|json| (location, json))
                    .map_err(|e| MetastoreError::Unexpected(e.to_string()))
            })
            .collect()
    }
}
