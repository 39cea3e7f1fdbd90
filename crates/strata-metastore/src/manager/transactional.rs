//! The transactional manager strategy.
//!
//! Every public operation runs inside one backend-managed read-write (or
//! read-only) transaction: the strategy re-reads entities by id, performs
//! the resolver pass over the caller's catalog path, mutates the required
//! slices and commits. Any expected predicate failure returns early and
//! rolls the whole transaction back, so mutations become visible to
//! concurrent readers all together or not at all.

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
use crate::persistence::{TransactionSlices, TransactionalPersistence, WriteOutcome};
use crate::resolver::{resolve_catalog_path, ResolvedPath};
use crate::secrets::PrincipalSecrets;
use crate::storage::{ScopedCredentials, StorageAction, StorageConfigInfo, StorageIntegration};
use crate::task::{
    self, DEFAULT_TASK_TIMEOUT_MILLIS, TASK_TIMEOUT_MILLIS_CONFIG,
};

use super::prepare;
use super::{
    CreatedCatalog, CreatedPrincipal, DropOutcome, EntityWithPath, LoadedGrants, MetastoreError,
    MetastoreManager, OpResult, ResolvedEntityState,
};

/// Manager strategy over a [`TransactionalPersistence`] backend.
pub struct TransactionalMetastore<P> {
    persistence: Arc<P>,
    bootstrapped: Mutex<HashSet<RealmId>>,
    backfilled: Mutex<HashSet<RealmId>>,
}

impl<P: TransactionalPersistence> TransactionalMetastore<P> {
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
}

/// Maps a path-resolution failure to the operation status.
fn resolve(
    ctx: &CallContext,
    tx: &dyn TransactionSlices,
    path: &[EntityCore],
) -> OpResult<ResolvedPath> {
    resolve_catalog_path(tx, ctx.diagnostics(), path)
        .map_err(|e| MetastoreError::CatalogPathCannotBeResolved(e.detail))
}

/// Persists a brand-new entity. A same-id collision is a client retry and
/// succeeds idempotently; a same-name collision with a different id is an
/// expected failure.
fn persist_new_entity(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    entity: &mut Entity,
) -> OpResult<()> {
    prepare::prepare_new_entity(ctx.diagnostics(), entity, ctx.clock().millis());
    match tx.write_entity(entity, true, None) {
        WriteOutcome::Written => {
            metrics::record_entity_write();
            Ok(())
        }
        WriteOutcome::AlreadyExists(existing) if existing.id == entity.id => Ok(()),
        WriteOutcome::AlreadyExists(existing) => Err(MetastoreError::EntityAlreadyExists {
            sub_type: existing.sub_type,
        }),
        WriteOutcome::Conflict(detail) => {
            Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
        }
    }
}

/// Persists a changed entity with its original as the CAS witness.
fn persist_entity_after_change(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    mut entity: Entity,
    name_or_parent_changed: bool,
    original: &Entity,
) -> OpResult<Entity> {
    prepare::prepare_changed_entity(ctx.diagnostics(), &mut entity, original, ctx.clock().millis());
    match tx.write_entity(&entity, name_or_parent_changed, Some(original)) {
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

/// Bumps the grant-set version of one grant endpoint.
fn bump_grant_records_version(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    catalog_id: i64,
    id: i64,
    entity_type: EntityType,
    missing_signal: &str,
) -> OpResult<()> {
    let stored = ctx.diagnostics().check_not_none(
        tx.lookup_entity(catalog_id, id, entity_type),
        missing_signal,
    );
    let mut bumped = stored.clone();
    bumped.grant_records_version += 1;
    match tx.write_entity(&bumped, false, Some(&stored)) {
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

/// Creates and persists one grant record, bumping the grant-set version of
/// both the grantee and the securable.
fn persist_new_grant_record(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    securable: &EntityCore,
    grantee: &EntityCore,
    privilege: Privilege,
) -> OpResult<GrantRecord> {
    ctx.diagnostics()
        .check(grantee.entity_type.is_grantee(), "entity_must_be_grantee");

    let record = GrantRecord::new(securable, grantee, privilege);
    tx.write_to_grant_records(&record);

    bump_grant_records_version(
        ctx,
        tx,
        grantee.catalog_id,
        grantee.id,
        grantee.entity_type,
        "grantee_not_found",
    )?;
    bump_grant_records_version(
        ctx,
        tx,
        securable.catalog_id,
        securable.id,
        securable.entity_type,
        "securable_not_found",
    )?;
    Ok(record)
}

/// Deletes one grant record, bumping both endpoints' grant-set versions.
fn revoke_grant_record(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    securable: &EntityCore,
    grantee: &EntityCore,
    record: &GrantRecord,
) -> OpResult<()> {
    let diagnostics = ctx.diagnostics();
    diagnostics.check(
        securable.catalog_id == record.securable_catalog_id && securable.id == record.securable_id,
        "securable_mismatch",
    );
    diagnostics.check(
        grantee.catalog_id == record.grantee_catalog_id && grantee.id == record.grantee_id,
        "grantee_mismatch",
    );
    diagnostics.check(grantee.entity_type.is_grantee(), "not_a_grantee");

    tx.delete_from_grant_records(record);

    bump_grant_records_version(
        ctx,
        tx,
        grantee.catalog_id,
        grantee.id,
        grantee.entity_type,
        "missing_grantee",
    )?;
    bump_grant_records_version(
        ctx,
        tx,
        securable.catalog_id,
        securable.id,
        securable.entity_type,
        "missing_securable",
    )?;
    Ok(())
}

/// Creates the grant only when it does not already exist; used by the
/// idempotent bootstrap and backfill paths.
fn ensure_grant(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    securable: &EntityCore,
    grantee: &EntityCore,
    privilege: Privilege,
) -> OpResult<()> {
    let existing = tx.lookup_grant_record(
        securable.catalog_id,
        securable.id,
        grantee.catalog_id,
        grantee.id,
        privilege,
    );
    if existing.is_none() {
        persist_new_grant_record(ctx, tx, securable, grantee, privilege)?;
    }
    Ok(())
}

/// Fully removes an entity: all grants to and from it are deleted with
/// reciprocal version bumps, the record is removed from every slice, and a
/// principal's secrets go with it.
fn drop_entity_internal(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    entity: &Entity,
) -> OpResult<()> {
    let diagnostics = ctx.diagnostics();
    diagnostics.check(!entity.name.is_empty(), "unexpected_null_name");
    diagnostics.check(entity.drop_timestamp == 0, "already_dropped");

    let on_grantee = if entity.is_grantee() {
        tx.load_all_grant_records_on_grantee(entity.catalog_id, entity.id)
    } else {
        Vec::new()
    };
    let on_securable = tx.load_all_grant_records_on_securable(entity.catalog_id, entity.id);
    tx.delete_all_entity_grant_records(entity, &on_grantee, &on_securable);

    // Every counterparty of a removed grant gets its grant version bumped
    // so cached grant sets are invalidated.
    let counterparties = prepare::distinct_counterparties(&on_grantee, &on_securable);
    for counterparty in tx
        .lookup_entities(&counterparties)
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
    {
        let mut bumped = counterparty.clone();
        bumped.grant_records_version += 1;
        match tx.write_entity(&bumped, false, Some(&counterparty)) {
            WriteOutcome::Written => {}
            WriteOutcome::AlreadyExists(_) => {
                return Err(MetastoreError::Unexpected(
                    "grant version bump collided on active name".to_string(),
                ))
            }
            WriteOutcome::Conflict(detail) => {
                return Err(MetastoreError::TargetEntityConcurrentlyModified(detail))
            }
        }
    }

    tx.delete_entity(entity);

    if entity.entity_type == EntityType::Principal {
        let client_id = prepare::client_id_of(ctx.diagnostics(), entity);
        tx.delete_principal_secrets(&client_id, entity.id);
    }
    Ok(())
}

/// Creates a principal inside a transaction, generating its secrets and
/// stamping the client id into its internal properties.
fn create_principal_in_tx(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    mut principal: Entity,
) -> OpResult<CreatedPrincipal> {
    let diagnostics = ctx.diagnostics();
    diagnostics.check(
        principal.entity_type == EntityType::Principal,
        "not_a_principal",
    );

    // A same-id record is a client retry: hand back the stored principal
    // with its existing secrets.
    if let Some(existing) =
        tx.lookup_entity(principal.catalog_id, principal.id, EntityType::Principal)
    {
        let client_id = prepare::client_id_of(diagnostics, &existing);
        let secrets = diagnostics.check_not_none(
            tx.load_principal_secrets(&client_id),
            "missing_principal_secrets",
        );
        return Ok(CreatedPrincipal {
            principal: existing,
            secrets,
        });
    }

    if let Some(record) = tx.lookup_entity_id_and_sub_type_by_name(
        NULL_ID,
        ROOT_ENTITY_ID,
        EntityType::Principal,
        &principal.name,
    ) {
        return Err(MetastoreError::EntityAlreadyExists {
            sub_type: record.sub_type,
        });
    }

    let secrets = tx.generate_new_principal_secrets(principal.id);
    principal.internal_properties.insert(
        CLIENT_ID_PROPERTY.to_string(),
        secrets.client_id.clone(),
    );
    persist_new_entity(ctx, tx, &mut principal)?;
    Ok(CreatedPrincipal { principal, secrets })
}

/// Loads the grant set of an entity from one endpoint's perspective,
/// together with each distinct counterparty entity.
fn load_grants_in_tx(
    tx: &dyn TransactionSlices,
    catalog_id: i64,
    id: i64,
    from_securable: bool,
) -> OpResult<LoadedGrants> {
    let grants_version = tx.lookup_entity_grant_records_version(catalog_id, id);
    if grants_version == 0 {
        return Err(MetastoreError::EntityNotFound);
    }

    let grants = if from_securable {
        tx.load_all_grant_records_on_securable(catalog_id, id)
    } else {
        tx.load_all_grant_records_on_grantee(catalog_id, id)
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
    let entities = tx.lookup_entities(&ids).into_iter().flatten().collect();

    Ok(LoadedGrants {
        grants_version,
        grants,
        entities,
    })
}

/// The full grant set of a resolved entity: securable records always,
/// grantee records additionally when the entity can receive privileges.
fn resolved_grant_records(tx: &dyn TransactionSlices, entity: &Entity) -> Vec<GrantRecord> {
    let mut records = if entity.is_grantee() {
        tx.load_all_grant_records_on_grantee(entity.catalog_id, entity.id)
    } else {
        Vec::new()
    };
    records.extend(tx.load_all_grant_records_on_securable(entity.catalog_id, entity.id));
    records
}

/// By-name resolved-entity lookup shared by the first attempt and the
/// post-backfill retry.
fn load_resolved_by_name_in_tx(
    tx: &dyn TransactionSlices,
    catalog_id: i64,
    parent_id: i64,
    entity_type: EntityType,
    name: &str,
) -> OpResult<ResolvedEntityState> {
    let entity = tx
        .lookup_entity_by_name(catalog_id, parent_id, entity_type, name)
        .ok_or(MetastoreError::EntityNotFound)?;
    let grant_records = resolved_grant_records(tx, &entity);
    Ok(ResolvedEntityState {
        grant_records_version: entity.grant_records_version,
        grant_records: Some(grant_records),
        entity: Some(entity),
    })
}

#[async_trait]
impl<P: TransactionalPersistence> MetastoreManager for TransactionalMetastore<P> {
    async fn generate_new_entity_id(&self, ctx: &CallContext) -> OpResult<i64> {
        self.persistence
            .run_in_transaction(ctx, |tx| Ok(tx.generate_new_id()))
    }

    async fn bootstrap_service(&self, ctx: &CallContext) -> OpResult<()> {
        if Self::marker_contains(&self.bootstrapped, ctx.realm()) {
            return Ok(());
        }

        self.persistence.run_in_transaction(ctx, |tx| {
            // Each bootstrap entity is looked up before creation and each
            // grant before insertion, so a retry after a partial bootstrap
            // completes the remainder.
            let root = match tx.lookup_entity(NULL_ID, ROOT_ENTITY_ID, EntityType::Root) {
                Some(existing) => existing,
                None => {
                    let mut root = entity::root_container();
                    persist_new_entity(ctx, tx, &mut root)?;
                    root
                }
            };

            let root_principal = match tx.lookup_entity_by_name(
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Principal,
                ROOT_PRINCIPAL_NAME,
            ) {
                Some(existing) => existing,
                None => {
                    let principal = Entity::new(
                        NULL_ID,
                        tx.generate_new_id(),
                        EntityType::Principal,
                        EntitySubType::Null,
                        ROOT_ENTITY_ID,
                        ROOT_PRINCIPAL_NAME,
                    );
                    create_principal_in_tx(ctx, tx, principal)?.principal
                }
            };

            let service_admin = match tx.lookup_entity_by_name(
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::PrincipalRole,
                SERVICE_ADMIN_ROLE_NAME,
            ) {
                Some(existing) => existing,
                None => {
                    let mut role = Entity::new(
                        NULL_ID,
                        tx.generate_new_id(),
                        EntityType::PrincipalRole,
                        EntitySubType::Null,
                        ROOT_ENTITY_ID,
                        SERVICE_ADMIN_ROLE_NAME,
                    );
                    persist_new_entity(ctx, tx, &mut role)?;
                    role
                }
            };

            ensure_grant(
                ctx,
                tx,
                &EntityCore::from(&service_admin),
                &EntityCore::from(&root_principal),
                Privilege::PrincipalRoleUsage,
            )?;
            ensure_grant(
                ctx,
                tx,
                &EntityCore::from(&root),
                &EntityCore::from(&service_admin),
                Privilege::ServiceManageAccess,
            )?;
            Ok::<(), MetastoreError>(())
        })?;

        Self::marker_insert(&self.bootstrapped, ctx.realm());
        Ok(())
    }

    async fn purge(&self, ctx: &CallContext) -> OpResult<()> {
        warn!(realm = %ctx.realm(), "deleting all metadata in the metastore");
        self.persistence
            .run_action_in_transaction(ctx, |tx| {
                tx.delete_all();
                Ok(())
            })
            .map(|()| {
                Self::marker_clear(&self.bootstrapped, ctx.realm());
                Self::marker_clear(&self.backfilled, ctx.realm());
                warn!(realm = %ctx.realm(), "finished deleting all metadata in the metastore");
            })
    }

    async fn create_catalog(
        &self,
        ctx: &CallContext,
        catalog: Entity,
        principal_roles: &[EntityCore],
    ) -> OpResult<CreatedCatalog> {
        self.persistence.run_in_transaction(ctx, |tx| {
            let diagnostics = ctx.diagnostics();
            diagnostics.check(catalog.entity_type == EntityType::Catalog, "not_a_catalog");
            let mut catalog = catalog.clone();

            // A storage configuration without a persisted integration
            // identifier means the integration must be created now, before
            // the catalog record is written.
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
                    Some(tx.create_storage_integration(catalog.catalog_id, catalog.id, &config))
                }
                _ => None,
            };

            // Same-id retry: hand back the previously created pair.
            if let Some(existing) =
                tx.lookup_entity(catalog.catalog_id, catalog.id, EntityType::Catalog)
            {
                let admin_role = diagnostics.check_not_none(
                    tx.lookup_entity_by_name(
                        existing.id,
                        existing.id,
                        EntityType::CatalogRole,
                        CATALOG_ADMIN_ROLE_NAME,
                    ),
                    "catalog_admin_role_not_found",
                );
                return Ok(CreatedCatalog {
                    catalog: existing,
                    admin_role,
                });
            }

            if let Some(record) = tx.lookup_entity_id_and_sub_type_by_name(
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Catalog,
                &catalog.name,
            ) {
                return Err(MetastoreError::EntityAlreadyExists {
                    sub_type: record.sub_type,
                });
            }

            tx.persist_storage_integration_if_needed(&catalog, integration.as_ref());
            persist_new_entity(ctx, tx, &mut catalog)?;

            let mut admin_role = Entity::new(
                catalog.id,
                tx.generate_new_id(),
                EntityType::CatalogRole,
                EntitySubType::Null,
                catalog.id,
                CATALOG_ADMIN_ROLE_NAME,
            );
            persist_new_entity(ctx, tx, &mut admin_role)?;

            let catalog_core = EntityCore::from(&catalog);
            let admin_core = EntityCore::from(&admin_role);
            persist_new_grant_record(
                ctx,
                tx,
                &catalog_core,
                &admin_core,
                Privilege::CatalogManageAccess,
            )?;
            persist_new_grant_record(
                ctx,
                tx,
                &catalog_core,
                &admin_core,
                Privilege::CatalogManageMetadata,
            )?;

            if principal_roles.is_empty() {
                // No explicit recipients: the service-admin role picks up
                // usage of the new admin role.
                let service_admin = diagnostics.check_not_none(
                    tx.lookup_entity_by_name(
                        NULL_ID,
                        ROOT_ENTITY_ID,
                        EntityType::PrincipalRole,
                        SERVICE_ADMIN_ROLE_NAME,
                    ),
                    "missing_service_admin_role",
                );
                persist_new_grant_record(
                    ctx,
                    tx,
                    &admin_core,
                    &EntityCore::from(&service_admin),
                    Privilege::CatalogRoleUsage,
                )?;
            } else {
                for principal_role in principal_roles {
                    diagnostics.check(
                        principal_role.entity_type == EntityType::PrincipalRole,
                        "not_a_principal_role",
                    );
                    persist_new_grant_record(
                        ctx,
                        tx,
                        &admin_core,
                        principal_role,
                        Privilege::CatalogRoleUsage,
                    )?;
                }
            }

            // Re-read both records so the result carries the final
            // grant-set versions.
            let catalog = diagnostics.check_not_none(
                tx.lookup_entity(catalog.catalog_id, catalog.id, EntityType::Catalog),
                "catalog_vanished",
            );
            let admin_role = diagnostics.check_not_none(
                tx.lookup_entity(admin_role.catalog_id, admin_role.id, EntityType::CatalogRole),
                "catalog_admin_role_vanished",
            );
            Ok(CreatedCatalog {
                catalog,
                admin_role,
            })
        })
    }

    async fn create_principal(
        &self,
        ctx: &CallContext,
        principal: Entity,
    ) -> OpResult<CreatedPrincipal> {
        self.persistence
            .run_in_transaction(ctx, |tx| create_principal_in_tx(ctx, tx, principal.clone()))
    }

    async fn load_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
    ) -> OpResult<PrincipalSecrets> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            tx.load_principal_secrets(client_id)
                .ok_or(MetastoreError::EntityNotFound)
        })
    }

    async fn rotate_principal_secrets(
        &self,
        ctx: &CallContext,
        client_id: &str,
        principal_id: i64,
        reset: bool,
        old_main_secret_hash: &str,
    ) -> OpResult<PrincipalSecrets> {
        self.persistence.run_in_transaction(ctx, |tx| {
            let principal = tx
                .lookup_entity(NULL_ID, principal_id, EntityType::Principal)
                .ok_or(MetastoreError::EntityNotFound)?;

            // A pending rotation-required marker forces a reset even when
            // the caller did not ask for one.
            let marker_set = principal
                .internal_property(CREDENTIAL_ROTATION_REQUIRED_PROPERTY)
                .is_some();
            let do_reset = reset || marker_set;

            let secrets = tx
                .rotate_principal_secrets(client_id, principal_id, do_reset, old_main_secret_hash)
                .ok_or(MetastoreError::EntityNotFound)?;

            if reset && !marker_set {
                let mut flagged = principal.clone();
                flagged.internal_properties.insert(
                    CREDENTIAL_ROTATION_REQUIRED_PROPERTY.to_string(),
                    "true".to_string(),
                );
                persist_entity_after_change(ctx, tx, flagged, false, &principal)?;
            } else if !reset && marker_set {
                let mut cleared = principal.clone();
                cleared
                    .internal_properties
                    .remove(CREDENTIAL_ROTATION_REQUIRED_PROPERTY);
                persist_entity_after_change(ctx, tx, cleared, false, &principal)?;
            }

            Ok(secrets)
        })
    }

    async fn create_entity_if_not_exists(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity: Entity,
    ) -> OpResult<Entity> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;
            create_entity_in_tx(ctx, tx, entity.clone())
        })
    }

    async fn create_entities_if_not_exist(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entities: Vec<Entity>,
    ) -> OpResult<Vec<Entity>> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;
            let mut created = Vec::with_capacity(entities.len());
            for entity in &entities {
                created.push(create_entity_in_tx(ctx, tx, entity.clone())?);
            }
            Ok(created)
        })
    }

    async fn update_entity_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity: &Entity,
    ) -> OpResult<Entity> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;
            update_entity_in_tx(ctx, tx, entity)
        })
    }

    async fn update_entities_properties_if_not_changed(
        &self,
        ctx: &CallContext,
        entities: &[EntityWithPath],
    ) -> OpResult<Vec<Entity>> {
        self.persistence.run_in_transaction(ctx, |tx| {
            let mut updated = Vec::with_capacity(entities.len());
            for entry in entities {
                if ctx.is_cancelled() {
                    break;
                }
                resolve(ctx, tx, &entry.catalog_path)?;
                updated.push(update_entity_in_tx(ctx, tx, &entry.entity)?);
            }
            Ok(updated)
        })
    }

    async fn rename_entity(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_to_rename: &EntityCore,
        new_catalog_path: Option<&[EntityCore]>,
        renamed_entity: Entity,
    ) -> OpResult<Entity> {
        self.persistence.run_in_transaction(ctx, |tx| {
            ctx.diagnostics().check(
                new_catalog_path.is_none() || !catalog_path.is_empty(),
                "new_catalog_path_specified_without_catalog_path",
            );

            resolve(ctx, tx, catalog_path)?;
            let destination = match new_catalog_path {
                Some(new_path) => resolve(ctx, tx, new_path)?,
                None => ResolvedPath {
                    catalog_id_or_null: entity_to_rename.catalog_id,
                    parent_id: entity_to_rename.parent_id,
                },
            };

            let stored = tx
                .lookup_entity(
                    entity_to_rename.catalog_id,
                    entity_to_rename.id,
                    entity_to_rename.entity_type,
                )
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

            if let Some(record) = tx.lookup_entity_id_and_sub_type_by_name(
                destination.catalog_id_or_null,
                destination.parent_id,
                stored.entity_type,
                &renamed_entity.name,
            ) {
                return Err(MetastoreError::EntityAlreadyExists {
                    sub_type: record.sub_type,
                });
            }

            let mut changed = stored.clone();
            changed.name = renamed_entity.name.clone();
            changed.properties = renamed_entity.properties.clone();
            changed.internal_properties = renamed_entity.internal_properties.clone();
            changed.parent_id = destination.parent_id;
            persist_entity_after_change(ctx, tx, changed, true, &stored)
        })
    }

    async fn drop_entity_if_exists(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_to_drop: &EntityCore,
        cleanup_properties: Option<BTreeMap<String, String>>,
        cleanup: bool,
    ) -> OpResult<DropOutcome> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;

            let stored = tx
                .lookup_entity(
                    entity_to_drop.catalog_id,
                    entity_to_drop.id,
                    entity_to_drop.entity_type,
                )
                .ok_or(MetastoreError::EntityNotFound)?;

            if stored.cannot_be_dropped_or_renamed() {
                return Err(MetastoreError::EntityUndroppable);
            }

            match stored.entity_type {
                EntityType::Catalog => {
                    if tx.has_children(Some(EntityType::Namespace), stored.id, stored.id) {
                        return Err(MetastoreError::NamespaceNotEmpty);
                    }
                    let catalog_roles = tx.list_entities(
                        stored.id,
                        stored.id,
                        EntityType::CatalogRole,
                        Some(2),
                        &|_| true,
                    );
                    if catalog_roles.len() > 1 {
                        return Err(MetastoreError::CatalogNotEmpty);
                    }
                    // The last remaining role is the admin role; it goes
                    // down with its catalog.
                    if let Some(last_role) = catalog_roles.first() {
                        drop_entity_internal(ctx, tx, last_role)?;
                    }
                }
                EntityType::Namespace => {
                    if tx.has_children(None, stored.catalog_id, stored.id) {
                        return Err(MetastoreError::NamespaceNotEmpty);
                    }
                }
                _ => {}
            }

            drop_entity_internal(ctx, tx, &stored)?;

            if cleanup {
                let mut cleanup_task = prepare::build_cleanup_task(
                    &stored,
                    cleanup_properties.as_ref(),
                    tx.generate_new_id(),
                )?;
                persist_new_entity(ctx, tx, &mut cleanup_task)?;
                return Ok(DropOutcome {
                    cleanup_task_id: Some(cleanup_task.id),
                });
            }
            Ok(DropOutcome::default())
        })
    }

    async fn grant_usage_on_role_to_grantee(
        &self,
        ctx: &CallContext,
        _catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord> {
        self.persistence.run_in_transaction(ctx, |tx| {
            ctx.diagnostics()
                .check(grantee.entity_type.is_grantee(), "not_a_grantee");
            let privilege = prepare::usage_privilege_for(grantee.entity_type);
            revalidate_grant_endpoints(tx, role, grantee)?;
            persist_new_grant_record(ctx, tx, role, grantee, privilege)
        })
    }

    async fn revoke_usage_on_role_from_grantee(
        &self,
        ctx: &CallContext,
        _catalog: Option<&EntityCore>,
        role: &EntityCore,
        grantee: &EntityCore,
    ) -> OpResult<GrantRecord> {
        self.persistence.run_in_transaction(ctx, |tx| {
            let privilege = prepare::usage_privilege_for(grantee.entity_type);
            revalidate_grant_endpoints(tx, role, grantee)?;
            let record = tx
                .lookup_grant_record(
                    role.catalog_id,
                    role.id,
                    grantee.catalog_id,
                    grantee.id,
                    privilege,
                )
                .ok_or(MetastoreError::GrantNotFound)?;
            revoke_grant_record(ctx, tx, role, grantee, &record)?;
            Ok(record)
        })
    }

    async fn grant_privilege_on_securable_to_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;
            revalidate_grant_endpoints(tx, securable, grantee)?;
            persist_new_grant_record(ctx, tx, securable, grantee, privilege)
        })
    }

    async fn revoke_privilege_on_securable_from_role(
        &self,
        ctx: &CallContext,
        grantee: &EntityCore,
        catalog_path: &[EntityCore],
        securable: &EntityCore,
        privilege: Privilege,
    ) -> OpResult<GrantRecord> {
        self.persistence.run_in_transaction(ctx, |tx| {
            resolve(ctx, tx, catalog_path)?;
            revalidate_grant_endpoints(tx, securable, grantee)?;
            let record = tx
                .lookup_grant_record(
                    securable.catalog_id,
                    securable.id,
                    grantee.catalog_id,
                    grantee.id,
                    privilege,
                )
                .ok_or(MetastoreError::GrantNotFound)?;
            revoke_grant_record(ctx, tx, securable, grantee, &record)?;
            Ok(record)
        })
    }

    async fn load_grants_on_securable(
        &self,
        ctx: &CallContext,
        securable_catalog_id: i64,
        securable_id: i64,
    ) -> OpResult<LoadedGrants> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            load_grants_in_tx(tx, securable_catalog_id, securable_id, true)
        })
    }

    async fn load_grants_to_grantee(
        &self,
        ctx: &CallContext,
        grantee_catalog_id: i64,
        grantee_id: i64,
    ) -> OpResult<LoadedGrants> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            load_grants_in_tx(tx, grantee_catalog_id, grantee_id, false)
        })
    }

    async fn read_entity_by_name(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
        name: &str,
    ) -> OpResult<Entity> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            let resolved = resolve(ctx, tx, catalog_path)?;
            tx.lookup_entity_by_name(
                resolved.catalog_id_or_null,
                resolved.parent_id,
                entity_type,
                name,
            )
            .filter(|entity| prepare::sub_type_matches(sub_type, entity))
            .ok_or(MetastoreError::EntityNotFound)
        })
    }

    async fn list_entities(
        &self,
        ctx: &CallContext,
        catalog_path: &[EntityCore],
        entity_type: EntityType,
        sub_type: EntitySubType,
    ) -> OpResult<Vec<EntityNameLookupRecord>> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            let resolved = resolve(ctx, tx, catalog_path)?;
            let entities = tx.list_entities(
                resolved.catalog_id_or_null,
                resolved.parent_id,
                entity_type,
                None,
                &|entity| prepare::sub_type_matches(sub_type, entity),
            );
            Ok(entities.iter().map(EntityNameLookupRecord::from).collect())
        })
    }

    async fn load_entity(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<Entity> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            tx.lookup_entity(catalog_id, id, entity_type)
                .ok_or(MetastoreError::EntityNotFound)
        })
    }

    async fn load_entities_change_tracking(
        &self,
        ctx: &CallContext,
        ids: &[EntityId],
    ) -> OpResult<Vec<Option<ChangeTrackingVersions>>> {
        self.persistence
            .run_in_read_transaction(ctx, |tx| Ok(tx.lookup_entity_versions(ids)))
    }

    async fn load_resolved_entity_by_id(
        &self,
        ctx: &CallContext,
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
    ) -> OpResult<ResolvedEntityState> {
        self.persistence.run_in_read_transaction(ctx, |tx| {
            let entity = tx
                .lookup_entity(catalog_id, id, entity_type)
                .ok_or(MetastoreError::EntityNotFound)?;
            let grant_records = resolved_grant_records(tx, &entity);
            Ok(ResolvedEntityState {
                grant_records_version: entity.grant_records_version,
                grant_records: Some(grant_records),
                entity: Some(entity),
            })
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
        let first_attempt = self.persistence.run_in_read_transaction(ctx, |tx| {
            load_resolved_by_name_in_tx(tx, catalog_id, parent_id, entity_type, name)
        });

        // A missing root container is backfilled once per realm per
        // process; stores bootstrapped before the root container existed
        // heal themselves on first access.
        let missing_root = matches!(first_attempt, Err(MetastoreError::EntityNotFound))
            && entity_type == EntityType::Root
            && name == ROOT_CONTAINER_NAME;
        if !missing_root || Self::marker_contains(&self.backfilled, ctx.realm()) {
            return first_attempt;
        }

        self.persistence.run_in_transaction(ctx, |tx| {
            let root = match tx.lookup_entity(NULL_ID, ROOT_ENTITY_ID, EntityType::Root) {
                Some(existing) => existing,
                None => {
                    let mut root = entity::root_container();
                    persist_new_entity(ctx, tx, &mut root)?;
                    root
                }
            };
            // Ensure the grant even when the container already existed, so
            // a crash between the two backfill steps cannot wedge the
            // realm.
            if let Some(service_admin) = tx.lookup_entity_by_name(
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::PrincipalRole,
                SERVICE_ADMIN_ROLE_NAME,
            ) {
                ensure_grant(
                    ctx,
                    tx,
                    &EntityCore::from(&root),
                    &EntityCore::from(&service_admin),
                    Privilege::ServiceManageAccess,
                )?;
            }
            Ok::<(), MetastoreError>(())
        })?;
        Self::marker_insert(&self.backfilled, ctx.realm());

        self.persistence.run_in_read_transaction(ctx, |tx| {
            load_resolved_by_name_in_tx(tx, catalog_id, parent_id, entity_type, name)
        })
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
        self.persistence.run_in_read_transaction(ctx, |tx| {
            let versions = tx
                .lookup_entity_versions(&[EntityId::new(catalog_id, id)])
                .into_iter()
                .next()
                .flatten()
                .ok_or(MetastoreError::EntityNotFound)?;

            let entity = if versions.entity_version == entity_version {
                None
            } else {
                Some(
                    tx.lookup_entity(catalog_id, id, entity_type)
                        .ok_or(MetastoreError::EntityNotFound)?,
                )
            };

            let grant_records = if versions.grant_records_version == grant_records_version {
                None
            } else {
                let records = if entity_type.is_grantee() {
                    let mut records = tx.load_all_grant_records_on_grantee(catalog_id, id);
                    records.extend(tx.load_all_grant_records_on_securable(catalog_id, id));
                    records
                } else {
                    tx.load_all_grant_records_on_securable(catalog_id, id)
                };
                Some(records)
            };

            Ok(ResolvedEntityState {
                entity,
                grant_records_version: versions.grant_records_version,
                grant_records,
            })
        })
    }

    async fn load_tasks(
        &self,
        ctx: &CallContext,
        executor_id: &str,
        limit: usize,
    ) -> OpResult<Vec<Entity>> {
        let leased = self.persistence.run_in_transaction(ctx, |tx| {
            let timeout =
                ctx.config().get_i64(TASK_TIMEOUT_MILLIS_CONFIG, DEFAULT_TASK_TIMEOUT_MILLIS);
            let now = ctx.clock().millis();

            let leasable = |task: &Entity| is_task_available(task, now, timeout);
            let available = tx.list_entities(
                ROOT_ENTITY_ID,
                ROOT_ENTITY_ID,
                EntityType::Task,
                Some(limit),
                &leasable,
            );

            let mut leased = Vec::with_capacity(available.len());
            for stored in available {
                if ctx.is_cancelled() {
                    break;
                }
                let mut updated = stored.clone();
                task::mark_attempt(&mut updated, executor_id, now);
                // All candidates were read in this same transaction, so a
                // failed lease write is a store bug; roll everything back.
                leased.push(persist_entity_after_change(ctx, tx, updated, false, &stored)?);
            }
            Ok::<Vec<Entity>, MetastoreError>(leased)
        })?;
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

        let (entity, integration) = self.persistence.run_in_read_transaction(ctx, |tx| {
            let entity = tx
                .lookup_entity(catalog_id, entity_id, entity_type)
                .ok_or(MetastoreError::EntityNotFound)?;
            let integration = ctx.diagnostics().check_not_none(
                tx.load_storage_integration(&entity),
                "storage_integration_not_exists",
            );
            Ok::<(Entity, Arc<dyn StorageIntegration>), MetastoreError>((entity, integration))
        })?;

        let config = ctx.diagnostics().check_not_none(
            StorageConfigInfo::from_entity(&entity)?,
            "missing_storage_configuration",
        );
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

        let (entity, integration) = self.persistence.run_in_read_transaction(ctx, |tx| {
            let entity = tx
                .lookup_entity(catalog_id, entity_id, entity_type)
                .ok_or(MetastoreError::EntityNotFound)?;
            let integration = ctx.diagnostics().check_not_none(
                tx.load_storage_integration(&entity),
                "storage_integration_not_exists",
            );
            Ok::<(Entity, Arc<dyn StorageIntegration>), MetastoreError>((entity, integration))
        })?;

        let config = ctx.diagnostics().check_not_none(
            StorageConfigInfo::from_entity(&entity)?,
            "missing_storage_configuration",
        );
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

/// True when a task is leasable at `now` under the configured timeout.
fn is_task_available(task: &Entity, now: i64, timeout: i64) -> bool {
    let state = task::parse_task_state(task);
    task::is_leasable(&state, now, timeout)
}

/// Re-reads both grant endpoints, failing when either disappeared.
fn revalidate_grant_endpoints(
    tx: &dyn TransactionSlices,
    securable: &EntityCore,
    grantee: &EntityCore,
) -> OpResult<()> {
    if tx
        .lookup_entity(securable.catalog_id, securable.id, securable.entity_type)
        .is_none()
        || tx
            .lookup_entity(grantee.catalog_id, grantee.id, grantee.entity_type)
            .is_none()
    {
        return Err(MetastoreError::EntityCannotBeResolved);
    }
    Ok(())
}

/// Create-or-return-existing inside a transaction.
fn create_entity_in_tx(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    mut entity: Entity,
) -> OpResult<Entity> {
    ctx.diagnostics()
        .check(!entity.name.is_empty(), "unexpected_null_entity_name");

    if let Some(existing) = tx.lookup_entity(entity.catalog_id, entity.id, entity.entity_type) {
        return Ok(existing);
    }
    if let Some(record) = tx.lookup_entity_id_and_sub_type_by_name(
        entity.catalog_id,
        entity.parent_id,
        entity.entity_type,
        &entity.name,
    ) {
        return Err(MetastoreError::EntityAlreadyExists {
            sub_type: record.sub_type,
        });
    }
    persist_new_entity(ctx, tx, &mut entity)?;
    Ok(entity)
}

/// Compare-and-swap property update inside a transaction. Both
/// change-tracking counters participate in the precondition, so an update
/// authorised under a since-revoked grant set fails as concurrently
/// modified.
fn update_entity_in_tx(
    ctx: &CallContext,
    tx: &mut dyn TransactionSlices,
    entity: &Entity,
) -> OpResult<Entity> {
    let stored = tx
        .lookup_entity(entity.catalog_id, entity.id, entity.entity_type)
        .ok_or(MetastoreError::EntityNotFound)?;
    if stored.versions() != entity.versions() {
        return Err(MetastoreError::TargetEntityConcurrentlyModified(format!(
            "entity '{}' (id {}) expected versions {}/{} found {}/{}",
            entity.name,
            entity.id,
            entity.entity_version,
            entity.grant_records_version,
            stored.entity_version,
            stored.grant_records_version
        )));
    }
    persist_entity_after_change(ctx, tx, entity.clone(), false, &stored)
}
