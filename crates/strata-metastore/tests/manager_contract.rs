//! Contract tests for the metastore manager, run against both strategies
//! over the in-memory backend.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{
    bootstrap, create_catalog, create_namespace, create_principal, create_table, create_task,
    harnesses, read_top_level, TEST_TASK_TIMEOUT_MILLIS,
};
use strata_metastore::entity::{
    Entity, EntityCore, EntitySubType, EntityType, CATALOG_ADMIN_ROLE_NAME,
    CREDENTIAL_ROTATION_REQUIRED_PROPERTY, NULL_ID, ROOT_CONTAINER_NAME, ROOT_ENTITY_ID,
    ROOT_PRINCIPAL_NAME, SERVICE_ADMIN_ROLE_NAME,
};
use strata_metastore::grant::Privilege;
use strata_metastore::manager::{MetastoreError, MetastoreManager};
use strata_metastore::task::{
    parse_task_state, TASK_DATA_PROPERTY, TASK_TYPE_PROPERTY,
};

/// Bootstrap from an empty store creates the full closure; re-running is a
/// no-op, even from a fresh process over the same store.
#[tokio::test]
async fn bootstrap_creates_closure_and_is_idempotent() {
    for h in harnesses() {
        bootstrap(&h).await;

        let root = h
            .manager
            .load_entity(&h.ctx, NULL_ID, ROOT_ENTITY_ID, EntityType::Root)
            .await
            .expect("root container");
        assert_eq!(root.name, ROOT_CONTAINER_NAME);

        let root_principal = read_top_level(&h, EntityType::Principal, ROOT_PRINCIPAL_NAME).await;
        let service_admin =
            read_top_level(&h, EntityType::PrincipalRole, SERVICE_ADMIN_ROLE_NAME).await;

        let principal_grants = h
            .manager
            .load_grants_to_grantee(&h.ctx, NULL_ID, root_principal.id)
            .await
            .expect("root principal grants");
        assert!(
            principal_grants.grants.iter().any(|g| {
                g.securable_id == service_admin.id && g.privilege == Privilege::PrincipalRoleUsage
            }),
            "root principal must hold usage on service_admin ({:?})",
            h.strategy
        );

        let root_grants = h
            .manager
            .load_grants_on_securable(&h.ctx, NULL_ID, ROOT_ENTITY_ID)
            .await
            .expect("root grants");
        assert_eq!(root_grants.grants.len(), 1);
        assert_eq!(root_grants.grants[0].grantee_id, service_admin.id);
        assert_eq!(root_grants.grants[0].privilege, Privilege::ServiceManageAccess);

        // Cold start: a second manager over the same store must not
        // duplicate anything.
        let second = common::manager_over(h.strategy, h.store.clone());
        second.bootstrap_service(&h.ctx).await.expect("re-bootstrap");

        let principals = h
            .manager
            .list_entities(&h.ctx, &[], EntityType::Principal, EntitySubType::Any)
            .await
            .expect("principals");
        assert_eq!(principals.len(), 1, "{:?}", h.strategy);

        let roles = h
            .manager
            .list_entities(&h.ctx, &[], EntityType::PrincipalRole, EntitySubType::Any)
            .await
            .expect("roles");
        assert_eq!(roles.len(), 1, "{:?}", h.strategy);

        let root_grants_again = h
            .manager
            .load_grants_on_securable(&h.ctx, NULL_ID, ROOT_ENTITY_ID)
            .await
            .expect("root grants again");
        assert_eq!(root_grants_again.grants.len(), 1, "{:?}", h.strategy);
    }
}

/// Creating a catalog wires the admin role and its grants; the
/// service-admin role picks up usage when no principal roles are named.
#[tokio::test]
async fn create_catalog_wires_admin_role_grants() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        assert_eq!(created.admin_role.name, CATALOG_ADMIN_ROLE_NAME);
        assert_eq!(created.admin_role.catalog_id, created.catalog.id);

        let on_catalog = h
            .manager
            .load_grants_on_securable(&h.ctx, NULL_ID, created.catalog.id)
            .await
            .expect("catalog grants");
        let mut privileges: Vec<Privilege> =
            on_catalog.grants.iter().map(|g| g.privilege).collect();
        privileges.sort();
        assert_eq!(
            privileges,
            vec![Privilege::CatalogManageAccess, Privilege::CatalogManageMetadata],
            "{:?}",
            h.strategy
        );
        assert!(on_catalog
            .grants
            .iter()
            .all(|g| g.grantee_id == created.admin_role.id));

        let service_admin =
            read_top_level(&h, EntityType::PrincipalRole, SERVICE_ADMIN_ROLE_NAME).await;
        let to_service_admin = h
            .manager
            .load_grants_to_grantee(&h.ctx, NULL_ID, service_admin.id)
            .await
            .expect("service admin grants");
        assert!(
            to_service_admin.grants.iter().any(|g| {
                g.securable_id == created.admin_role.id
                    && g.privilege == Privilege::CatalogRoleUsage
            }),
            "{:?}",
            h.strategy
        );
    }
}

/// Retrying a catalog creation with the same id returns the existing pair;
/// a different id with the same name collides.
#[tokio::test]
async fn create_catalog_is_idempotent_by_id() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;

        let retry_input = Entity::new(
            NULL_ID,
            created.catalog.id,
            EntityType::Catalog,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            "prod",
        );
        let retried = h
            .manager
            .create_catalog(&h.ctx, retry_input, &[])
            .await
            .expect("retry");
        assert_eq!(retried.catalog.id, created.catalog.id);
        assert_eq!(retried.admin_role.id, created.admin_role.id);

        let conflicting_id = h.manager.generate_new_entity_id(&h.ctx).await.unwrap();
        let conflicting = Entity::new(
            NULL_ID,
            conflicting_id,
            EntityType::Catalog,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            "prod",
        );
        let error = h
            .manager
            .create_catalog(&h.ctx, conflicting, &[])
            .await
            .expect_err("name collision");
        assert!(
            matches!(error, MetastoreError::EntityAlreadyExists { .. }),
            "{:?}: {error:?}",
            h.strategy
        );
    }
}

/// A namespace with children refuses to drop; empty containers drop.
#[tokio::test]
async fn namespace_drop_respects_children() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let namespace = create_namespace(&h, &created.catalog, None, "n1").await;
        let table = create_table(&h, &created.catalog, &namespace, "t").await;

        let catalog_path = vec![EntityCore::from(&created.catalog)];
        let error = h
            .manager
            .drop_entity_if_exists(
                &h.ctx,
                &catalog_path,
                &EntityCore::from(&namespace),
                None,
                false,
            )
            .await
            .expect_err("namespace still has a table");
        assert_eq!(error, MetastoreError::NamespaceNotEmpty, "{:?}", h.strategy);

        let table_path = vec![
            EntityCore::from(&created.catalog),
            EntityCore::from(&namespace),
        ];
        h.manager
            .drop_entity_if_exists(&h.ctx, &table_path, &EntityCore::from(&table), None, false)
            .await
            .expect("drop table");
        h.manager
            .drop_entity_if_exists(
                &h.ctx,
                &catalog_path,
                &EntityCore::from(&namespace),
                None,
                false,
            )
            .await
            .expect("drop namespace");

        let lookup = h
            .manager
            .load_entity(&h.ctx, created.catalog.id, namespace.id, EntityType::Namespace)
            .await;
        assert_eq!(lookup.unwrap_err(), MetastoreError::EntityNotFound);
    }
}

/// A catalog with an extra role refuses to drop; with only the admin role
/// left, the drop also removes that role.
#[tokio::test]
async fn catalog_drop_takes_last_admin_role_along() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let analyst_id = h.manager.generate_new_entity_id(&h.ctx).await.unwrap();
        let analyst = Entity::new(
            created.catalog.id,
            analyst_id,
            EntityType::CatalogRole,
            EntitySubType::Null,
            created.catalog.id,
            "analyst",
        );
        let analyst = h
            .manager
            .create_entity_if_not_exists(&h.ctx, &catalog_path, analyst)
            .await
            .expect("create analyst role");

        let error = h
            .manager
            .drop_entity_if_exists(&h.ctx, &[], &EntityCore::from(&created.catalog), None, false)
            .await
            .expect_err("two catalog roles remain");
        assert_eq!(error, MetastoreError::CatalogNotEmpty, "{:?}", h.strategy);

        h.manager
            .drop_entity_if_exists(&h.ctx, &catalog_path, &EntityCore::from(&analyst), None, false)
            .await
            .expect("drop analyst role");
        h.manager
            .drop_entity_if_exists(&h.ctx, &[], &EntityCore::from(&created.catalog), None, false)
            .await
            .expect("drop catalog");

        let admin_lookup = h
            .manager
            .load_entity(
                &h.ctx,
                created.catalog.id,
                created.admin_role.id,
                EntityType::CatalogRole,
            )
            .await;
        assert_eq!(admin_lookup.unwrap_err(), MetastoreError::EntityNotFound);
    }
}

/// Bootstrap entities refuse to be dropped or renamed.
#[tokio::test]
async fn bootstrap_entities_are_protected() {
    for h in harnesses() {
        bootstrap(&h).await;
        let root_principal = read_top_level(&h, EntityType::Principal, ROOT_PRINCIPAL_NAME).await;

        let drop_error = h
            .manager
            .drop_entity_if_exists(&h.ctx, &[], &EntityCore::from(&root_principal), None, false)
            .await
            .expect_err("root principal is undroppable");
        assert_eq!(drop_error, MetastoreError::EntityUndroppable, "{:?}", h.strategy);

        let mut renamed = root_principal.clone();
        renamed.name = "administrator".to_string();
        let rename_error = h
            .manager
            .rename_entity(&h.ctx, &[], &EntityCore::from(&root_principal), None, renamed)
            .await
            .expect_err("root principal cannot be renamed");
        assert_eq!(rename_error, MetastoreError::EntityCannotBeRenamed, "{:?}", h.strategy);
    }
}

/// Rename succeeds once; a stale-version retry reports the concurrent
/// modification; a destination collision is rejected.
#[tokio::test]
async fn rename_checks_version_and_destination() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let a = create_namespace(&h, &created.catalog, None, "a").await;
        let taken = create_namespace(&h, &created.catalog, None, "taken").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let mut to_b = a.clone();
        to_b.name = "b".to_string();
        let renamed = h
            .manager
            .rename_entity(&h.ctx, &catalog_path, &EntityCore::from(&a), None, to_b)
            .await
            .expect("rename a -> b");
        assert_eq!(renamed.name, "b");
        assert_eq!(renamed.entity_version, a.entity_version + 1);

        // Second client still holds the pre-rename version.
        let mut to_c = a.clone();
        to_c.name = "c".to_string();
        let stale = h
            .manager
            .rename_entity(&h.ctx, &catalog_path, &EntityCore::from(&a), None, to_c)
            .await
            .expect_err("stale rename");
        assert!(
            matches!(stale, MetastoreError::TargetEntityConcurrentlyModified(_)),
            "{:?}: {stale:?}",
            h.strategy
        );

        let mut onto_taken = renamed.clone();
        onto_taken.name = taken.name.clone();
        let collision = h
            .manager
            .rename_entity(
                &h.ctx,
                &catalog_path,
                &EntityCore::from(&renamed),
                None,
                onto_taken,
            )
            .await
            .expect_err("destination taken");
        assert!(
            matches!(collision, MetastoreError::EntityAlreadyExists { .. }),
            "{:?}: {collision:?}",
            h.strategy
        );
    }
}

/// Property updates are CAS-guarded by both change-tracking counters.
#[tokio::test]
async fn update_properties_is_version_guarded() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let namespace = create_namespace(&h, &created.catalog, None, "n1").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let mut update = namespace.clone();
        update
            .properties
            .insert("owner".to_string(), "data-eng".to_string());
        let updated = h
            .manager
            .update_entity_properties_if_not_changed(&h.ctx, &catalog_path, &update)
            .await
            .expect("first update");
        assert_eq!(updated.entity_version, namespace.entity_version + 1);

        // Replaying the same update against the stale witness must fail.
        let stale = h
            .manager
            .update_entity_properties_if_not_changed(&h.ctx, &catalog_path, &update)
            .await
            .expect_err("stale update");
        assert!(
            matches!(stale, MetastoreError::TargetEntityConcurrentlyModified(_)),
            "{:?}: {stale:?}",
            h.strategy
        );
    }
}

/// Secrets rotation: reset flags the principal, the next plain rotation
/// clears the flag; each rotation keeps exactly the promised secrets
/// valid.
#[tokio::test]
async fn rotation_marker_set_and_cleared() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_principal(&h, "etl-service").await;
        let client_id = created.secrets.client_id.clone();
        let first_hash = created.secrets.main_secret_hash.clone();

        let rotated = h
            .manager
            .rotate_principal_secrets(&h.ctx, &client_id, created.principal.id, true, &first_hash)
            .await
            .expect("reset rotation");
        assert!(rotated.main_secret.is_some());

        let flagged = h
            .manager
            .load_entity(&h.ctx, NULL_ID, created.principal.id, EntityType::Principal)
            .await
            .expect("principal");
        assert_eq!(
            flagged.internal_property(CREDENTIAL_ROTATION_REQUIRED_PROPERTY),
            Some("true"),
            "{:?}",
            h.strategy
        );

        let second = h
            .manager
            .rotate_principal_secrets(
                &h.ctx,
                &client_id,
                created.principal.id,
                false,
                &rotated.main_secret_hash,
            )
            .await
            .expect("clearing rotation");
        assert!(second.main_secret.is_some());

        let cleared = h
            .manager
            .load_entity(&h.ctx, NULL_ID, created.principal.id, EntityType::Principal)
            .await
            .expect("principal");
        assert_eq!(
            cleared.internal_property(CREDENTIAL_ROTATION_REQUIRED_PROPERTY),
            None,
            "{:?}",
            h.strategy
        );

        let stored = h
            .manager
            .load_principal_secrets(&h.ctx, &client_id)
            .await
            .expect("stored secrets");
        assert_eq!(stored.main_secret_hash, second.main_secret_hash);
        assert!(stored.main_secret.is_none(), "stored secrets carry no plaintext");
    }
}

/// Dropping a principal with cleanup removes its secrets and schedules a
/// cleanup task carrying the serialized principal.
#[tokio::test]
async fn drop_principal_with_cleanup_schedules_task() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_principal(&h, "etl-service").await;
        let client_id = created.secrets.client_id.clone();

        let mut cleanup_properties = BTreeMap::new();
        cleanup_properties.insert("purge_files".to_string(), "true".to_string());
        let outcome = h
            .manager
            .drop_entity_if_exists(
                &h.ctx,
                &[],
                &EntityCore::from(&created.principal),
                Some(cleanup_properties.clone()),
                true,
            )
            .await
            .expect("drop principal");
        let task_id = outcome.cleanup_task_id.expect("cleanup task id");

        let secrets = h.manager.load_principal_secrets(&h.ctx, &client_id).await;
        assert_eq!(secrets.unwrap_err(), MetastoreError::EntityNotFound, "{:?}", h.strategy);

        let task = h
            .manager
            .load_entity(&h.ctx, NULL_ID, task_id, EntityType::Task)
            .await
            .expect("cleanup task");
        assert_eq!(
            task.properties.get(TASK_TYPE_PROPERTY).map(String::as_str),
            Some("1")
        );
        assert_eq!(task.internal_properties, cleanup_properties);

        let embedded: Entity =
            serde_json::from_str(task.properties.get(TASK_DATA_PROPERTY).expect("data")).unwrap();
        assert_eq!(embedded.id, created.principal.id);
        assert_eq!(embedded.name, "etl-service");
    }
}

/// Granting and revoking bumps both endpoints' grant versions; revoking
/// an absent grant is a no-op failure.
#[tokio::test]
async fn grant_and_revoke_bump_both_endpoints() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let namespace = create_namespace(&h, &created.catalog, None, "n1").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let before_securable = h
            .manager
            .load_grants_on_securable(&h.ctx, namespace.catalog_id, namespace.id)
            .await
            .expect("namespace grants")
            .grants_version;
        let before_grantee = h
            .manager
            .load_grants_to_grantee(&h.ctx, created.admin_role.catalog_id, created.admin_role.id)
            .await
            .expect("role grants")
            .grants_version;

        h.manager
            .grant_privilege_on_securable_to_role(
                &h.ctx,
                &EntityCore::from(&created.admin_role),
                &catalog_path,
                &EntityCore::from(&namespace),
                Privilege::NamespaceCreate,
            )
            .await
            .expect("grant");

        let after_securable = h
            .manager
            .load_grants_on_securable(&h.ctx, namespace.catalog_id, namespace.id)
            .await
            .expect("namespace grants")
            .grants_version;
        let after_grantee = h
            .manager
            .load_grants_to_grantee(&h.ctx, created.admin_role.catalog_id, created.admin_role.id)
            .await
            .expect("role grants")
            .grants_version;
        assert_eq!(after_securable, before_securable + 1, "{:?}", h.strategy);
        assert_eq!(after_grantee, before_grantee + 1, "{:?}", h.strategy);

        h.manager
            .revoke_privilege_on_securable_from_role(
                &h.ctx,
                &EntityCore::from(&created.admin_role),
                &catalog_path,
                &EntityCore::from(&namespace),
                Privilege::NamespaceCreate,
            )
            .await
            .expect("revoke");

        let error = h
            .manager
            .revoke_privilege_on_securable_from_role(
                &h.ctx,
                &EntityCore::from(&created.admin_role),
                &catalog_path,
                &EntityCore::from(&namespace),
                Privilege::NamespaceCreate,
            )
            .await
            .expect_err("second revoke");
        assert_eq!(error, MetastoreError::GrantNotFound, "{:?}", h.strategy);
    }
}

/// By-id and by-name resolution return the same triple; refresh returns
/// only what changed.
#[tokio::test]
async fn resolved_entity_and_refresh_agree() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;

        let by_id = h
            .manager
            .load_resolved_entity_by_id(&h.ctx, NULL_ID, created.catalog.id, EntityType::Catalog)
            .await
            .expect("by id");
        let by_name = h
            .manager
            .load_resolved_entity_by_name(
                &h.ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Catalog,
                "prod",
            )
            .await
            .expect("by name");
        assert_eq!(by_id, by_name, "{:?}", h.strategy);

        let entity = by_id.entity.expect("entity");
        let unchanged = h
            .manager
            .refresh_resolved_entity(
                &h.ctx,
                entity.entity_version,
                entity.grant_records_version,
                EntityType::Catalog,
                NULL_ID,
                entity.id,
            )
            .await
            .expect("refresh");
        assert!(unchanged.entity.is_none());
        assert!(unchanged.grant_records.is_none());
        assert_eq!(unchanged.grant_records_version, entity.grant_records_version);

        let stale = h
            .manager
            .refresh_resolved_entity(
                &h.ctx,
                entity.entity_version - 1,
                entity.grant_records_version,
                EntityType::Catalog,
                NULL_ID,
                entity.id,
            )
            .await
            .expect("refresh stale entity version");
        assert!(stale.entity.is_some());
        assert!(stale.grant_records.is_none());
    }
}

/// Task leasing: a lease excludes the task until the timeout elapses, and
/// attempts accumulate across lease generations.
#[tokio::test]
async fn task_leasing_round_trips_the_timeout() {
    for h in harnesses() {
        bootstrap(&h).await;
        create_task(&h, "cleanup-1").await;
        create_task(&h, "cleanup-2").await;

        let first = h
            .manager
            .load_tasks(&h.ctx, "E1", 10)
            .await
            .expect("first lease");
        assert_eq!(first.len(), 2, "{:?}", h.strategy);
        for task in &first {
            let state = parse_task_state(task);
            assert_eq!(state.executor_id.as_deref(), Some("E1"));
            assert_eq!(state.attempt_count, 1);
        }

        let second = h
            .manager
            .load_tasks(&h.ctx, "E1", 10)
            .await
            .expect("second lease");
        assert!(second.is_empty(), "{:?}", h.strategy);

        h.clock.advance(Duration::from_millis(
            u64::try_from(TEST_TASK_TIMEOUT_MILLIS).unwrap() + 1_000,
        ));

        let third = h
            .manager
            .load_tasks(&h.ctx, "E2", 10)
            .await
            .expect("third lease");
        assert_eq!(third.len(), 2, "{:?}", h.strategy);
        for task in &third {
            let state = parse_task_state(task);
            assert_eq!(state.executor_id.as_deref(), Some("E2"));
            assert_eq!(state.attempt_count, 2);
        }
    }
}

/// The root container backfills on by-name access for stores bootstrapped
/// without one.
#[tokio::test]
async fn missing_root_container_backfills_on_lookup() {
    for h in harnesses() {
        // No bootstrap: the store is empty.
        let resolved = h
            .manager
            .load_resolved_entity_by_name(
                &h.ctx,
                NULL_ID,
                ROOT_ENTITY_ID,
                EntityType::Root,
                ROOT_CONTAINER_NAME,
            )
            .await
            .expect("backfilled root");
        let root = resolved.entity.expect("root entity");
        assert_eq!(root.id, ROOT_ENTITY_ID);
        assert_eq!(root.name, ROOT_CONTAINER_NAME, "{:?}", h.strategy);
    }
}

/// Idempotent create: a same-id retry succeeds, a same-name different-id
/// create collides.
#[tokio::test]
async fn create_entity_retry_semantics() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let namespace = create_namespace(&h, &created.catalog, None, "n1").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let retry = Entity::new(
            created.catalog.id,
            namespace.id,
            EntityType::Namespace,
            EntitySubType::Null,
            created.catalog.id,
            "n1",
        );
        let retried = h
            .manager
            .create_entity_if_not_exists(&h.ctx, &catalog_path, retry)
            .await
            .expect("same-id retry");
        assert_eq!(retried.id, namespace.id, "{:?}", h.strategy);

        let other_id = h.manager.generate_new_entity_id(&h.ctx).await.unwrap();
        let collision = Entity::new(
            created.catalog.id,
            other_id,
            EntityType::Namespace,
            EntitySubType::Null,
            created.catalog.id,
            "n1",
        );
        let error = h
            .manager
            .create_entity_if_not_exists(&h.ctx, &catalog_path, collision)
            .await
            .expect_err("name collision");
        assert!(
            matches!(error, MetastoreError::EntityAlreadyExists { .. }),
            "{:?}: {error:?}",
            h.strategy
        );
    }
}

/// Purge really removes everything.
#[tokio::test]
async fn purge_empties_the_realm() {
    for h in harnesses() {
        bootstrap(&h).await;
        create_catalog(&h, "prod").await;

        h.manager.purge(&h.ctx).await.expect("purge");

        let root = h
            .manager
            .load_entity(&h.ctx, NULL_ID, ROOT_ENTITY_ID, EntityType::Root)
            .await;
        assert_eq!(root.unwrap_err(), MetastoreError::EntityNotFound, "{:?}", h.strategy);

        let catalogs = h
            .manager
            .list_entities(&h.ctx, &[], EntityType::Catalog, EntitySubType::Any)
            .await
            .expect("catalogs");
        assert!(catalogs.is_empty());
    }
}

/// Sub-scoped credentials come back for allowed locations and fail for
/// locations outside the catalog's storage configuration.
#[tokio::test]
async fn subscoped_creds_respect_storage_config() {
    use std::collections::BTreeSet;
    use strata_metastore::entity::STORAGE_CONFIGURATION_INFO_PROPERTY;
    use strata_metastore::storage::{StorageConfigInfo, StorageType};

    for h in harnesses() {
        bootstrap(&h).await;

        let id = h.manager.generate_new_entity_id(&h.ctx).await.unwrap();
        let mut catalog = Entity::new(
            NULL_ID,
            id,
            EntityType::Catalog,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            "lake",
        );
        let config = StorageConfigInfo::new(
            StorageType::S3,
            vec!["s3://bucket/warehouse/".to_string()],
        );
        catalog.internal_properties.insert(
            STORAGE_CONFIGURATION_INFO_PROPERTY.to_string(),
            config.serialize().unwrap(),
        );
        let created = h
            .manager
            .create_catalog(&h.ctx, catalog, &[])
            .await
            .expect("create catalog with storage");

        let reads: BTreeSet<String> = ["s3://bucket/warehouse/db/".to_string()].into();
        let writes = BTreeSet::new();
        let creds = h
            .manager
            .get_subscoped_creds_for_entity(
                &h.ctx,
                NULL_ID,
                created.catalog.id,
                EntityType::Catalog,
                false,
                &reads,
                &writes,
            )
            .await
            .expect("creds");
        assert!(!creds.properties.is_empty(), "{:?}", h.strategy);

        let outside: BTreeSet<String> = ["s3://elsewhere/".to_string()].into();
        let error = h
            .manager
            .get_subscoped_creds_for_entity(
                &h.ctx,
                NULL_ID,
                created.catalog.id,
                EntityType::Catalog,
                false,
                &outside,
                &writes,
            )
            .await
            .expect_err("outside allowed locations");
        assert!(
            matches!(error, MetastoreError::SubscopeCredsError(_)),
            "{:?}: {error:?}",
            h.strategy
        );
    }
}
