//! Pure helpers shared by both manager strategies.
//!
//! Entity preparation and invariant checks live here so the transactional
//! and atomic strategies stay two thin orchestrations over one set of
//! rules.

use std::collections::{BTreeMap, BTreeSet};

use strata_core::{Diagnostics, Result};

use crate::entity::{
    Entity, EntityId, EntitySubType, EntityType, CLIENT_ID_PROPERTY, NULL_ID, ROOT_ENTITY_ID,
};
use crate::grant::{GrantRecord, Privilege};
use crate::task::{AsyncTaskType, TASK_DATA_PROPERTY, TASK_TYPE_PROPERTY};

/// Validates and fills the server-owned fields of an entity about to be
/// created: version counters at 1, creation time stamped if unset.
pub(crate) fn prepare_new_entity(diagnostics: &Diagnostics, entity: &mut Entity, now: i64) {
    diagnostics.check(!entity.name.is_empty(), "unexpected_null_name");
    diagnostics.check(entity.drop_timestamp == 0, "already_dropped");
    if entity.create_timestamp == 0 {
        entity.create_timestamp = now;
    }
    entity.last_update_timestamp = entity.create_timestamp;
    entity.entity_version = 1;
    entity.grant_records_version = 1;
}

/// Prepares a changed entity for persistence: bumps `entity_version` off
/// the original witness and stamps the update time. The caller passes the
/// original alongside the write so the backend can compare-and-swap.
pub(crate) fn prepare_changed_entity(
    diagnostics: &Diagnostics,
    entity: &mut Entity,
    original: &Entity,
    now: i64,
) {
    diagnostics.check(entity.id == original.id, "entity_id_mismatch");
    diagnostics.check(
        entity.catalog_id == original.catalog_id,
        "entity_catalog_id_mismatch",
    );
    entity.entity_version = original.entity_version + 1;
    entity.grant_records_version = original.grant_records_version;
    entity.last_update_timestamp = now;
}

/// Builds the cleanup TASK for a dropped entity: the entire serialized
/// entity goes under the `data` property, the caller's cleanup properties
/// become the task's internal properties.
///
/// # Errors
///
/// Returns a serialization error if the dropped entity cannot be encoded.
pub(crate) fn build_cleanup_task(
    dropped: &Entity,
    cleanup_properties: Option<&BTreeMap<String, String>>,
    task_id: i64,
) -> Result<Entity> {
    let mut task = Entity::new(
        NULL_ID,
        task_id,
        EntityType::Task,
        EntitySubType::Null,
        ROOT_ENTITY_ID,
        format!("entity_cleanup_{}", dropped.id),
    );
    task.properties.insert(
        TASK_TYPE_PROPERTY.to_string(),
        AsyncTaskType::EntityCleanupScheduler.code().to_string(),
    );
    task.properties
        .insert(TASK_DATA_PROPERTY.to_string(), serde_json::to_string(dropped)?);
    if let Some(cleanup_properties) = cleanup_properties {
        task.internal_properties = cleanup_properties.clone();
    }
    Ok(task)
}

/// Extracts a principal's client id from its internal properties.
pub(crate) fn client_id_of(diagnostics: &Diagnostics, principal: &Entity) -> String {
    let client_id =
        diagnostics.check_not_none(principal.internal_property(CLIENT_ID_PROPERTY), "null_client_id");
    diagnostics.check(!client_id.is_empty(), "empty_client_id");
    client_id.to_string()
}

/// The usage privilege for a role-to-grantee grant: catalog-role usage
/// when a principal role receives a catalog role, principal-role usage
/// when a principal receives a principal role.
pub(crate) fn usage_privilege_for(grantee_type: EntityType) -> Privilege {
    if grantee_type == EntityType::PrincipalRole {
        Privilege::CatalogRoleUsage
    } else {
        Privilege::PrincipalRoleUsage
    }
}

/// True when the entity passes a sub-type filter.
pub(crate) fn sub_type_matches(sub_type: EntitySubType, entity: &Entity) -> bool {
    sub_type == EntitySubType::Any || entity.sub_type == sub_type
}

/// The distinct counterparty ids of a set of grants being removed: the
/// securable of every grant held, the grantee of every grant given.
pub(crate) fn distinct_counterparties(
    on_grantee: &[GrantRecord],
    on_securable: &[GrantRecord],
) -> Vec<EntityId> {
    let mut ids = BTreeSet::new();
    for record in on_grantee {
        ids.insert(record.securable_entity_id());
    }
    for record in on_securable {
        ids.insert(record.grantee_entity_id());
    }
    ids.into_iter().collect()
}
