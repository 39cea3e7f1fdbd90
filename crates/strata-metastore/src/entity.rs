//! The entity model of the metadata store.
//!
//! Every persisted object — catalogs, namespaces, tables and views,
//! principals, roles, tasks and the root container itself — shares one
//! common shape ([`Entity`]). Identity is the `(catalog_id, id)` pair;
//! the unique *active-name key* `(catalog_id, parent_id, type, name)`
//! enforces that at most one live entity holds a given name inside a
//! parent. Change tracking is the `(entity_version, grant_records_version)`
//! counter pair used for optimistic concurrency.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The null id sentinel: used as `catalog_id` for top-level entities.
pub const NULL_ID: i64 = 0;

/// The fixed id of the realm's root container entity.
pub const ROOT_ENTITY_ID: i64 = 0;

/// Name of the root container entity.
pub const ROOT_CONTAINER_NAME: &str = "root_container";

/// Name of the realm's root principal, created at bootstrap.
pub const ROOT_PRINCIPAL_NAME: &str = "root";

/// Name of the global service-admin principal role, created at bootstrap.
pub const SERVICE_ADMIN_ROLE_NAME: &str = "service_admin";

/// Name of the per-catalog admin role, created with each catalog.
pub const CATALOG_ADMIN_ROLE_NAME: &str = "catalog_admin";

/// Internal property holding a principal's OAuth client id.
pub const CLIENT_ID_PROPERTY: &str = "client_id";

/// Internal property holding a catalog's storage configuration JSON.
pub const STORAGE_CONFIGURATION_INFO_PROPERTY: &str = "storage-configuration-info";

/// Internal property holding the identifier of a persisted storage
/// integration.
pub const STORAGE_INTEGRATION_IDENTIFIER_PROPERTY: &str = "storage-integration-identifier";

/// Internal property flagging that a principal's credentials must be
/// rotated before use. Set by a `reset` rotation, cleared by the first
/// subsequent successful rotation without `reset`.
pub const CREDENTIAL_ROTATION_REQUIRED_PROPERTY: &str =
    "PRINCIPAL_CREDENTIAL_ROTATION_REQUIRED_STATE";

/// The type of a persisted entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// The per-realm root container; securable for top-level grants.
    Root,
    /// An authenticated service identity.
    Principal,
    /// A global role grantable to principals.
    PrincipalRole,
    /// A catalog of namespaces and tables.
    Catalog,
    /// A role scoped to a single catalog.
    CatalogRole,
    /// A namespace inside a catalog or another namespace.
    Namespace,
    /// A table or view.
    TableLike,
    /// A deferred unit of cleanup work, leased by executors.
    Task,
}

impl EntityType {
    /// Stable numeric code used in persisted keys.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Root => 1,
            Self::Principal => 2,
            Self::PrincipalRole => 3,
            Self::Catalog => 4,
            Self::CatalogRole => 5,
            Self::Namespace => 6,
            Self::TableLike => 7,
            Self::Task => 8,
        }
    }

    /// Resolves a numeric code back to a type.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Root),
            2 => Some(Self::Principal),
            3 => Some(Self::PrincipalRole),
            4 => Some(Self::Catalog),
            5 => Some(Self::CatalogRole),
            6 => Some(Self::Namespace),
            7 => Some(Self::TableLike),
            8 => Some(Self::Task),
            _ => None,
        }
    }

    /// True for the entity types that can receive privileges.
    #[must_use]
    pub const fn is_grantee(self) -> bool {
        matches!(self, Self::Principal | Self::PrincipalRole | Self::CatalogRole)
    }

    /// True for entities whose parent is the root container.
    #[must_use]
    pub const fn is_top_level(self) -> bool {
        matches!(
            self,
            Self::Principal | Self::PrincipalRole | Self::Catalog | Self::Task
        )
    }
}

/// The sub-type of an entity; only meaningful for [`EntityType::TableLike`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySubType {
    /// Matches any sub-type in by-name reads and listings.
    Any,
    /// No sub-type.
    #[default]
    Null,
    /// An Iceberg table.
    Table,
    /// An Iceberg view.
    View,
}

impl EntitySubType {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Any => -1,
            Self::Null => 0,
            Self::Table => 2,
            Self::View => 3,
        }
    }
}

/// The `(catalog_id, id)` identity pair of an entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId {
    /// Id of the owning catalog, or [`NULL_ID`] for top-level entities.
    pub catalog_id: i64,
    /// Realm-unique entity id.
    pub id: i64,
}

impl EntityId {
    /// Creates an identity pair.
    #[must_use]
    pub const fn new(catalog_id: i64, id: i64) -> Self {
        Self { catalog_id, id }
    }
}

/// The unique active-name key `(catalog_id, parent_id, type, name)`.
///
/// At most one active entity exists for any instance of this key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActiveNameKey {
    /// Id of the owning catalog, or [`NULL_ID`].
    pub catalog_id: i64,
    /// Id of the parent entity.
    pub parent_id: i64,
    /// Numeric type code.
    pub type_code: i32,
    /// Entity name, unique under the parent for this type.
    pub name: String,
}

impl ActiveNameKey {
    /// Creates an active-name key.
    #[must_use]
    pub fn new(catalog_id: i64, parent_id: i64, entity_type: EntityType, name: &str) -> Self {
        Self {
            catalog_id,
            parent_id,
            type_code: entity_type.code(),
            name: name.to_string(),
        }
    }
}

/// The change-tracking counter pair of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTrackingVersions {
    /// Incremented on every modification of the entity itself.
    pub entity_version: u32,
    /// Incremented on every change to the entity's grant set.
    pub grant_records_version: u32,
}

/// A slim record returned by active-name listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNameLookupRecord {
    /// Id of the owning catalog, or [`NULL_ID`].
    pub catalog_id: i64,
    /// Realm-unique entity id.
    pub id: i64,
    /// Id of the parent entity.
    pub parent_id: i64,
    /// Entity name.
    pub name: String,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity sub-type.
    pub sub_type: EntitySubType,
}

impl From<&Entity> for EntityNameLookupRecord {
    fn from(entity: &Entity) -> Self {
        Self {
            catalog_id: entity.catalog_id,
            id: entity.id,
            parent_id: entity.parent_id,
            name: entity.name.clone(),
            entity_type: entity.entity_type,
            sub_type: entity.sub_type,
        }
    }
}

/// The slim identity view of an entity, used for catalog paths and grant
/// endpoints where the full record is not needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCore {
    /// Id of the owning catalog, or [`NULL_ID`].
    pub catalog_id: i64,
    /// Realm-unique entity id.
    pub id: i64,
    /// Id of the parent entity.
    pub parent_id: i64,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity name.
    pub name: String,
    /// The entity version known to the caller; `0` skips revalidation.
    pub entity_version: u32,
}

impl From<&Entity> for EntityCore {
    fn from(entity: &Entity) -> Self {
        Self {
            catalog_id: entity.catalog_id,
            id: entity.id,
            parent_id: entity.parent_id,
            entity_type: entity.entity_type,
            name: entity.name.clone(),
            entity_version: entity.entity_version,
        }
    }
}

/// A persisted metadata entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Id of the owning catalog, or [`NULL_ID`] for top-level entities.
    pub catalog_id: i64,
    /// Realm-unique entity id.
    pub id: i64,
    /// Id of the parent entity; the root container is its own parent.
    pub parent_id: i64,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity sub-type.
    pub sub_type: EntitySubType,
    /// Entity name, unique under `(catalog_id, parent_id, entity_type)`.
    pub name: String,
    /// Strictly increasing version of the entity record.
    pub entity_version: u32,
    /// Strictly increasing version of the entity's grant set.
    pub grant_records_version: u32,
    /// Creation time, epoch millis; `0` until persisted.
    pub create_timestamp: i64,
    /// Last modification time, epoch millis.
    pub last_update_timestamp: i64,
    /// Drop time, epoch millis; `0` while active.
    pub drop_timestamp: i64,
    /// User-visible properties.
    pub properties: BTreeMap<String, String>,
    /// Properties owned by the service, never shown to users.
    pub internal_properties: BTreeMap<String, String>,
}

impl Entity {
    /// Creates a fresh entity with version counters at 1 and zeroed
    /// timestamps; the manager fills timestamps when persisting.
    #[must_use]
    pub fn new(
        catalog_id: i64,
        id: i64,
        entity_type: EntityType,
        sub_type: EntitySubType,
        parent_id: i64,
        name: impl Into<String>,
    ) -> Self {
        Self {
            catalog_id,
            id,
            parent_id,
            entity_type,
            sub_type,
            name: name.into(),
            entity_version: 1,
            grant_records_version: 1,
            create_timestamp: 0,
            last_update_timestamp: 0,
            drop_timestamp: 0,
            properties: BTreeMap::new(),
            internal_properties: BTreeMap::new(),
        }
    }

    /// The `(catalog_id, id)` identity pair.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        EntityId::new(self.catalog_id, self.id)
    }

    /// The active-name key of this entity.
    #[must_use]
    pub fn active_name_key(&self) -> ActiveNameKey {
        ActiveNameKey::new(self.catalog_id, self.parent_id, self.entity_type, &self.name)
    }

    /// The current change-tracking counter pair.
    #[must_use]
    pub const fn versions(&self) -> ChangeTrackingVersions {
        ChangeTrackingVersions {
            entity_version: self.entity_version,
            grant_records_version: self.grant_records_version,
        }
    }

    /// True when this entity can receive privileges.
    #[must_use]
    pub const fn is_grantee(&self) -> bool {
        self.entity_type.is_grantee()
    }

    /// True for the bootstrap entities that must never be dropped or
    /// renamed through the public contract: the root container, the root
    /// principal, the service-admin role and each catalog's admin role.
    /// The catalog-drop path removes the last admin role internally,
    /// bypassing this check.
    #[must_use]
    pub fn cannot_be_dropped_or_renamed(&self) -> bool {
        match self.entity_type {
            EntityType::Root => true,
            EntityType::Principal => {
                self.catalog_id == NULL_ID && self.name == ROOT_PRINCIPAL_NAME
            }
            EntityType::PrincipalRole => self.name == SERVICE_ADMIN_ROLE_NAME,
            EntityType::CatalogRole => self.name == CATALOG_ADMIN_ROLE_NAME,
            _ => false,
        }
    }

    /// Reads an internal property.
    #[must_use]
    pub fn internal_property(&self, key: &str) -> Option<&str> {
        self.internal_properties.get(key).map(String::as_str)
    }
}

/// Builds the root container entity for a realm.
#[must_use]
pub fn root_container() -> Entity {
    Entity::new(
        NULL_ID,
        ROOT_ENTITY_ID,
        EntityType::Root,
        EntitySubType::Null,
        ROOT_ENTITY_ID,
        ROOT_CONTAINER_NAME,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for entity_type in [
            EntityType::Root,
            EntityType::Principal,
            EntityType::PrincipalRole,
            EntityType::Catalog,
            EntityType::CatalogRole,
            EntityType::Namespace,
            EntityType::TableLike,
            EntityType::Task,
        ] {
            assert_eq!(EntityType::from_code(entity_type.code()), Some(entity_type));
        }
        assert_eq!(EntityType::from_code(99), None);
    }

    #[test]
    fn grantee_types() {
        assert!(EntityType::Principal.is_grantee());
        assert!(EntityType::PrincipalRole.is_grantee());
        assert!(EntityType::CatalogRole.is_grantee());
        assert!(!EntityType::Catalog.is_grantee());
        assert!(!EntityType::TableLike.is_grantee());
        assert!(!EntityType::Task.is_grantee());
    }

    #[test]
    fn bootstrap_entities_are_undroppable() {
        assert!(root_container().cannot_be_dropped_or_renamed());

        let root_principal = Entity::new(
            NULL_ID,
            42,
            EntityType::Principal,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            ROOT_PRINCIPAL_NAME,
        );
        assert!(root_principal.cannot_be_dropped_or_renamed());

        let other_principal = Entity::new(
            NULL_ID,
            43,
            EntityType::Principal,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            "etl-service",
        );
        assert!(!other_principal.cannot_be_dropped_or_renamed());

        let service_admin = Entity::new(
            NULL_ID,
            44,
            EntityType::PrincipalRole,
            EntitySubType::Null,
            ROOT_ENTITY_ID,
            SERVICE_ADMIN_ROLE_NAME,
        );
        assert!(service_admin.cannot_be_dropped_or_renamed());

        let catalog_admin = Entity::new(
            7,
            45,
            EntityType::CatalogRole,
            EntitySubType::Null,
            7,
            CATALOG_ADMIN_ROLE_NAME,
        );
        assert!(catalog_admin.cannot_be_dropped_or_renamed());
    }

    #[test]
    fn active_name_key_distinguishes_types_and_parents() {
        let table = Entity::new(7, 10, EntityType::TableLike, EntitySubType::Table, 9, "t");
        let view = Entity::new(7, 11, EntityType::TableLike, EntitySubType::View, 9, "t");
        // same type code: tables and views collide by name
        assert_eq!(table.active_name_key(), view.active_name_key());

        let other_parent = Entity::new(7, 12, EntityType::TableLike, EntitySubType::Table, 8, "t");
        assert_ne!(table.active_name_key(), other_parent.active_name_key());
    }

    #[test]
    fn entity_serde_round_trip() {
        let mut entity = Entity::new(7, 10, EntityType::Namespace, EntitySubType::Null, 7, "raw");
        entity
            .properties
            .insert("owner".to_string(), "data-eng".to_string());
        let json = serde_json::to_string(&entity).unwrap();
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(entity, back);
    }
}
